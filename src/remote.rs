//! Reads of remote state shared by the product modules.

use serde::de::DeserializeOwned;

use crate::{
    context::Context,
    retry::RetryError,
    transport::{Command, Transport, TransportError, shell_quote},
};

const SECRET_HEADER_ENV: &str = "VIGIL_HTTP_SECRET";

#[derive(Debug)]
pub enum FetchError {
    Transport(TransportError),
    Decode {
        what: String,
        source: serde_json::Error,
    },
    Http {
        url: String,
        code: u16,
        body: String,
    },
    Malformed {
        what: String,
        message: String,
    },
}

impl FetchError {
    pub fn exit_code(&self) -> Option<u32> {
        match self {
            Self::Transport(e) => e.exit_code(),
            _ => None,
        }
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{e}"),
            Self::Decode { what, source } => write!(f, "decode {what}: {source}"),
            Self::Http { url, code, body } => {
                write!(f, "GET {url} returned HTTP {code}")?;
                let body = body.trim();
                if !body.is_empty() {
                    write!(f, ": {body}")?;
                }
                Ok(())
            }
            Self::Malformed { what, message } => write!(f, "malformed {what}: {message}"),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Decode { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<TransportError> for FetchError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

/// The error of a field fetch after its retrier gave up.
pub type FieldError = RetryError<FetchError>;

pub fn decode_json<T: DeserializeOwned>(what: &str, body: &str) -> Result<T, FetchError> {
    serde_json::from_str(body).map_err(|source| FetchError::Decode {
        what: what.to_string(),
        source,
    })
}

pub async fn run_json<T: DeserializeOwned>(
    ctx: &Context,
    transport: &dyn Transport,
    cmd: &Command,
) -> Result<T, FetchError> {
    let out = transport.run(ctx, cmd).await?;
    decode_json(cmd.text(), &out.stdout)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub code: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// An HTTP GET issued with `curl` on the remote host, so that services
/// bound to loopback are reachable.
#[derive(Debug, Clone)]
pub struct HttpGet {
    url: String,
    secret_header: Option<(String, String)>,
}

impl HttpGet {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            secret_header: None,
        }
    }

    /// The value travels in the command environment and never appears in
    /// the command text.
    pub fn with_secret_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secret_header = Some((name.into(), value.into()));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn command(&self) -> Command {
        let header = match &self.secret_header {
            Some((name, _)) => format!("--header \"{name}: ${SECRET_HEADER_ENV}\" "),
            None => String::new(),
        };
        let text = format!(
            "curl --silent --show-error --write-out '\\n%{{http_code}}' {header}{}",
            shell_quote(&self.url)
        );
        let cmd = Command::new(text);
        match &self.secret_header {
            Some((_, value)) => cmd.with_env(SECRET_HEADER_ENV, value.as_str()),
            None => cmd,
        }
    }

    pub async fn send(
        &self,
        ctx: &Context,
        transport: &dyn Transport,
    ) -> Result<HttpResponse, FetchError> {
        let out = transport.run(ctx, &self.command()).await?;
        parse_curl_output(&self.url, &out.stdout)
    }

    /// Sends the request and decodes a 2xx body.
    pub async fn json<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        transport: &dyn Transport,
    ) -> Result<T, FetchError> {
        let resp = self.send(ctx, transport).await?;
        if !resp.is_success() {
            return Err(FetchError::Http {
                url: self.url.clone(),
                code: resp.code,
                body: resp.body,
            });
        }
        decode_json(&self.url, &resp.body)
    }
}

/// Splits `<body>\n<status code>` as written by `--write-out`.
fn parse_curl_output(url: &str, stdout: &str) -> Result<HttpResponse, FetchError> {
    let (body, code) = stdout.rsplit_once('\n').unwrap_or(("", stdout));
    let code = code
        .trim()
        .parse::<u16>()
        .map_err(|_| FetchError::Malformed {
            what: format!("response from {url}"),
            message: format!("no status code in {:?}", code.trim()),
        })?;
    Ok(HttpResponse {
        code,
        body: body.to_string(),
    })
}
