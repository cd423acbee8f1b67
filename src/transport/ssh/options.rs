use std::{
    fmt,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use russh::keys::PrivateKey;

pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_DIAL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_KEEPALIVE_MAX_FAILURES: u32 = 3;
pub const DEFAULT_SESSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

const AGENT_SOCKET_ENV: &str = "SSH_AUTH_SOCK";

#[derive(Clone)]
pub enum PrivateKeySource {
    Pem(String),
    Path(PathBuf),
}

/// Connection settings for [`super::SshTransport`].
///
/// Credentials are only ever taken from these options. The agent socket is
/// the one value read from the process environment.
#[derive(Clone)]
pub struct SshOptions {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) user: String,
    pub(crate) password: Option<String>,
    pub(crate) private_key: Option<PrivateKeySource>,
    pub(crate) passphrase: Option<String>,
    pub(crate) use_agent: bool,
    pub(crate) host_key_fingerprint: Option<String>,
    /// Wall-clock budget for establishing the connection, all dial attempts
    /// included.
    pub(crate) connect_timeout: Duration,
    pub(crate) dial_interval: Duration,
    pub(crate) dial_timeout: Duration,
    pub(crate) keepalive_interval: Duration,
    pub(crate) keepalive_max_failures: u32,
    pub(crate) session_check_timeout: Duration,
}

impl fmt::Debug for SshOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|k| match k {
                PrivateKeySource::Pem(_) => "<pem>".to_string(),
                PrivateKeySource::Path(p) => p.display().to_string(),
            }))
            .field("use_agent", &self.use_agent)
            .field("host_key_fingerprint", &self.host_key_fingerprint)
            .field("connect_timeout", &self.connect_timeout)
            .field("dial_interval", &self.dial_interval)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("keepalive_max_failures", &self.keepalive_max_failures)
            .finish_non_exhaustive()
    }
}

impl SshOptions {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            user: user.into(),
            password: None,
            private_key: None,
            passphrase: None,
            use_agent: false,
            host_key_fingerprint: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            dial_interval: DEFAULT_DIAL_INTERVAL,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_max_failures: DEFAULT_KEEPALIVE_MAX_FAILURES,
            session_check_timeout: DEFAULT_SESSION_CHECK_TIMEOUT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_private_key_pem(mut self, pem: impl Into<String>) -> Self {
        self.private_key = Some(PrivateKeySource::Pem(pem.into()));
        self
    }

    pub fn with_private_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key = Some(PrivateKeySource::Path(path.into()));
        self
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn with_agent(mut self, enabled: bool) -> Self {
        self.use_agent = enabled;
        self
    }

    /// Pins the server key, e.g. `SHA256:seqHQON9...`.
    pub fn with_host_key_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.host_key_fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_dial_interval(mut self, interval: Duration) -> Self {
        self.dial_interval = interval;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_keepalive(mut self, interval: Duration, max_failures: u32) -> Self {
        self.keepalive_interval = interval;
        self.keepalive_max_failures = max_failures;
        self
    }

    pub fn with_session_check_timeout(mut self, timeout: Duration) -> Self {
        self.session_check_timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn validate(&self) -> Result<(), SshOptionsError> {
        if self.host.trim().is_empty() {
            return Err(SshOptionsError::EmptyHost);
        }
        if self.user.trim().is_empty() {
            return Err(SshOptionsError::EmptyUser);
        }
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("dial_interval", self.dial_interval),
            ("dial_timeout", self.dial_timeout),
            ("keepalive_interval", self.keepalive_interval),
            ("session_check_timeout", self.session_check_timeout),
        ] {
            if value.is_zero() {
                return Err(SshOptionsError::ZeroDuration(name));
            }
        }
        if self.keepalive_max_failures == 0 {
            return Err(SshOptionsError::ZeroKeepaliveFailures);
        }
        if let Some(fp) = &self.host_key_fingerprint
            && (!fp.starts_with("SHA256:") || fp.len() <= "SHA256:".len())
        {
            return Err(SshOptionsError::InvalidFingerprint(fp.clone()));
        }
        Ok(())
    }

    /// Assembles the authentication methods once, in the order password,
    /// agent, private key.
    pub(crate) fn auth_methods(&self) -> Result<Vec<AuthMethod>, SshOptionsError> {
        let agent_socket = self
            .use_agent
            .then(|| std::env::var_os(AGENT_SOCKET_ENV))
            .flatten()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        self.assemble_auth(agent_socket)
    }

    fn assemble_auth(
        &self,
        agent_socket: Option<PathBuf>,
    ) -> Result<Vec<AuthMethod>, SshOptionsError> {
        let mut methods = Vec::new();

        if let Some(password) = &self.password {
            methods.push(AuthMethod::Password(password.clone()));
        }
        if self.use_agent {
            match agent_socket {
                Some(path) => methods.push(AuthMethod::Agent(path)),
                None => tracing::warn!(
                    env = AGENT_SOCKET_ENV,
                    "ssh agent requested but no agent socket is set; skipping"
                ),
            }
        }
        if let Some(source) = &self.private_key {
            let key = load_private_key(source, self.passphrase.as_deref())?;
            methods.push(AuthMethod::PublicKey(Arc::new(key)));
        }

        if methods.is_empty() {
            return Err(SshOptionsError::NoAuthMethod);
        }
        Ok(methods)
    }
}

fn load_private_key(
    source: &PrivateKeySource,
    passphrase: Option<&str>,
) -> Result<PrivateKey, SshOptionsError> {
    match source {
        PrivateKeySource::Pem(pem) => russh::keys::decode_secret_key(pem, passphrase)
            .map_err(|e| SshOptionsError::PrivateKey {
                origin: "inline key".to_string(),
                message: e.to_string(),
            }),
        PrivateKeySource::Path(path) => {
            russh::keys::load_secret_key(path, passphrase).map_err(|e| SshOptionsError::PrivateKey {
                origin: path.display().to_string(),
                message: e.to_string(),
            })
        }
    }
}

#[derive(Clone)]
pub(crate) enum AuthMethod {
    Password(String),
    Agent(PathBuf),
    PublicKey(Arc<PrivateKey>),
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl AuthMethod {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Password(_) => "password",
            Self::Agent(_) => "agent",
            Self::PublicKey(_) => "publickey",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshOptionsError {
    EmptyHost,
    EmptyUser,
    NoAuthMethod,
    ZeroDuration(&'static str),
    ZeroKeepaliveFailures,
    InvalidFingerprint(String),
    PrivateKey { origin: String, message: String },
}

impl fmt::Display for SshOptionsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyHost => write!(f, "ssh host must not be empty"),
            Self::EmptyUser => write!(f, "ssh user must not be empty"),
            Self::NoAuthMethod => write!(
                f,
                "no ssh authentication method configured (password, agent or private key)"
            ),
            Self::ZeroDuration(name) => write!(f, "{name} must be greater than zero"),
            Self::ZeroKeepaliveFailures => {
                write!(f, "keepalive failure threshold must be at least 1")
            }
            Self::InvalidFingerprint(fp) => {
                write!(f, "invalid host key fingerprint {fp:?}: expected SHA256:<base64>")
            }
            Self::PrivateKey { origin, message } => {
                write!(f, "load private key from {origin}: {message}")
            }
        }
    }
}

impl std::error::Error for SshOptionsError {}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    const TEST_KEY: &str = include_str!("testdata/id_ed25519");

    fn names(methods: &[AuthMethod]) -> Vec<&'static str> {
        methods.iter().map(AuthMethod::name).collect()
    }

    #[test]
    fn defaults() {
        let opts = SshOptions::new("10.0.0.5", "ubuntu");
        assert_eq!(opts.addr(), "10.0.0.5:22");
        assert_eq!(opts.keepalive_max_failures, 3);
        assert_eq!(opts.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert!(opts.dial_interval < opts.connect_timeout);
    }

    #[test]
    fn ipv6_addr_is_bracketed() {
        let opts = SshOptions::new("fd00::1", "root").with_port(2222);
        assert_eq!(opts.addr(), "[fd00::1]:2222");
    }

    #[test]
    fn auth_methods_keep_fixed_order() {
        let opts = SshOptions::new("h", "u")
            .with_private_key_pem(TEST_KEY)
            .with_agent(true)
            .with_password("pw");
        let methods = opts
            .assemble_auth(Some(PathBuf::from("/tmp/agent.sock")))
            .unwrap();
        assert_eq!(names(&methods), vec!["password", "agent", "publickey"]);
    }

    #[test]
    fn agent_without_socket_is_skipped() {
        let opts = SshOptions::new("h", "u").with_agent(true).with_password("pw");
        let methods = opts.assemble_auth(None).unwrap();
        assert_eq!(names(&methods), vec!["password"]);

        let agent_only = SshOptions::new("h", "u").with_agent(true);
        assert_eq!(
            agent_only.assemble_auth(None).unwrap_err(),
            SshOptionsError::NoAuthMethod
        );
    }

    #[test]
    fn key_file_is_loaded() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("id_ed25519");
        std::fs::write(&path, TEST_KEY).unwrap();

        let opts = SshOptions::new("h", "u").with_private_key_file(&path);
        assert_eq!(names(&opts.assemble_auth(None).unwrap()), vec!["publickey"]);
    }

    #[test]
    fn garbage_key_is_rejected() {
        let opts = SshOptions::new("h", "u").with_private_key_pem("not a key");
        let err = opts.assemble_auth(None).unwrap_err();
        assert!(matches!(err, SshOptionsError::PrivateKey { .. }), "{err}");
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert_eq!(
            SshOptions::new("", "u").validate().unwrap_err(),
            SshOptionsError::EmptyHost
        );
        assert_eq!(
            SshOptions::new("h", " ").validate().unwrap_err(),
            SshOptionsError::EmptyUser
        );
        assert_eq!(
            SshOptions::new("h", "u")
                .with_dial_interval(Duration::ZERO)
                .validate()
                .unwrap_err(),
            SshOptionsError::ZeroDuration("dial_interval")
        );
        assert_eq!(
            SshOptions::new("h", "u")
                .with_keepalive(Duration::from_secs(1), 0)
                .validate()
                .unwrap_err(),
            SshOptionsError::ZeroKeepaliveFailures
        );
        assert!(matches!(
            SshOptions::new("h", "u")
                .with_host_key_fingerprint("MD5:aa:bb")
                .validate(),
            Err(SshOptionsError::InvalidFingerprint(_))
        ));
        assert!(
            SshOptions::new("h", "u")
                .with_host_key_fingerprint("SHA256:seqHQON9GLF0WTO3mt1K5y1jbkOnnkKDQWgK173kIDE")
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn debug_redacts_password() {
        let opts = SshOptions::new("h", "u").with_password("hunter2");
        let dbg = format!("{opts:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("<redacted>"));
    }
}
