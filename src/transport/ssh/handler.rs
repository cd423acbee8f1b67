use russh::keys::{HashAlg, PublicKey};
use tracing::warn;

#[derive(Debug)]
pub(crate) enum HandlerError {
    Ssh(russh::Error),
    HostKeyMismatch { expected: String, actual: String },
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ssh(e) => write!(f, "{e}"),
            Self::HostKeyMismatch { expected, actual } => {
                write!(f, "host key mismatch: expected {expected}, got {actual}")
            }
        }
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Ssh(e) => Some(e),
            Self::HostKeyMismatch { .. } => None,
        }
    }
}

impl From<russh::Error> for HandlerError {
    fn from(value: russh::Error) -> Self {
        Self::Ssh(value)
    }
}

pub(crate) struct ClientHandler {
    addr: String,
    pinned_fingerprint: Option<String>,
}

impl ClientHandler {
    pub(crate) fn new(addr: String, pinned_fingerprint: Option<String>) -> Self {
        Self {
            addr,
            pinned_fingerprint,
        }
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = HandlerError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let actual = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        verify_host_key(&self.addr, self.pinned_fingerprint.as_deref(), actual)
    }
}

fn verify_host_key(addr: &str, pinned: Option<&str>, actual: String) -> Result<bool, HandlerError> {
    match pinned {
        Some(expected) if expected == actual => Ok(true),
        Some(expected) => Err(HandlerError::HostKeyMismatch {
            expected: expected.to_string(),
            actual,
        }),
        None => {
            warn!(addr, fingerprint = %actual, "accepting unpinned ssh host key");
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FP: &str = "SHA256:seqHQON9GLF0WTO3mt1K5y1jbkOnnkKDQWgK173kIDE";

    #[test]
    fn pinned_key_must_match() {
        assert!(verify_host_key("h:22", Some(FP), FP.to_string()).unwrap());

        let err = verify_host_key("h:22", Some(FP), "SHA256:other".to_string()).unwrap_err();
        match err {
            HandlerError::HostKeyMismatch { expected, actual } => {
                assert_eq!(expected, FP);
                assert_eq!(actual, "SHA256:other");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unpinned_key_is_accepted() {
        assert!(verify_host_key("h:22", None, FP.to_string()).unwrap());
    }
}
