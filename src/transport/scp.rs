//! Minimal single-file remote copy exchange, compatible with `scp -t`.
//!
//! Source side, after the sink signals readiness with a zero byte:
//!
//! ```text
//! -> C0644 <size> <name>\n
//! <- \0                      (or \1 / \2 followed by an error line)
//! -> <size bytes>\0
//! <- \0
//! ```

use std::io::{self, SeekFrom};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use crate::transport::copyable::Copyable;

const MAX_LINE_LEN: usize = 4096;

#[derive(Debug)]
pub enum CopyError {
    /// The sink answered with a warning (`fatal = false`) or fatal error.
    Remote { fatal: bool, message: String },
    Protocol(String),
    InvalidName(String),
    ShortRead { expected: u64, got: u64 },
    Io(io::Error),
}

impl std::fmt::Display for CopyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote { fatal: true, message } => write!(f, "remote fatal error: {message}"),
            Self::Remote {
                fatal: false,
                message,
            } => write!(f, "remote error: {message}"),
            Self::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            Self::InvalidName(name) => write!(f, "invalid file name {name:?}"),
            Self::ShortRead { expected, got } => {
                write!(f, "source ended early: expected {expected} bytes, got {got}")
            }
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for CopyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CopyError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Base name of a remote destination path, as announced in the header.
pub fn remote_file_name(dst: &str) -> Result<&str, CopyError> {
    let name = dst.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    validate_name(name)?;
    Ok(name)
}

fn validate_name(name: &str) -> Result<(), CopyError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\n', '\0']) {
        return Err(CopyError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Sends `src` as `name` to a sink speaking the copy protocol on `stream`.
pub async fn send_file<S>(
    stream: &mut S,
    src: &mut dyn Copyable,
    name: &str,
) -> Result<(), CopyError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    validate_name(name)?;
    read_ack(stream).await?;

    let size = src.size();
    let header = format!("C{:04o} {size} {name}\n", src.mode() & 0o7777);
    stream.write_all(header.as_bytes()).await?;
    stream.flush().await?;
    read_ack(stream).await?;

    if size > 0 {
        src.seek(SeekFrom::Start(0)).await?;
        let mut limited = (&mut *src).take(size);
        let copied = tokio::io::copy(&mut limited, stream).await?;
        if copied != size {
            return Err(CopyError::ShortRead {
                expected: size,
                got: copied,
            });
        }
    }

    stream.write_all(&[0]).await?;
    stream.flush().await?;
    read_ack(stream).await
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub mode: u32,
    pub name: String,
    pub contents: Vec<u8>,
}

/// Sink side of the exchange: accepts exactly one file.
pub async fn receive_file<S>(stream: &mut S) -> Result<ReceivedFile, CopyError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(&[0]).await?;
    stream.flush().await?;

    let line = read_line(stream).await?;
    let (mode, size, name) = match parse_header(&line) {
        Ok(parsed) => parsed,
        Err(err) => {
            let reply = format!("\x02{err}\n");
            stream.write_all(reply.as_bytes()).await?;
            stream.flush().await?;
            return Err(err);
        }
    };
    stream.write_all(&[0]).await?;
    stream.flush().await?;

    let mut contents = Vec::with_capacity(usize::try_from(size).unwrap_or(0).min(1 << 20));
    let got = (&mut *stream).take(size).read_to_end(&mut contents).await? as u64;
    if got != size {
        return Err(CopyError::ShortRead {
            expected: size,
            got,
        });
    }

    let mut end = [0u8; 1];
    stream.read_exact(&mut end).await?;
    if end[0] != 0 {
        return Err(CopyError::Protocol(format!(
            "expected end-of-file marker, got byte {:#04x}",
            end[0]
        )));
    }
    stream.write_all(&[0]).await?;
    stream.flush().await?;

    Ok(ReceivedFile {
        mode,
        name,
        contents,
    })
}

fn parse_header(line: &str) -> Result<(u32, u64, String), CopyError> {
    let rest = line
        .strip_prefix('C')
        .ok_or_else(|| CopyError::Protocol(format!("unsupported header {line:?}")))?;
    let mut parts = rest.splitn(3, ' ');
    let (Some(mode), Some(size), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(CopyError::Protocol(format!("malformed header {line:?}")));
    };
    let mode = u32::from_str_radix(mode, 8)
        .map_err(|_| CopyError::Protocol(format!("invalid mode {mode:?}")))?;
    let size = size
        .parse::<u64>()
        .map_err(|_| CopyError::Protocol(format!("invalid size {size:?}")))?;
    validate_name(name)?;
    Ok((mode, size, name.to_string()))
}

async fn read_ack<S>(stream: &mut S) -> Result<(), CopyError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut byte = [0u8; 1];
    if stream.read(&mut byte).await? == 0 {
        return Err(CopyError::Protocol(
            "stream closed while waiting for acknowledgment".to_string(),
        ));
    }
    match byte[0] {
        0 => Ok(()),
        code @ (1 | 2) => {
            let message = read_line(stream).await?;
            Err(CopyError::Remote {
                fatal: code == 2,
                message,
            })
        }
        other => Err(CopyError::Protocol(format!(
            "unexpected acknowledgment byte {other:#04x}"
        ))),
    }
}

async fn read_line<S>(stream: &mut S) -> Result<String, CopyError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if stream.read(&mut byte).await? == 0 || byte[0] == b'\n' {
            break;
        }
        if line.len() >= MAX_LINE_LEN {
            return Err(CopyError::Protocol("protocol line too long".to_string()));
        }
        line.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}
