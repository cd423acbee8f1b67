//! Remote execution capability shared by every backend.
//!
//! A [`Transport`] runs shell commands on one remote host, streams their
//! output, and copies single files to it. SSH is the concrete backend; the
//! [`scripted`] backend answers from in-memory rules.

use std::{future::Future, io, pin::Pin};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::oneshot,
};

use crate::context::{Context, ContextError};

pub mod command;
pub mod copyable;
pub mod scp;
pub mod scripted;
pub mod ssh;

pub use command::{Command, shell_quote};
pub use copyable::{BytesCopyable, Copyable, FileCopyable};
pub use scp::CopyError;
pub use ssh::{LivenessError, SshOptions, SshOptionsError, SshTransport};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type OutputPipe = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Ssh,
    Kubernetes,
    Nomad,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ssh => "ssh",
            Self::Kubernetes => "kubernetes",
            Self::Nomad => "nomad",
        }
    }

    /// How services are supervised on hosts reached through this kind of
    /// transport. Orchestrated workloads have no host-level manager.
    pub fn process_manager(self) -> Option<ProcessManager> {
        match self {
            Self::Ssh => Some(ProcessManager::Systemd),
            Self::Kubernetes | Self::Nomad => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessManager {
    Systemd,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A remote command exited with a non-zero status.
///
/// `output` is filled by [`Transport::run`]. It stays empty when the command
/// was streamed, since the caller consumed the pipes itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecError {
    pub exit_code: u32,
    pub output: ExecOutput,
}

impl ExecError {
    pub fn new(exit_code: u32) -> Self {
        Self {
            exit_code,
            output: ExecOutput::default(),
        }
    }
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "command exited with code {}", self.exit_code)?;
        let stderr = self.output.stderr.trim();
        if !stderr.is_empty() {
            write!(f, ": {stderr}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ExecError {}

#[derive(Debug)]
pub enum TransportError {
    Context(ContextError),
    Connect { addr: String, message: String },
    Auth { user: String, message: String },
    HostKey {
        addr: String,
        expected: String,
        actual: String,
    },
    Options(SshOptionsError),
    Session(String),
    Disconnected(String),
    Exec(ExecError),
    Copy(CopyError),
    Io(io::Error),
    Closed,
}

impl TransportError {
    pub fn exit_code(&self) -> Option<u32> {
        match self {
            Self::Exec(e) => Some(e.exit_code),
            _ => None,
        }
    }

    pub fn context_error(&self) -> Option<ContextError> {
        match self {
            Self::Context(e) => Some(*e),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Context(e) => write!(f, "{e}"),
            Self::Connect { addr, message } => write!(f, "connect to {addr}: {message}"),
            Self::Auth { user, message } => write!(f, "authenticate as {user}: {message}"),
            Self::HostKey {
                addr,
                expected,
                actual,
            } => write!(
                f,
                "host key of {addr} does not match: expected {expected}, got {actual}"
            ),
            Self::Options(e) => write!(f, "invalid ssh options: {e}"),
            Self::Session(msg) => write!(f, "session: {msg}"),
            Self::Disconnected(msg) => write!(f, "connection lost: {msg}"),
            Self::Exec(e) => write!(f, "{e}"),
            Self::Copy(e) => write!(f, "copy: {e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Closed => write!(f, "transport is closed"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Context(e) => Some(e),
            Self::Exec(e) => Some(e),
            Self::Copy(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Options(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ContextError> for TransportError {
    fn from(value: ContextError) -> Self {
        Self::Context(value)
    }
}

impl From<io::Error> for TransportError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<SshOptionsError> for TransportError {
    fn from(value: SshOptionsError) -> Self {
        Self::Options(value)
    }
}

impl From<CopyError> for TransportError {
    fn from(value: CopyError) -> Self {
        Self::Copy(value)
    }
}

/// Live output of a running remote command.
///
/// `done` yields exactly one value once the process has exited and both
/// pipes have been fed everything it wrote.
pub struct ExecStream {
    pub stdout: OutputPipe,
    pub stderr: OutputPipe,
    pub done: oneshot::Receiver<Result<(), TransportError>>,
}

impl ExecStream {
    pub async fn wait(
        done: oneshot::Receiver<Result<(), TransportError>>,
    ) -> Result<(), TransportError> {
        done.await.unwrap_or_else(|_| {
            Err(TransportError::Session(
                "command task ended without reporting an exit status".to_string(),
            ))
        })
    }
}

pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn stream<'a>(
        &'a self,
        ctx: &'a Context,
        cmd: &'a Command,
    ) -> BoxFuture<'a, Result<ExecStream, TransportError>>;

    fn run<'a>(
        &'a self,
        ctx: &'a Context,
        cmd: &'a Command,
    ) -> BoxFuture<'a, Result<ExecOutput, TransportError>> {
        Box::pin(async move {
            let stream = self.stream(ctx, cmd).await?;
            collect_output(ctx, stream).await
        })
    }

    /// Copies exactly one file. The caller keeps ownership of `src`.
    fn copy<'a>(
        &'a self,
        ctx: &'a Context,
        src: &'a mut dyn Copyable,
        dst: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Releases held resources. Safe to call more than once.
    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>>;
}

/// Drains both pipes concurrently, then waits for the exit status.
///
/// Reading the pipes one after the other could deadlock: a command blocked
/// on a full stderr buffer never closes stdout.
pub async fn collect_output(
    ctx: &Context,
    stream: ExecStream,
) -> Result<ExecOutput, TransportError> {
    let ExecStream {
        mut stdout,
        mut stderr,
        done,
    } = stream;

    let drained = async {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let (out_res, err_res) = tokio::join!(
            stdout.read_to_end(&mut out),
            stderr.read_to_end(&mut err)
        );
        out_res?;
        err_res?;
        let status = ExecStream::wait(done).await;
        Ok::<_, TransportError>((out, err, status))
    };

    let (out, err, status) = ctx.run(drained).await??;
    let output = ExecOutput {
        stdout: trim_trailing_newline(String::from_utf8_lossy(&out).into_owned()),
        stderr: trim_trailing_newline(String::from_utf8_lossy(&err).into_owned()),
    };

    match status {
        Ok(()) => Ok(output),
        Err(TransportError::Exec(e)) => Err(TransportError::Exec(ExecError {
            exit_code: e.exit_code,
            output,
        })),
        Err(e) => Err(e),
    }
}

fn trim_trailing_newline(mut s: String) -> String {
    if s.ends_with('\n') {
        s.pop();
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use tokio::io::AsyncWriteExt;

    fn pipe_with(bytes: &'static [u8]) -> OutputPipe {
        Box::pin(bytes)
    }

    #[test]
    fn trims_at_most_one_newline() {
        assert_eq!(trim_trailing_newline("ok\n\n".to_string()), "ok\n");
        assert_eq!(trim_trailing_newline("ok\n".to_string()), "ok");
        assert_eq!(trim_trailing_newline("ok".to_string()), "ok");
        assert_eq!(trim_trailing_newline(String::new()), "");
    }

    #[test]
    fn ssh_hosts_are_managed_by_systemd() {
        assert_eq!(
            TransportKind::Ssh.process_manager(),
            Some(ProcessManager::Systemd)
        );
        assert_eq!(TransportKind::Kubernetes.process_manager(), None);
        assert_eq!(TransportKind::Nomad.as_str(), "nomad");
    }

    #[tokio::test]
    async fn collect_attaches_output_to_exec_error() {
        let (tx, done) = oneshot::channel();
        tx.send(Err(TransportError::Exec(ExecError::new(3)))).unwrap();
        let stream = ExecStream {
            stdout: pipe_with(b"partial\n"),
            stderr: pipe_with(b"boom\n"),
            done,
        };

        let err = collect_output(&Context::background(), stream)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        match err {
            TransportError::Exec(e) => {
                assert_eq!(e.output.stdout, "partial");
                assert_eq!(e.output.stderr, "boom");
                assert_eq!(e.to_string(), "command exited with code 3: boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn collect_drains_large_stderr_while_stdout_is_open() {
        let (mut out_w, out_r) = tokio::io::duplex(64);
        let (mut err_w, err_r) = tokio::io::duplex(64);
        let (tx, done) = oneshot::channel();

        // Fill stderr far beyond the pipe buffer before stdout is closed.
        tokio::spawn(async move {
            err_w.write_all(&vec![b'e'; 64 * 1024]).await.unwrap();
            drop(err_w);
            out_w.write_all(b"done\n").await.unwrap();
            drop(out_w);
            let _ = tx.send(Ok(()));
        });

        let stream = ExecStream {
            stdout: Box::pin(out_r),
            stderr: Box::pin(err_r),
            done,
        };
        let out = collect_output(&Context::background(), stream)
            .await
            .unwrap();
        assert_eq!(out.stdout, "done");
        assert_eq!(out.stderr.len(), 64 * 1024);
    }

    #[tokio::test]
    async fn collect_reports_missing_status() {
        let (tx, done) = oneshot::channel::<Result<(), TransportError>>();
        drop(tx);
        let stream = ExecStream {
            stdout: pipe_with(b""),
            stderr: pipe_with(b""),
            done,
        };
        let err = collect_output(&Context::background(), stream)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Session(_)));
    }
}
