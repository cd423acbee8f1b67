//! SSH backend built on `russh`.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use russh::{
    ChannelMsg, Disconnect,
    client::{self, Handle, Msg},
    keys::PrivateKeyWithHashAlg,
};
use tokio::{
    io::{AsyncWriteExt, DuplexStream},
    sync::{Mutex, broadcast, oneshot, watch},
    task::JoinSet,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    context::Context,
    retry::{Interval, Retrier},
    transport::{
        BoxFuture, Command, CopyError, Copyable, ExecError, ExecStream, Transport,
        TransportError, TransportKind, scp, shell_quote,
    },
};

mod handler;
pub mod keepalive;
pub mod options;

use handler::{ClientHandler, HandlerError};
use keepalive::{KeepaliveOptions, KeepaliveTarget, LivenessSnapshot};
use options::AuthMethod;

pub use keepalive::LivenessError;
pub use options::{SshOptions, SshOptionsError};

const SESSION_CHECK_RETRIES: u32 = 3;
const SESSION_CHECK_INTERVAL: Duration = Duration::from_millis(250);
const SESSION_CHECK_ENV: &str = "VIGIL_SESSION_CHECK";
const PIPE_BUFFER: usize = 64 * 1024;
const LIVENESS_CHANNEL_CAPACITY: usize = 8;

type SshHandle = Handle<ClientHandler>;

struct Client {
    handle: Arc<SshHandle>,
    /// Done once this connection is lost or closed.
    conn: Context,
    liveness: watch::Receiver<LivenessSnapshot>,
    keepalive: tokio::task::JoinHandle<()>,
}

impl Client {
    fn is_alive(&self) -> bool {
        !self.handle.is_closed() && !self.liveness.borrow().is_lost()
    }

    async fn disconnect(self) {
        self.conn.cancel();
        if let Err(err) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(error = %err, "ssh disconnect failed");
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.keepalive.abort();
        self.conn.cancel();
    }
}

impl KeepaliveTarget for SshHandle {
    /// Opening a session waits for the server's confirmation, so a reply
    /// proves the peer is still processing requests.
    fn ping(&self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            if self.is_closed() {
                return Err("connection closed".to_string());
            }
            let channel = self
                .channel_open_session()
                .await
                .map_err(|e| format!("open keepalive session: {e}"))?;
            let _ = channel.close().await;
            Ok(())
        })
    }

    fn drop_connection(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(err) = self.disconnect(Disconnect::ByApplication, "", "en").await {
                debug!(error = %err, "ssh disconnect after keepalive loss failed");
            }
        })
    }
}

/// An established connection, valid until `conn` is done.
struct Link {
    handle: Arc<SshHandle>,
    conn: Context,
}

impl Link {
    async fn run<F: Future>(&self, ctx: &Context, fut: F) -> Result<F::Output, TransportError> {
        tokio::select! {
            biased;
            reason = ctx.done() => Err(TransportError::Context(reason)),
            _ = self.conn.done() => Err(TransportError::Disconnected(
                "connection dropped during the operation".to_string(),
            )),
            out = fut => Ok(out),
        }
    }
}

/// Runs commands and copies files on one host over SSH.
///
/// The connection is dialed on first use and redialed after it was lost.
/// Exec and copy operations are serialized; a streamed command holds the
/// connection until it exits.
pub struct SshTransport {
    opts: Arc<SshOptions>,
    auth: Arc<Vec<AuthMethod>>,
    client: Mutex<Option<Client>>,
    ops: Arc<Mutex<()>>,
    lost_tx: broadcast::Sender<LivenessError>,
    closed: AtomicBool,
    /// Canceled by `close`; aborts a dial in progress and every connection.
    shutdown: Context,
}

impl SshTransport {
    /// Validates the options and assembles authentication. Does not dial.
    pub fn new(opts: SshOptions) -> Result<Self, SshOptionsError> {
        opts.validate()?;
        let auth = opts.auth_methods()?;
        let (lost_tx, _) = broadcast::channel(LIVENESS_CHANNEL_CAPACITY);

        Ok(Self {
            opts: Arc::new(opts),
            auth: Arc::new(auth),
            client: Mutex::new(None),
            ops: Arc::new(Mutex::new(())),
            lost_tx,
            closed: AtomicBool::new(false),
            shutdown: Context::background(),
        })
    }

    pub async fn connect(ctx: &Context, opts: SshOptions) -> Result<Self, TransportError> {
        let transport = Self::new(opts)?;
        transport.ensure_client(ctx).await?;
        Ok(transport)
    }

    /// Liveness failures of the current and any later connection. Callers
    /// should close the transport, or let the next operation redial.
    pub fn liveness(&self) -> broadcast::Receiver<LivenessError> {
        self.lost_tx.subscribe()
    }

    pub async fn liveness_snapshot(&self) -> Option<LivenessSnapshot> {
        let guard = self.client.lock().await;
        guard.as_ref().map(|c| c.liveness.borrow().clone())
    }

    async fn ensure_client(&self, ctx: &Context) -> Result<Link, TransportError> {
        let mut guard = ctx.run(self.client.lock()).await?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        if let Some(client) = guard.as_ref()
            && client.is_alive()
        {
            return Ok(Link {
                handle: client.handle.clone(),
                conn: client.conn.clone(),
            });
        }
        if let Some(stale) = guard.take() {
            info!(addr = %self.opts.addr(), "ssh connection lost; redialing");
            stale.disconnect().await;
        }

        // `close` cancels `shutdown` before it takes the lock held here.
        let dialed = tokio::select! {
            res = dial(ctx, &self.opts, &self.auth) => res,
            _ = self.shutdown.done() => Err(TransportError::Closed),
        };
        let handle = Arc::new(dialed?);
        let conn = self.shutdown.child();
        let (liveness, keepalive) = keepalive::spawn_keepalive(
            handle.clone(),
            KeepaliveOptions {
                addr: self.opts.addr(),
                interval: self.opts.keepalive_interval,
                fails_before_lost: self.opts.keepalive_max_failures,
                conn: conn.clone(),
            },
            self.lost_tx.clone(),
        );
        info!(addr = %self.opts.addr(), user = %self.opts.user, "ssh connection established");

        *guard = Some(Client {
            handle: handle.clone(),
            conn: conn.clone(),
            liveness,
            keepalive,
        });
        Ok(Link { handle, conn })
    }

    /// Opens a session and proves it answers requests before handing it out.
    async fn open_checked_session(
        &self,
        ctx: &Context,
        handle: &SshHandle,
    ) -> Result<russh::Channel<Msg>, TransportError> {
        let check_ctx = ctx.with_timeout(self.opts.session_check_timeout);
        let retrier = Retrier::<TransportError>::new()
            .with_max_retries(SESSION_CHECK_RETRIES)
            .with_interval(Interval::Fixed(SESSION_CHECK_INTERVAL));

        match retrier.run(&check_ctx, || check_session(handle)).await {
            Ok(channel) => Ok(channel),
            Err(err) => {
                if let Some(reason) = ctx.err() {
                    return Err(TransportError::Context(reason));
                }
                Err(TransportError::Session(format!(
                    "session health check failed: {err}"
                )))
            }
        }
    }
}

async fn check_session(handle: &SshHandle) -> Result<russh::Channel<Msg>, TransportError> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| TransportError::Session(format!("open session: {e}")))?;
    if let Err(err) = channel.set_env(true, SESSION_CHECK_ENV, "1").await {
        let _ = channel.close().await;
        return Err(TransportError::Session(format!("send session check: {err}")));
    }

    // Servers commonly refuse env requests; a refusal is still a round trip.
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success | ChannelMsg::Failure) => return Ok(channel),
            Some(ChannelMsg::Eof | ChannelMsg::Close) | None => {
                let _ = channel.close().await;
                return Err(TransportError::Session(
                    "session closed during health check".to_string(),
                ));
            }
            Some(_) => {}
        }
    }
}

/// Dials on a fixed period until one attempt succeeds or the connect budget
/// runs out. Attempts overlap; the first authenticated connection wins and
/// the remaining attempts are aborted.
async fn dial(
    ctx: &Context,
    opts: &Arc<SshOptions>,
    auth: &Arc<Vec<AuthMethod>>,
) -> Result<SshHandle, TransportError> {
    let addr = opts.addr();
    let config = Arc::new(client::Config {
        inactivity_timeout: None,
        ..Default::default()
    });

    let budget = tokio::time::sleep(opts.connect_timeout);
    tokio::pin!(budget);
    let mut ticker = tokio::time::interval(opts.dial_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut attempts = JoinSet::new();
    let mut started: u32 = 0;
    let mut last_err: Option<TransportError> = None;

    loop {
        tokio::select! {
            biased;
            reason = ctx.done() => return Err(TransportError::Context(reason)),
            _ = &mut budget => {
                let detail = last_err
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no attempt completed".to_string());
                return Err(TransportError::Connect {
                    addr,
                    message: format!(
                        "gave up after {:?} and {started} attempts: {detail}",
                        opts.connect_timeout
                    ),
                });
            }
            Some(joined) = attempts.join_next() => match joined {
                Ok(Ok(handle)) => {
                    debug!(addr = %addr, attempts = started, "ssh dial succeeded");
                    return Ok(handle);
                }
                Ok(Err(err @ (TransportError::Auth { .. } | TransportError::HostKey { .. }))) => {
                    return Err(err);
                }
                Ok(Err(err)) => {
                    debug!(addr = %addr, error = %err, "ssh dial attempt failed");
                    last_err = Some(err);
                }
                Err(err) => {
                    warn!(addr = %addr, error = %err, "ssh dial task failed");
                    last_err = Some(TransportError::Session(err.to_string()));
                }
            },
            _ = ticker.tick() => {
                started = started.saturating_add(1);
                attempts.spawn(dial_once(config.clone(), opts.clone(), auth.clone()));
            }
        }
    }
}

async fn dial_once(
    config: Arc<client::Config>,
    opts: Arc<SshOptions>,
    auth: Arc<Vec<AuthMethod>>,
) -> Result<SshHandle, TransportError> {
    let addr = opts.addr();
    let handler = ClientHandler::new(addr.clone(), opts.host_key_fingerprint.clone());
    let connecting = client::connect(config, (opts.host.as_str(), opts.port), handler);

    let mut handle = match tokio::time::timeout(opts.dial_timeout, connecting).await {
        Err(_) => {
            return Err(TransportError::Connect {
                addr,
                message: format!("handshake timed out after {:?}", opts.dial_timeout),
            });
        }
        Ok(Err(HandlerError::HostKeyMismatch { expected, actual })) => {
            return Err(TransportError::HostKey {
                addr,
                expected,
                actual,
            });
        }
        Ok(Err(err)) => {
            return Err(TransportError::Connect {
                addr,
                message: err.to_string(),
            });
        }
        Ok(Ok(handle)) => handle,
    };

    authenticate(&mut handle, &opts.user, &auth).await?;
    Ok(handle)
}

async fn authenticate(
    handle: &mut SshHandle,
    user: &str,
    methods: &[AuthMethod],
) -> Result<(), TransportError> {
    let mut failures = Vec::with_capacity(methods.len());
    for method in methods {
        match try_auth_method(handle, user, method).await {
            Ok(true) => {
                debug!(user, method = method.name(), "ssh authentication succeeded");
                return Ok(());
            }
            Ok(false) => failures.push(format!("{}: rejected", method.name())),
            Err(msg) => failures.push(format!("{}: {msg}", method.name())),
        }
    }
    Err(TransportError::Auth {
        user: user.to_string(),
        message: failures.join("; "),
    })
}

async fn try_auth_method(
    handle: &mut SshHandle,
    user: &str,
    method: &AuthMethod,
) -> Result<bool, String> {
    match method {
        AuthMethod::Password(password) => handle
            .authenticate_password(user, password.as_str())
            .await
            .map(|res| res.success())
            .map_err(|e| e.to_string()),
        AuthMethod::PublicKey(key) => handle
            .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key.clone(), None))
            .await
            .map(|res| res.success())
            .map_err(|e| e.to_string()),
        AuthMethod::Agent(socket) => try_agent(handle, user, socket).await,
    }
}

#[cfg(unix)]
async fn try_agent(
    handle: &mut SshHandle,
    user: &str,
    socket: &std::path::Path,
) -> Result<bool, String> {
    use russh::keys::agent::client::AgentClient;

    let mut agent = AgentClient::connect_uds(socket)
        .await
        .map_err(|e| format!("connect to agent at {}: {e}", socket.display()))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| format!("list agent identities: {e}"))?;

    for key in identities {
        let res = handle
            .authenticate_publickey_with(user, key, None, &mut agent)
            .await
            .map_err(|e| e.to_string())?;
        if res.success() {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(not(unix))]
async fn try_agent(
    _handle: &mut SshHandle,
    _user: &str,
    _socket: &std::path::Path,
) -> Result<bool, String> {
    Err("agent authentication requires a unix socket".to_string())
}

/// Forwards channel output into the pipes until the channel closes or the
/// connection under it is lost.
async fn pump_output(
    ctx: &Context,
    conn: &Context,
    mut channel: russh::Channel<Msg>,
    stdout: DuplexStream,
    stderr: DuplexStream,
) -> Result<(), TransportError> {
    let mut stdout = Some(stdout);
    let mut stderr = Some(stderr);
    let mut exit_code: Option<u32> = None;
    let mut exit_signal: Option<String> = None;

    loop {
        let msg = tokio::select! {
            biased;
            reason = ctx.done() => {
                let _ = channel.close().await;
                return Err(TransportError::Context(reason));
            }
            _ = conn.done() => {
                close_pipe(&mut stdout).await;
                close_pipe(&mut stderr).await;
                return Err(TransportError::Disconnected(
                    "connection dropped while the command was running".to_string(),
                ));
            }
            msg = channel.wait() => msg,
        };

        match msg {
            Some(ChannelMsg::Data { data }) => forward(ctx, &mut stdout, &data[..]).await?,
            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                forward(ctx, &mut stderr, &data[..]).await?
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
            Some(ChannelMsg::ExitSignal {
                signal_name,
                error_message,
                ..
            }) => {
                exit_signal = Some(format!("{signal_name:?} {error_message}").trim().to_string())
            }
            Some(ChannelMsg::Eof) => {
                close_pipe(&mut stdout).await;
                close_pipe(&mut stderr).await;
            }
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }

    close_pipe(&mut stdout).await;
    close_pipe(&mut stderr).await;
    exit_status(exit_code, exit_signal)
}

/// A reader that went away only stops forwarding; the command keeps running.
async fn forward(
    ctx: &Context,
    pipe: &mut Option<DuplexStream>,
    data: &[u8],
) -> Result<(), TransportError> {
    if let Some(w) = pipe.as_mut()
        && ctx.run(w.write_all(data)).await?.is_err()
    {
        *pipe = None;
    }
    Ok(())
}

async fn close_pipe(pipe: &mut Option<DuplexStream>) {
    if let Some(mut w) = pipe.take() {
        let _ = w.shutdown().await;
    }
}

/// Waits for the copy sink to report how it exited.
async fn sink_exit(channel: &mut russh::Channel<Msg>) -> Result<(), TransportError> {
    let mut exit_code: Option<u32> = None;
    let mut exit_signal: Option<String> = None;
    loop {
        match channel.wait().await {
            Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
            Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                exit_signal = Some(format!("{signal_name:?}"))
            }
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }

    exit_status(exit_code, exit_signal).map_err(|err| match err {
        TransportError::Exec(e) => TransportError::Copy(CopyError::Remote {
            fatal: true,
            message: format!("copy sink exited with code {}", e.exit_code),
        }),
        other => other,
    })
}

fn exit_status(code: Option<u32>, signal: Option<String>) -> Result<(), TransportError> {
    match (code, signal) {
        (Some(0), _) => Ok(()),
        (Some(code), _) => Err(TransportError::Exec(ExecError::new(code))),
        (None, Some(signal)) => Err(TransportError::Session(format!(
            "remote command killed by signal {signal}"
        ))),
        (None, None) => Err(TransportError::Session(
            "remote command exited without reporting a status".to_string(),
        )),
    }
}

impl Transport for SshTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ssh
    }

    fn stream<'a>(
        &'a self,
        ctx: &'a Context,
        cmd: &'a Command,
    ) -> BoxFuture<'a, Result<ExecStream, TransportError>> {
        Box::pin(async move {
            let op_guard = ctx.run(self.ops.clone().lock_owned()).await?;
            let link = self.ensure_client(ctx).await?;
            let channel = self.open_checked_session(ctx, &link.handle).await?;

            ctx.run(channel.exec(true, cmd.to_shell_line()))
                .await?
                .map_err(|e| TransportError::Session(format!("start command: {e}")))?;
            debug!(addr = %self.opts.addr(), command = %cmd, "remote command started");

            let (stdout_w, stdout_r) = tokio::io::duplex(PIPE_BUFFER);
            let (stderr_w, stderr_r) = tokio::io::duplex(PIPE_BUFFER);
            let (done_tx, done) = oneshot::channel();
            let pump_ctx = ctx.clone();
            let conn = link.conn;

            tokio::spawn(async move {
                let result = pump_output(&pump_ctx, &conn, channel, stdout_w, stderr_w).await;
                drop(op_guard);
                let _ = done_tx.send(result);
            });

            Ok(ExecStream {
                stdout: Box::pin(stdout_r),
                stderr: Box::pin(stderr_r),
                done,
            })
        })
    }

    fn copy<'a>(
        &'a self,
        ctx: &'a Context,
        src: &'a mut dyn Copyable,
        dst: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let name = scp::remote_file_name(dst)?;
            let _op_guard = ctx.run(self.ops.clone().lock_owned()).await?;
            let link = self.ensure_client(ctx).await?;
            let mut channel = self.open_checked_session(ctx, &link.handle).await?;

            ctx.run(channel.exec(true, format!("scp -t {}", shell_quote(dst))))
                .await?
                .map_err(|e| TransportError::Session(format!("start copy sink: {e}")))?;

            let writer = channel.make_writer();
            let sent = async {
                let mut stream = Box::pin(tokio::io::join(channel.make_reader(), writer));
                link.run(ctx, scp::send_file(&mut stream, src, name)).await??;
                // Eof tells the sink no further files follow.
                link.run(ctx, stream.shutdown()).await??;
                Ok::<_, TransportError>(())
            }
            .await;
            let exited = match sent {
                Ok(()) => link
                    .run(ctx, sink_exit(&mut channel))
                    .await
                    .and_then(|res| res),
                Err(err) => Err(err),
            };
            let _ = channel.close().await;
            exited?;

            debug!(addr = %self.opts.addr(), dst, size = src.size(), "file copied");
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            self.shutdown.cancel();
            let client = self.client.lock().await.take();
            if let Some(client) = client {
                client.disconnect().await;
                info!(addr = %self.opts.addr(), "ssh connection closed");
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use tokio::io::AsyncReadExt;

    #[test]
    fn exit_status_mapping() {
        assert!(exit_status(Some(0), None).is_ok());
        assert_eq!(
            exit_status(Some(2), None).unwrap_err().exit_code(),
            Some(2)
        );
        assert!(matches!(
            exit_status(None, Some("KILL".to_string())),
            Err(TransportError::Session(_))
        ));
        assert!(matches!(
            exit_status(None, None),
            Err(TransportError::Session(_))
        ));
    }

    #[tokio::test]
    async fn forward_drops_pipe_when_reader_is_gone() {
        let ctx = Context::background();
        let (w, r) = tokio::io::duplex(16);
        let mut pipe = Some(w);

        forward(&ctx, &mut pipe, b"hello").await.unwrap();
        let mut r = r;
        let mut buf = [0u8; 5];
        r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        drop(r);
        forward(&ctx, &mut pipe, b"more").await.unwrap();
        assert!(pipe.is_none());
    }

    #[tokio::test]
    async fn forward_gives_up_on_cancel_when_reader_stalls() {
        let ctx = Context::background();
        let (w, _r) = tokio::io::duplex(4);
        let mut pipe = Some(w);

        ctx.cancel();
        let err = forward(&ctx, &mut pipe, b"does not fit").await.unwrap_err();
        assert!(err.context_error().is_some());
    }

    #[test]
    fn new_rejects_options_without_auth() {
        let err = SshTransport::new(SshOptions::new("10.0.0.5", "ubuntu"))
            .err()
            .unwrap();
        assert_eq!(err, SshOptionsError::NoAuthMethod);
    }

    #[tokio::test]
    async fn connect_respects_cancellation() {
        let opts = SshOptions::new("192.0.2.1", "ubuntu")
            .with_password("pw")
            .with_connect_timeout(Duration::from_secs(600));
        let ctx = Context::background();
        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = SshTransport::connect(&ctx, opts).await.err().unwrap();
        assert_eq!(
            err.context_error(),
            Some(crate::context::ContextError::Canceled)
        );
    }

    #[tokio::test]
    async fn close_aborts_a_dial_in_progress() {
        let opts = SshOptions::new("192.0.2.1", "ubuntu")
            .with_password("pw")
            .with_connect_timeout(Duration::from_secs(600));
        let transport = Arc::new(SshTransport::new(opts).unwrap());
        let running = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .run(&Context::background(), &Command::new("true"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(5), transport.close())
            .await
            .unwrap()
            .unwrap();
        let err = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed), "{err:?}");
    }

    #[tokio::test]
    async fn operations_after_close_fail() {
        let transport =
            SshTransport::new(SshOptions::new("192.0.2.1", "ubuntu").with_password("pw")).unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let err = transport
            .run(&Context::background(), &Command::new("true"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
