//! In-memory transport answering commands from scripted rules.

use std::{
    collections::BTreeMap,
    io::Cursor,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::oneshot;

use crate::{
    context::Context,
    transport::{
        BoxFuture, Command, Copyable, ExecError, ExecStream, Transport, TransportError,
        TransportKind,
        scp::{ReceivedFile, receive_file, remote_file_name, send_file},
    },
};

const COMMAND_NOT_FOUND: u32 = 127;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u32,
}

impl Reply {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn exit(exit_code: u32, stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code,
        }
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }
}

type Responder = Arc<dyn Fn(usize) -> Reply + Send + Sync>;

struct Rule {
    pattern: String,
    responder: Responder,
    calls: usize,
}

/// Answers each command from the first rule whose pattern occurs in the
/// command text. Responders see how many times their rule matched before,
/// which lets a test script a remote host that changes between polls.
pub struct ScriptedTransport {
    kind: TransportKind,
    rules: Mutex<Vec<Rule>>,
    history: Mutex<Vec<Command>>,
    files: Mutex<BTreeMap<String, ReceivedFile>>,
    closed: AtomicBool,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            kind: TransportKind::Ssh,
            rules: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            files: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn on(self, pattern: impl Into<String>, reply: Reply) -> Self {
        self.on_call(pattern, move |_| reply.clone())
    }

    /// `responder` receives the zero-based index of the match.
    pub fn on_call(
        self,
        pattern: impl Into<String>,
        responder: impl Fn(usize) -> Reply + Send + Sync + 'static,
    ) -> Self {
        lock(&self.rules).push(Rule {
            pattern: pattern.into(),
            responder: Arc::new(responder),
            calls: 0,
        });
        self
    }

    pub fn commands(&self) -> Vec<Command> {
        lock(&self.history).clone()
    }

    pub fn file(&self, path: &str) -> Option<ReceivedFile> {
        lock(&self.files).get(path).cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn respond(&self, cmd: &Command) -> Reply {
        lock(&self.history).push(cmd.clone());

        let mut rules = lock(&self.rules);
        match rules.iter_mut().find(|r| cmd.text().contains(&r.pattern)) {
            Some(rule) => {
                let index = rule.calls;
                rule.calls += 1;
                (rule.responder)(index)
            }
            None => Reply::exit(COMMAND_NOT_FOUND, "")
                .with_stderr(format!("sh: {}: command not found", cmd.text())),
        }
    }

    fn ensure_open(&self, ctx: &Context) -> Result<(), TransportError> {
        if let Some(err) = ctx.err() {
            return Err(TransportError::Context(err));
        }
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn stream<'a>(
        &'a self,
        ctx: &'a Context,
        cmd: &'a Command,
    ) -> BoxFuture<'a, Result<ExecStream, TransportError>> {
        Box::pin(async move {
            self.ensure_open(ctx)?;
            let reply = self.respond(cmd);

            let (tx, done) = oneshot::channel();
            let status = match reply.exit_code {
                0 => Ok(()),
                code => Err(TransportError::Exec(ExecError::new(code))),
            };
            let _ = tx.send(status);

            Ok(ExecStream {
                stdout: Box::pin(Cursor::new(reply.stdout.into_bytes())),
                stderr: Box::pin(Cursor::new(reply.stderr.into_bytes())),
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
            self.ensure_open(ctx)?;
            let name = remote_file_name(dst)?;

            let (mut source_end, mut sink_end) = tokio::io::duplex(64 * 1024);
            let exchange = async {
                tokio::join!(
                    send_file(&mut source_end, src, name),
                    receive_file(&mut sink_end)
                )
            };
            let (sent, received) = ctx.run(exchange).await?;
            sent?;
            lock(&self.files).insert(dst.to_string(), received?);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        self.closed.store(true, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::transport::BytesCopyable;

    #[tokio::test]
    async fn run_uses_first_matching_rule_and_call_index() {
        let tr = ScriptedTransport::new()
            .on_call("vault status", |n| {
                if n == 0 {
                    Reply::exit(2, "{\"sealed\":true}\n")
                } else {
                    Reply::ok("{\"sealed\":false}\n")
                }
            })
            .on("hostname", Reply::ok("node-1\n"));
        let ctx = Context::background();

        let err = tr
            .run(&ctx, &Command::new("vault status -format=json"))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(2));

        let out = tr
            .run(&ctx, &Command::new("vault status -format=json"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "{\"sealed\":false}");

        let out = tr.run(&ctx, &Command::new("hostname")).await.unwrap();
        assert_eq!(out.stdout, "node-1");
        assert_eq!(tr.commands().len(), 3);
    }

    #[tokio::test]
    async fn exec_exit_codes_are_preserved() {
        let tr = ScriptedTransport::new()
            .on("exit 0", Reply::exit(0, ""))
            .on("exit 1", Reply::exit(1, ""))
            .on("exit 3", Reply::exit(3, ""))
            .on("exit 9", Reply::exit(9, ""));
        let ctx = Context::background();

        assert!(tr.run(&ctx, &Command::new("exit 0")).await.is_ok());
        for code in [1u32, 3, 9] {
            let err = tr
                .run(&ctx, &Command::new(format!("exit {code}")))
                .await
                .unwrap_err();
            assert_eq!(err.exit_code(), Some(code));
        }
    }

    #[tokio::test]
    async fn unknown_command_exits_127() {
        let tr = ScriptedTransport::new();
        let err = tr
            .run(&Context::background(), &Command::new("consul members"))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(COMMAND_NOT_FOUND));
    }

    #[tokio::test]
    async fn copy_round_trips_through_protocol() {
        let tr = ScriptedTransport::new();
        let ctx = Context::background();
        let body: Vec<u8> = (0..100_000u32).map(|i| (i % 7) as u8).collect();

        let mut src = BytesCopyable::new(body.clone());
        tr.copy(&ctx, &mut src, "/opt/vault/license.hclic")
            .await
            .unwrap();
        let mut empty = BytesCopyable::new(Vec::new());
        tr.copy(&ctx, &mut empty, "/tmp/empty").await.unwrap();

        let stored = tr.file("/opt/vault/license.hclic").unwrap();
        assert_eq!(stored.name, "license.hclic");
        assert_eq!(stored.contents, body);
        assert!(tr.file("/tmp/empty").unwrap().contents.is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_work() {
        let tr = ScriptedTransport::new().on("true", Reply::ok(""));
        tr.close().await.unwrap();
        tr.close().await.unwrap();
        let err = tr
            .run(&Context::background(), &Command::new("true"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
