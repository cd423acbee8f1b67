use std::{fmt, process::ExitCode};

use anyhow::{Context as _, Result};
use clap::Parser;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

use vigil::{
    config::{
        Cli, Command, ConsulStateArgs, ConsulWaitArgs, CopyArgs, ExecArgs, SshArgs,
        VaultStateArgs, VaultWaitArgs,
    },
    consul,
    context::{Context, ContextError},
    convergence::WaitError,
    transport::{self, ExecStream, FileCopyable, SshTransport, Transport, TransportError},
    vault,
};

/// Usage or configuration problem.
const EXIT_USAGE: u8 = 2;
/// The host could not be reached or the operation failed on the way.
const EXIT_TRANSPORT: u8 = 3;
/// The selected checks did not pass before the timeout.
const EXIT_NOT_CONVERGED: u8 = 4;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug)]
struct ExitError {
    code: u8,
    message: String,
}

impl ExitError {
    fn new(code: u8, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Propagates a remote exit status; nothing else is printed.
    fn remote(exit_code: u32) -> Self {
        Self::new(u8::try_from(exit_code).unwrap_or(u8::MAX), String::new())
    }
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ExitError {}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let ctx = Context::background();
    tokio::spawn(cancel_on_ctrl_c(ctx.clone()));

    match run(&ctx, cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<ExitError>() {
            Some(exit) => {
                if !exit.message.is_empty() {
                    eprintln!("{}", exit.message);
                }
                ExitCode::from(exit.code)
            }
            None => {
                eprintln!("error: {err:#}");
                ExitCode::FAILURE
            }
        },
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn cancel_on_ctrl_c(ctx: Context) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupted; canceling");
        ctx.cancel();
    }
}

async fn run(ctx: &Context, cli: Cli) -> Result<()> {
    let transport = connect(ctx, &cli.ssh).await?;
    let mut liveness = transport.liveness();

    // A connection that stops answering keepalives ends the command.
    let res = tokio::select! {
        res = dispatch(ctx, &transport, cli.command) => res,
        Ok(lost) = liveness.recv() => {
            Err(ExitError::new(EXIT_TRANSPORT, format!("error: {lost}")).into())
        }
    };

    if let Err(err) = transport.close().await {
        warn!(error = %err, "close ssh transport");
    }
    res
}

async fn dispatch(ctx: &Context, transport: &dyn Transport, command: Command) -> Result<()> {
    match command {
        Command::Exec(args) => cmd_exec(ctx, transport, args).await,
        Command::Copy(args) => cmd_copy(ctx, transport, args).await,
        Command::VaultState(args) => cmd_vault_state(ctx, transport, args).await,
        Command::VaultWait(args) => cmd_vault_wait(ctx, transport, args).await,
        Command::ConsulState(args) => cmd_consul_state(ctx, transport, args).await,
        Command::ConsulWait(args) => cmd_consul_wait(ctx, transport, args).await,
    }
}

async fn connect(ctx: &Context, args: &SshArgs) -> Result<SshTransport> {
    let opts = args.ssh_options().ok_or_else(|| {
        ExitError::new(EXIT_USAGE, "error: --host (or VIGIL_SSH_HOST) is required")
    })?;
    let addr = opts.addr();

    info!(%addr, user = opts.user(), "connecting");
    SshTransport::connect(ctx, opts).await.map_err(|err| {
        let code = match &err {
            TransportError::Options(_) => EXIT_USAGE,
            TransportError::Context(ContextError::Canceled) => EXIT_INTERRUPTED,
            _ => EXIT_TRANSPORT,
        };
        ExitError::new(code, format!("error: connect {addr}: {err}")).into()
    })
}

fn transport_failure(what: &str, err: TransportError) -> anyhow::Error {
    match err {
        TransportError::Exec(e) => ExitError::remote(e.exit_code).into(),
        TransportError::Context(ContextError::Canceled) => {
            ExitError::new(EXIT_INTERRUPTED, format!("error: {what}: interrupted")).into()
        }
        err => ExitError::new(EXIT_TRANSPORT, format!("error: {what}: {err}")).into(),
    }
}

async fn cmd_exec(ctx: &Context, transport: &dyn Transport, args: ExecArgs) -> Result<()> {
    let mut cmd = transport::Command::new(args.command.join(" "));
    for (key, value) in args.env {
        cmd = cmd.with_env(key, value);
    }

    let ExecStream {
        mut stdout,
        mut stderr,
        done,
    } = transport
        .stream(ctx, &cmd)
        .await
        .map_err(|e| transport_failure("exec", e))?;

    let pumped = async {
        let mut out = tokio::io::stdout();
        let mut err = tokio::io::stderr();
        let (out_res, err_res) = tokio::join!(
            tokio::io::copy(&mut stdout, &mut out),
            tokio::io::copy(&mut stderr, &mut err)
        );
        out.flush().await?;
        err.flush().await?;
        out_res?;
        err_res?;
        Ok::<_, std::io::Error>(())
    };
    ctx.run(pumped)
        .await
        .map_err(|e| transport_failure("exec", e.into()))?
        .context("forward command output")?;

    ExecStream::wait(done)
        .await
        .map_err(|e| transport_failure("exec", e))
}

async fn cmd_copy(ctx: &Context, transport: &dyn Transport, args: CopyArgs) -> Result<()> {
    let mut src = FileCopyable::open(&args.src).await.map_err(|e| {
        ExitError::new(
            EXIT_USAGE,
            format!("error: open {}: {e}", args.src.display()),
        )
    })?;
    if let Some(mode) = args.mode {
        src = src.with_mode(mode);
    }

    transport
        .copy(ctx, &mut src, &args.dst)
        .await
        .map_err(|e| transport_failure("copy", e))?;
    info!(src = %args.src.display(), dst = %args.dst, "copied");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let raw = serde_json::to_string_pretty(value).context("encode snapshot")?;
    println!("{raw}");
    Ok(())
}

async fn cmd_vault_state(
    ctx: &Context,
    transport: &dyn Transport,
    args: VaultStateArgs,
) -> Result<()> {
    let req = args.vault.state_request();
    match vault::get_state(ctx, transport, &req).await {
        Ok(state) => print_json(&state),
        Err(err) => {
            print_json(err.partial_state())?;
            Err(ExitError::new(EXIT_TRANSPORT, format!("error: {err}")).into())
        }
    }
}

async fn cmd_vault_wait(
    ctx: &Context,
    transport: &dyn Transport,
    args: VaultWaitArgs,
) -> Result<()> {
    let req = args
        .vault
        .state_request()
        .with_poll_interval(args.wait.poll_interval());
    let checks = args.checks();
    let wait_ctx = ctx.with_timeout(args.wait.timeout());

    match vault::wait_for_state(&wait_ctx, transport, &req, &checks).await {
        Ok(state) => {
            info!(checks = checks.len(), "vault converged");
            if args.wait.json {
                print_json(&state)?;
            }
            Ok(())
        }
        Err(err) => Err(not_converged("vault", err)),
    }
}

async fn cmd_consul_state(
    ctx: &Context,
    transport: &dyn Transport,
    args: ConsulStateArgs,
) -> Result<()> {
    let req = args.consul.state_request();
    match consul::get_state(ctx, transport, &req).await {
        Ok(state) => print_json(&state),
        Err(err) => {
            print_json(err.partial_state())?;
            Err(ExitError::new(EXIT_TRANSPORT, format!("error: {err}")).into())
        }
    }
}

async fn cmd_consul_wait(
    ctx: &Context,
    transport: &dyn Transport,
    args: ConsulWaitArgs,
) -> Result<()> {
    let req = args
        .consul
        .state_request()
        .with_poll_interval(args.wait.poll_interval());
    let checks = args.checks();
    let wait_ctx = ctx.with_timeout(args.wait.timeout());

    match consul::wait_for_state(&wait_ctx, transport, &req, &checks).await {
        Ok(state) => {
            info!(checks = checks.len(), "consul converged");
            if args.wait.json {
                print_json(&state)?;
            }
            Ok(())
        }
        Err(err) => Err(not_converged("consul", err)),
    }
}

fn not_converged<S, E: fmt::Display>(what: &str, err: WaitError<S, E>) -> anyhow::Error {
    let code = match err.reason {
        Some(ContextError::Canceled) => EXIT_INTERRUPTED,
        _ => EXIT_NOT_CONVERGED,
    };
    ExitError::new(code, format!("error: {what}: {err}")).into()
}
