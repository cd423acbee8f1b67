use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    consul,
    convergence::Check,
    transport::ssh::{self, SshOptions},
    vault,
};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "vigil",
    about = "Run commands on a remote host and wait for Vault or Consul to converge",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub ssh: SshArgs,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run a shell command remotely, streaming its output and exit code.
    Exec(ExecArgs),

    /// Copy one local file to the remote host.
    Copy(CopyArgs),

    /// Print a snapshot of the Vault node as JSON.
    VaultState(VaultStateArgs),

    /// Poll the Vault node until every selected check passes.
    VaultWait(VaultWaitArgs),

    /// Print a snapshot of the Consul agent as JSON.
    ConsulState(ConsulStateArgs),

    /// Poll the Consul agent until every selected check passes.
    ConsulWait(ConsulWaitArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SshArgs {
    #[arg(long, global = true, env = "VIGIL_SSH_HOST", value_name = "HOST")]
    pub host: Option<String>,

    #[arg(
        long,
        global = true,
        env = "VIGIL_SSH_PORT",
        value_name = "PORT",
        default_value_t = ssh::options::DEFAULT_PORT,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub port: u16,

    #[arg(
        long,
        global = true,
        env = "VIGIL_SSH_USER",
        value_name = "USER",
        default_value = "root"
    )]
    pub user: String,

    #[arg(
        long,
        global = true,
        env = "VIGIL_SSH_PASSWORD",
        value_name = "PASSWORD",
        hide_env_values = true
    )]
    pub password: Option<String>,

    #[arg(
        long,
        global = true,
        env = "VIGIL_SSH_IDENTITY_FILE",
        value_name = "PATH"
    )]
    pub identity_file: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "VIGIL_SSH_PASSPHRASE",
        value_name = "PASSPHRASE",
        hide_env_values = true
    )]
    pub passphrase: Option<String>,

    /// Offer the keys held by the agent listening on $SSH_AUTH_SOCK.
    #[arg(long, global = true, env = "VIGIL_SSH_AGENT")]
    pub agent: bool,

    /// Reject the server unless its key has this SHA256 fingerprint.
    #[arg(
        long,
        global = true,
        env = "VIGIL_SSH_HOST_KEY",
        value_name = "SHA256:..."
    )]
    pub host_key: Option<String>,

    #[arg(
        long,
        global = true,
        env = "VIGIL_SSH_CONNECT_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..=3600)
    )]
    pub connect_timeout_secs: u64,

    #[arg(
        long,
        global = true,
        env = "VIGIL_SSH_KEEPALIVE_INTERVAL_SECS",
        value_name = "SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..=300)
    )]
    pub keepalive_interval_secs: u64,

    #[arg(
        long,
        global = true,
        env = "VIGIL_SSH_KEEPALIVE_MAX_FAILURES",
        value_name = "N",
        default_value_t = 3,
        value_parser = clap::value_parser!(u32).range(1..=10)
    )]
    pub keepalive_max_failures: u32,
}

impl SshArgs {
    /// `None` when no host was given.
    pub fn ssh_options(&self) -> Option<SshOptions> {
        let host = self.host.as_deref().filter(|h| !h.trim().is_empty())?;
        let mut opts = SshOptions::new(host, &self.user)
            .with_port(self.port)
            .with_agent(self.agent)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .with_keepalive(
                Duration::from_secs(self.keepalive_interval_secs),
                self.keepalive_max_failures,
            );
        if let Some(password) = &self.password {
            opts = opts.with_password(password);
        }
        if let Some(path) = &self.identity_file {
            opts = opts.with_private_key_file(path);
        }
        if let Some(passphrase) = &self.passphrase {
            opts = opts.with_passphrase(passphrase);
        }
        if let Some(fingerprint) = &self.host_key {
            opts = opts.with_host_key_fingerprint(fingerprint);
        }
        Some(opts)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ExecArgs {
    /// Extra environment for the command, repeatable.
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Command line; the words are joined with spaces and run by the remote shell.
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "COMMAND"
    )]
    pub command: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct CopyArgs {
    #[arg(value_name = "SRC")]
    pub src: PathBuf,

    #[arg(value_name = "DST")]
    pub dst: String,

    /// Permission bits for the remote file, in octal. Defaults to the source's.
    #[arg(long, value_name = "OCTAL", value_parser = parse_mode)]
    pub mode: Option<u32>,
}

#[derive(Args, Debug, Clone)]
pub struct VaultArgs {
    #[arg(
        long,
        env = "VAULT_ADDR",
        value_name = "URL",
        default_value = vault::DEFAULT_ADDR
    )]
    pub vault_addr: String,

    /// Enables the raft and HA reads.
    #[arg(
        long,
        env = "VAULT_TOKEN",
        value_name = "TOKEN",
        hide_env_values = true
    )]
    pub vault_token: Option<String>,

    #[arg(long, value_name = "PATH", default_value = vault::DEFAULT_BIN)]
    pub vault_bin: String,

    #[arg(long, value_name = "UNIT", default_value = vault::DEFAULT_UNIT)]
    pub vault_unit: String,
}

impl VaultArgs {
    pub fn state_request(&self) -> vault::StateRequest {
        let mut req = vault::StateRequest::new()
            .with_addr(&self.vault_addr)
            .with_bin(&self.vault_bin)
            .with_unit(&self.vault_unit);
        if let Some(token) = &self.vault_token {
            req = req.with_token(token);
        }
        req
    }
}

#[derive(Args, Debug, Clone)]
pub struct VaultStateArgs {
    #[command(flatten)]
    pub vault: VaultArgs,
}

#[derive(Args, Debug, Clone)]
pub struct WaitArgs {
    /// Give up after this long.
    #[arg(
        long,
        value_name = "SECS",
        default_value_t = 300,
        value_parser = clap::value_parser!(u64).range(1..=86_400)
    )]
    pub timeout_secs: u64,

    #[arg(
        long,
        value_name = "SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..=300)
    )]
    pub poll_interval_secs: u64,

    /// Print the converged snapshot as JSON.
    #[arg(long)]
    pub json: bool,
}

impl WaitArgs {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Args, Debug, Clone)]
pub struct VaultWaitArgs {
    #[command(flatten)]
    pub vault: VaultArgs,

    #[command(flatten)]
    pub wait: WaitArgs,

    #[arg(long)]
    pub unit_active: bool,

    #[arg(long)]
    pub initialized: bool,

    #[arg(long, conflicts_with = "sealed")]
    pub unsealed: bool,

    #[arg(long)]
    pub sealed: bool,

    /// Exactly one raft server is the leader. Needs a token.
    #[arg(long)]
    pub raft_leader: bool,

    #[arg(
        long,
        value_name = "N",
        value_parser = clap::value_parser!(u64).range(1..=100)
    )]
    pub min_raft_voters: Option<u64>,

    #[arg(
        long,
        value_name = "N",
        value_parser = clap::value_parser!(u64).range(1..=100)
    )]
    pub min_ha_nodes: Option<u64>,

    /// This node answers sys/health as the active node.
    #[arg(long)]
    pub active: bool,

    /// The reported version starts with this prefix.
    #[arg(long, value_name = "PREFIX")]
    pub expect_version: Option<String>,
}

impl VaultWaitArgs {
    /// The selected checks in evaluation order. Without any selection the
    /// node must be initialized and unsealed.
    pub fn checks(&self) -> Vec<Check<vault::State>> {
        use vault::checks;

        let any_selected = self.unit_active
            || self.initialized
            || self.unsealed
            || self.sealed
            || self.raft_leader
            || self.min_raft_voters.is_some()
            || self.min_ha_nodes.is_some()
            || self.active
            || self.expect_version.is_some();
        if !any_selected {
            return vec![
                checks::seal_state_known(),
                checks::is_initialized(),
                checks::is_unsealed(),
            ];
        }

        let mut out = Vec::new();
        if self.unit_active {
            out.push(checks::unit_is_active());
        }
        if self.unsealed || self.sealed {
            out.push(checks::seal_state_known());
        }
        if self.initialized {
            out.push(checks::is_initialized());
        }
        if self.unsealed {
            out.push(checks::is_unsealed());
        }
        if self.sealed {
            out.push(checks::is_sealed());
        }
        if self.raft_leader {
            out.push(checks::has_raft_leader());
        }
        if let Some(n) = self.min_raft_voters {
            out.push(checks::min_raft_voters(n as usize));
        }
        if let Some(n) = self.min_ha_nodes {
            out.push(checks::min_ha_nodes(n as usize));
        }
        if self.active {
            out.push(checks::is_active_node());
        }
        if let Some(prefix) = &self.expect_version {
            out.push(checks::version_is(prefix));
        }
        out
    }
}

#[derive(Args, Debug, Clone)]
pub struct ConsulArgs {
    #[arg(
        long,
        env = "CONSUL_HTTP_ADDR",
        value_name = "URL",
        default_value = consul::DEFAULT_ADDR
    )]
    pub consul_addr: String,

    /// Enables the raft configuration read.
    #[arg(
        long,
        env = "CONSUL_HTTP_TOKEN",
        value_name = "TOKEN",
        hide_env_values = true
    )]
    pub consul_token: Option<String>,

    #[arg(long, value_name = "UNIT", default_value = consul::DEFAULT_UNIT)]
    pub consul_unit: String,
}

impl ConsulArgs {
    pub fn state_request(&self) -> consul::StateRequest {
        let mut req = consul::StateRequest::new()
            .with_addr(&self.consul_addr)
            .with_unit(&self.consul_unit);
        if let Some(token) = &self.consul_token {
            req = req.with_token(token);
        }
        req
    }
}

#[derive(Args, Debug, Clone)]
pub struct ConsulStateArgs {
    #[command(flatten)]
    pub consul: ConsulArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ConsulWaitArgs {
    #[command(flatten)]
    pub consul: ConsulArgs,

    #[command(flatten)]
    pub wait: WaitArgs,

    #[arg(long)]
    pub unit_active: bool,

    #[arg(long)]
    pub leader: bool,

    /// Needs a token.
    #[arg(
        long,
        value_name = "N",
        value_parser = clap::value_parser!(u64).range(1..=100)
    )]
    pub min_voters: Option<u64>,

    #[arg(long)]
    pub checks_passing: bool,
}

impl ConsulWaitArgs {
    /// The selected checks in evaluation order; a leader by default.
    pub fn checks(&self) -> Vec<Check<consul::State>> {
        use consul::checks;

        let mut out = Vec::new();
        if self.unit_active {
            out.push(checks::unit_is_active());
        }
        if self.leader {
            out.push(checks::has_leader());
        }
        if let Some(n) = self.min_voters {
            out.push(checks::min_voters(n as usize));
        }
        if self.checks_passing {
            out.push(checks::node_checks_passing());
        }
        if out.is_empty() {
            out.push(checks::has_leader());
        }
        out
    }
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))?;
    let valid_key = !key.is_empty()
        && !key.starts_with(|c: char| c.is_ascii_digit())
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_key {
        return Err(format!("invalid environment variable name {key:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_mode(raw: &str) -> Result<u32, String> {
    let mode = u32::from_str_radix(raw.trim_start_matches("0o"), 8)
        .map_err(|_| format!("expected an octal mode, got {raw:?}"))?;
    if mode > 0o7777 {
        return Err(format!("mode {raw} is out of range"));
    }
    Ok(mode)
}
