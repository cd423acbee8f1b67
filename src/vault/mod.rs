//! Vault node state, assembled over a [`Transport`].

use std::{fmt, time::Duration};

use serde::Serialize;
use tracing::debug;

use crate::{
    context::Context,
    convergence::{self, Check, WaitError},
    remote::{self, FetchError, FieldError, HttpGet},
    retry::{Interval, Retrier},
    systemd::{self, UnitProperties},
    transport::{Command, ProcessManager, Transport, TransportError},
};

pub mod checks;
mod model;

use model::{RaftListPeers, SecretResponse};
pub use model::{
    HaNode, HaStatus, Health, HealthResponse, RaftConfiguration, RaftServer, SealStatus, Status,
    StatusResponse,
};

pub const DEFAULT_ADDR: &str = "http://127.0.0.1:8200";
pub const DEFAULT_BIN: &str = "vault";
pub const DEFAULT_UNIT: &str = "vault";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_FETCH_RETRIES: u32 = 2;
pub const DEFAULT_FETCH_INTERVAL: Duration = Duration::from_secs(1);

/// `vault status` exits with 2 when the node is sealed.
const STATUS_EXIT_SEALED: u32 = 2;

#[derive(Clone)]
pub struct StateRequest {
    addr: String,
    bin: String,
    unit: String,
    token: Option<String>,
    poll_interval: Duration,
    fetch_retrier: Retrier<FetchError>,
}

impl fmt::Debug for StateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateRequest")
            .field("addr", &self.addr)
            .field("bin", &self.bin)
            .field("unit", &self.unit)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("poll_interval", &self.poll_interval)
            .field("fetch_retrier", &self.fetch_retrier)
            .finish()
    }
}

impl Default for StateRequest {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            bin: DEFAULT_BIN.to_string(),
            unit: DEFAULT_UNIT.to_string(),
            token: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            fetch_retrier: Retrier::new()
                .with_max_retries(DEFAULT_FETCH_RETRIES)
                .with_interval(Interval::Fixed(DEFAULT_FETCH_INTERVAL)),
        }
    }
}

impl StateRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_bin(mut self, bin: impl Into<String>) -> Self {
        self.bin = bin.into();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Enables the privileged reads (raft peers, HA status).
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_fetch_retrier(mut self, retrier: Retrier<FetchError>) -> Self {
        self.fetch_retrier = retrier;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn vault_command(&self, args: &str) -> Command {
        let cmd = Command::new(format!("{} {args}", self.bin))
            .with_env("VAULT_ADDR", self.addr.as_str());
        match &self.token {
            Some(token) => cmd.with_env("VAULT_TOKEN", token.as_str()),
            None => cmd,
        }
    }
}

/// One observation of a Vault node. Fields stay `None` when they were not
/// fetched, either because an earlier read failed or because they do not
/// apply to the node right now.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct State {
    pub unit_properties: Option<UnitProperties>,
    pub status: Option<Status>,
    pub seal_status: Option<SealStatus>,
    pub health: Option<Health>,
    pub raft_configuration: Option<RaftConfiguration>,
    pub ha_status: Option<HaStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    UnitProperties,
    Status,
    SealStatus,
    Health,
    RaftConfiguration,
    HaStatus,
}

impl Field {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnitProperties => "unit properties",
            Self::Status => "status",
            Self::SealStatus => "seal status",
            Self::Health => "health",
            Self::RaftConfiguration => "raft configuration",
            Self::HaStatus => "ha status",
        }
    }
}

/// A required read failed. Carries what was gathered before it.
#[derive(Debug)]
pub struct StateError {
    pub field: Field,
    pub source: FieldError,
    partial: Box<State>,
}

impl StateError {
    fn new(field: Field, source: FieldError, partial: State) -> Self {
        Self {
            field,
            source,
            partial: Box::new(partial),
        }
    }

    pub fn partial_state(&self) -> &State {
        &self.partial
    }

    pub fn into_partial_state(self) -> State {
        *self.partial
    }
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fetch vault {}: {}", self.field.as_str(), self.source)
    }
}

impl std::error::Error for StateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

pub async fn get_state(
    ctx: &Context,
    transport: &dyn Transport,
    req: &StateRequest,
) -> Result<State, StateError> {
    let retrier = &req.fetch_retrier;
    let mut state = State::default();

    if transport.kind().process_manager() == Some(ProcessManager::Systemd) {
        let fetched = retrier
            .run(ctx, move || async move {
                systemd::fetch_unit_properties(ctx, transport, &req.unit)
                    .await
                    .map_err(FetchError::from)
            })
            .await;
        match fetched {
            Ok(props) => state.unit_properties = Some(props),
            Err(err) if err.context_error().is_some() => {
                return Err(StateError::new(Field::UnitProperties, err, state));
            }
            Err(err) => debug!(unit = %req.unit, error = %err, "vault unit properties unavailable"),
        }
    }

    let status = match retrier.run(ctx, || fetch_status(ctx, transport, req)).await {
        Ok(status) => status,
        Err(err) => return Err(StateError::new(Field::Status, err, state)),
    };
    let ready = status.response.initialized && !status.response.sealed;
    let raft_storage = status
        .response
        .storage_type
        .as_deref()
        .is_none_or(|t| t == "raft");
    let ha_enabled = status.response.ha_enabled;
    state.status = Some(status);

    match retrier.run(ctx, || fetch_seal_status(ctx, transport, req)).await {
        Ok(seal) => state.seal_status = Some(seal),
        Err(err) => return Err(StateError::new(Field::SealStatus, err, state)),
    }

    match retrier.run(ctx, || fetch_health(ctx, transport, req)).await {
        Ok(health) => state.health = Some(health),
        Err(err) => return Err(StateError::new(Field::Health, err, state)),
    }

    if req.token.is_none() {
        debug!("no vault token; skipping raft configuration and ha status");
        return Ok(state);
    }
    if !ready {
        debug!("vault is sealed or uninitialized; skipping raft configuration and ha status");
        return Ok(state);
    }

    if raft_storage {
        match retrier.run(ctx, || fetch_raft_configuration(ctx, transport, req)).await {
            Ok(raft) => state.raft_configuration = Some(raft),
            Err(err) => return Err(StateError::new(Field::RaftConfiguration, err, state)),
        }
    }
    if ha_enabled {
        match retrier.run(ctx, || fetch_ha_status(ctx, transport, req)).await {
            Ok(ha) => state.ha_status = Some(ha),
            Err(err) => return Err(StateError::new(Field::HaStatus, err, state)),
        }
    }

    Ok(state)
}

/// Polls [`get_state`] until every check passes, in order, on one snapshot.
pub async fn wait_for_state(
    ctx: &Context,
    transport: &dyn Transport,
    req: &StateRequest,
    checks: &[Check<State>],
) -> Result<State, WaitError<State, StateError>> {
    convergence::wait_for(
        ctx,
        req.poll_interval,
        || get_state(ctx, transport, req),
        checks,
    )
    .await
}

async fn fetch_status(
    ctx: &Context,
    transport: &dyn Transport,
    req: &StateRequest,
) -> Result<Status, FetchError> {
    let cmd = req.vault_command("status -format=json");
    let (exit_code, stdout) = match transport.run(ctx, &cmd).await {
        Ok(out) => (0, out.stdout),
        Err(TransportError::Exec(e)) if e.exit_code == STATUS_EXIT_SEALED => {
            (e.exit_code, e.output.stdout)
        }
        Err(e) => return Err(e.into()),
    };
    Ok(Status {
        exit_code,
        response: remote::decode_json(cmd.text(), &stdout)?,
    })
}

async fn fetch_seal_status(
    ctx: &Context,
    transport: &dyn Transport,
    req: &StateRequest,
) -> Result<SealStatus, FetchError> {
    let cmd = req.vault_command("read -format=json sys/seal-status");
    let resp: SecretResponse<SealStatus> = remote::run_json(ctx, transport, &cmd).await?;
    Ok(resp.data)
}

async fn fetch_health(
    ctx: &Context,
    transport: &dyn Transport,
    req: &StateRequest,
) -> Result<Health, FetchError> {
    let get = HttpGet::new(format!("{}/v1/sys/health", req.addr));
    let resp = get.send(ctx, transport).await?;
    if !Health::is_known_code(resp.code) {
        return Err(FetchError::Http {
            url: get.url().to_string(),
            code: resp.code,
            body: resp.body,
        });
    }
    Ok(Health {
        http_code: resp.code,
        response: remote::decode_json(get.url(), &resp.body)?,
    })
}

async fn fetch_raft_configuration(
    ctx: &Context,
    transport: &dyn Transport,
    req: &StateRequest,
) -> Result<RaftConfiguration, FetchError> {
    let cmd = req.vault_command("operator raft list-peers -format=json");
    let resp: SecretResponse<RaftListPeers> = remote::run_json(ctx, transport, &cmd).await?;
    Ok(resp.data.config)
}

async fn fetch_ha_status(
    ctx: &Context,
    transport: &dyn Transport,
    req: &StateRequest,
) -> Result<HaStatus, FetchError> {
    let cmd = req.vault_command("read -format=json sys/ha-status");
    let resp: SecretResponse<HaStatus> = remote::run_json(ctx, transport, &cmd).await?;
    Ok(resp.data)
}
