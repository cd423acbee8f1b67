//! Consul agent state, read through the agent's HTTP API on the node.

use std::{fmt, time::Duration};

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    context::Context,
    convergence::{self, Check, WaitError},
    remote::{FetchError, FieldError, HttpGet},
    retry::{Interval, Retrier},
    systemd::{self, UnitProperties},
    transport::{ProcessManager, Transport},
};

pub mod checks;

pub const DEFAULT_ADDR: &str = "http://127.0.0.1:8500";
pub const DEFAULT_UNIT: &str = "consul";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

const TOKEN_HEADER: &str = "X-Consul-Token";

/// Everything but the RFC 3986 unreserved characters.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Clone)]
pub struct StateRequest {
    addr: String,
    unit: String,
    token: Option<String>,
    poll_interval: Duration,
    fetch_retrier: Retrier<FetchError>,
}

impl fmt::Debug for StateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateRequest")
            .field("addr", &self.addr)
            .field("unit", &self.unit)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl Default for StateRequest {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            unit: DEFAULT_UNIT.to_string(),
            token: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            fetch_retrier: Retrier::new()
                .with_max_retries(2)
                .with_interval(Interval::Fixed(Duration::from_secs(1))),
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

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Required for the raft configuration, which needs `operator:read`.
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

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn get(&self, path: &str) -> HttpGet {
        let get = HttpGet::new(format!("{}{path}", self.addr));
        match &self.token {
            Some(token) => get.with_secret_header(TOKEN_HEADER, token.as_str()),
            None => get,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSelf {
    #[serde(rename = "Config")]
    pub config: AgentConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct AgentConfig {
    pub datacenter: String,
    pub node_name: String,
    #[serde(rename = "NodeID")]
    pub node_id: String,
    pub server: bool,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct HealthCheck {
    pub node: String,
    #[serde(rename = "CheckID")]
    pub check_id: String,
    pub name: String,
    pub status: String,
    pub output: String,
    pub service_name: String,
}

impl HealthCheck {
    pub fn is_passing(&self) -> bool {
        self.status == "passing"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RaftConfiguration {
    pub servers: Vec<RaftServer>,
    pub index: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RaftServer {
    #[serde(rename = "ID")]
    pub id: String,
    pub node: String,
    pub address: String,
    pub leader: bool,
    pub voter: bool,
    pub protocol_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct State {
    pub unit_properties: Option<UnitProperties>,
    /// Raft address of the leader as seen by this agent; empty when there
    /// is none.
    pub leader: Option<String>,
    pub agent: Option<AgentSelf>,
    pub node_health: Option<Vec<HealthCheck>>,
    pub raft_configuration: Option<RaftConfiguration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    UnitProperties,
    Leader,
    Agent,
    NodeHealth,
    RaftConfiguration,
}

impl Field {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnitProperties => "unit properties",
            Self::Leader => "leader",
            Self::Agent => "agent",
            Self::NodeHealth => "node health",
            Self::RaftConfiguration => "raft configuration",
        }
    }
}

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
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fetch consul {}: {}", self.field.as_str(), self.source)
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
            Err(err) => {
                debug!(unit = %req.unit, error = %err, "consul unit properties unavailable")
            }
        }
    }

    let leader = req.get("/v1/status/leader");
    match retrier.run(ctx, || leader.json::<String>(ctx, transport)).await {
        Ok(addr) => state.leader = Some(addr),
        Err(err) => return Err(StateError::new(Field::Leader, err, state)),
    }

    let agent_self = req.get("/v1/agent/self");
    let node_name = match retrier.run(ctx, || agent_self.json::<AgentSelf>(ctx, transport)).await {
        Ok(agent) => {
            let name = agent.config.node_name.clone();
            state.agent = Some(agent);
            name
        }
        Err(err) => return Err(StateError::new(Field::Agent, err, state)),
    };

    // The node name resolved above is the input of this read.
    let node_health = req.get(&format!(
        "/v1/health/node/{}",
        utf8_percent_encode(&node_name, PATH_SEGMENT)
    ));
    match retrier
        .run(ctx, || node_health.json::<Vec<HealthCheck>>(ctx, transport))
        .await
    {
        Ok(checks) => state.node_health = Some(checks),
        Err(err) => return Err(StateError::new(Field::NodeHealth, err, state)),
    }

    if req.token.is_none() {
        debug!("no consul token; skipping raft configuration");
        return Ok(state);
    }
    let raft = req.get("/v1/operator/raft/configuration");
    match retrier
        .run(ctx, || raft.json::<RaftConfiguration>(ctx, transport))
        .await
    {
        Ok(config) => state.raft_configuration = Some(config),
        Err(err) => return Err(StateError::new(Field::RaftConfiguration, err, state)),
    }

    Ok(state)
}

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
