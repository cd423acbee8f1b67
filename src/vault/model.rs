//! Decoded responses of the Vault CLI and HTTP API.

use serde::{Deserialize, Serialize};

/// Envelope of `vault read -format=json` and friends.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SecretResponse<T> {
    pub data: T,
}

/// `vault status -format=json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusResponse {
    #[serde(rename = "type")]
    pub seal_type: String,
    pub initialized: bool,
    pub sealed: bool,
    #[serde(rename = "t")]
    pub threshold: u32,
    #[serde(rename = "n")]
    pub shares: u32,
    pub progress: u32,
    pub version: String,
    pub cluster_name: Option<String>,
    pub cluster_id: Option<String>,
    pub storage_type: Option<String>,
    pub ha_enabled: bool,
    pub is_self: bool,
    pub leader_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    /// 0 when unsealed, 2 when sealed.
    pub exit_code: u32,
    pub response: StatusResponse,
}

/// `sys/seal-status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SealStatus {
    #[serde(rename = "type")]
    pub seal_type: String,
    pub initialized: bool,
    pub sealed: bool,
    #[serde(rename = "t")]
    pub threshold: u32,
    #[serde(rename = "n")]
    pub shares: u32,
    pub progress: u32,
    pub version: String,
    pub storage_type: Option<String>,
}

/// `GET /v1/sys/health`. The body is the same for every status code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthResponse {
    pub initialized: bool,
    pub sealed: bool,
    pub standby: bool,
    pub performance_standby: bool,
    pub replication_performance_mode: Option<String>,
    pub replication_dr_mode: Option<String>,
    pub server_time_utc: Option<i64>,
    pub version: String,
    pub cluster_name: Option<String>,
    pub cluster_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    pub http_code: u16,
    pub response: HealthResponse,
}

impl Health {
    pub const ACTIVE: u16 = 200;
    pub const STANDBY: u16 = 429;
    pub const DR_SECONDARY: u16 = 472;
    pub const PERFORMANCE_STANDBY: u16 = 473;
    pub const NOT_INITIALIZED: u16 = 501;
    pub const SEALED: u16 = 503;

    pub fn is_known_code(code: u16) -> bool {
        matches!(
            code,
            Self::ACTIVE
                | Self::STANDBY
                | Self::DR_SECONDARY
                | Self::PERFORMANCE_STANDBY
                | Self::NOT_INITIALIZED
                | Self::SEALED
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RaftListPeers {
    pub config: RaftConfiguration,
}

/// `vault operator raft list-peers -format=json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfiguration {
    pub index: u64,
    pub servers: Vec<RaftServer>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftServer {
    pub node_id: String,
    pub address: String,
    pub leader: bool,
    pub voter: bool,
    pub protocol_version: String,
}

/// `sys/ha-status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HaStatus {
    pub nodes: Vec<HaNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HaNode {
    pub hostname: String,
    pub api_address: String,
    pub cluster_address: String,
    pub active_node: bool,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_status_output() {
        let raw = r#"{
          "type": "shamir", "initialized": true, "sealed": false, "t": 3, "n": 5,
          "progress": 0, "nonce": "", "version": "1.15.2", "build_date": "2023-11-06T11:33:28Z",
          "migration": false, "cluster_name": "vault-cluster-4d4f4c1a",
          "cluster_id": "0e5f7c49", "recovery_seal": false, "storage_type": "raft",
          "ha_enabled": true, "is_self": true, "leader_address": "https://10.0.0.5:8200",
          "raft_committed_index": 91, "raft_applied_index": 91
        }"#;
        let status: StatusResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(status.threshold, 3);
        assert_eq!(status.shares, 5);
        assert_eq!(status.storage_type.as_deref(), Some("raft"));
        assert!(status.is_self);
    }

    #[test]
    fn decodes_list_peers_output() {
        let raw = r#"{"request_id":"","lease_id":"","renewable":false,"lease_duration":0,
          "data":{"config":{"index":0,"servers":[
            {"address":"10.0.0.5:8201","leader":true,"node_id":"vault_1","protocol_version":"3","voter":true},
            {"address":"10.0.0.6:8201","leader":false,"node_id":"vault_2","protocol_version":"3","voter":false}
          ]}},"warnings":null}"#;
        let peers: SecretResponse<RaftListPeers> = serde_json::from_str(raw).unwrap();
        let servers = peers.data.config.servers;
        assert_eq!(servers.len(), 2);
        assert!(servers[0].leader);
        assert!(!servers[1].voter);
    }

    #[test]
    fn uninitialized_health_body() {
        let raw = r#"{"initialized":false,"sealed":true,"standby":true,"performance_standby":false,
          "replication_performance_mode":"unknown","replication_dr_mode":"unknown",
          "server_time_utc":1700000000,"version":"1.15.2"}"#;
        let health: HealthResponse = serde_json::from_str(raw).unwrap();
        assert!(!health.initialized);
        assert!(health.sealed);
        assert!(Health::is_known_code(Health::NOT_INITIALIZED));
        assert!(!Health::is_known_code(404));
    }
}
