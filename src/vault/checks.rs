//! Predicates over a Vault [`State`].
//!
//! Checks run in the order given and a later check may rely on an earlier
//! one having passed, so put `seal_state_known` before `is_unsealed`.

use crate::{
    convergence::{Check, CheckFailure, at_least, require},
    systemd,
};

use super::{HaStatus, Health, RaftConfiguration, State, Status};

fn status(state: &State) -> Result<&Status, CheckFailure> {
    require(state.status.as_ref(), "vault status")
}

fn health(state: &State) -> Result<&Health, CheckFailure> {
    require(state.health.as_ref(), "sys/health")
}

fn raft(state: &State) -> Result<&RaftConfiguration, CheckFailure> {
    require(state.raft_configuration.as_ref(), "raft configuration")
}

fn ha(state: &State) -> Result<&HaStatus, CheckFailure> {
    require(state.ha_status.as_ref(), "ha status")
}

/// The seal state every source agrees on.
///
/// Sources are never reconciled: a disagreement means the node changed
/// state mid-read or reports inconsistently, and both need a fresh look.
pub fn seal_state(state: &State) -> Result<bool, CheckFailure> {
    let sources = [
        (
            "vault status",
            state.status.as_ref().map(|s| s.response.sealed),
        ),
        (
            "vault status exit code",
            state
                .status
                .as_ref()
                .map(|s| s.exit_code == super::STATUS_EXIT_SEALED),
        ),
        (
            "sys/seal-status",
            state.seal_status.as_ref().map(|s| s.sealed),
        ),
        ("sys/health", state.health.as_ref().map(|h| h.response.sealed)),
    ];

    let missing: Vec<&str> = sources
        .iter()
        .filter(|(_, sealed)| sealed.is_none())
        .map(|(name, _)| *name)
        .collect();
    if !missing.is_empty() {
        return Err(CheckFailure::new(format!(
            "seal state unknown: no data from {}",
            missing.join(", ")
        )));
    }

    let known: Vec<(&str, bool)> = sources
        .iter()
        .filter_map(|(name, sealed)| sealed.map(|s| (*name, s)))
        .collect();
    let Some(&(first_name, first)) = known.first() else {
        return Err(CheckFailure::new("seal state unknown"));
    };
    if let Some((name, sealed)) = known.iter().find(|(_, s)| *s != first) {
        return Err(CheckFailure::new(format!(
            "seal state disagrees: {first_name} reports sealed={first}, {name} reports sealed={sealed}"
        )));
    }
    Ok(first)
}

pub fn seal_state_known() -> Check<State> {
    Check::new("seal_state_known", |s: &State| seal_state(s).map(|_| ()))
}

pub fn is_initialized() -> Check<State> {
    Check::new("is_initialized", |s: &State| {
        if status(s)?.response.initialized {
            Ok(())
        } else {
            Err(CheckFailure::new("vault is not initialized"))
        }
    })
}

pub fn is_unsealed() -> Check<State> {
    Check::new("is_unsealed", |s: &State| {
        if seal_state(s)? {
            Err(CheckFailure::new("vault is sealed"))
        } else {
            Ok(())
        }
    })
}

pub fn is_sealed() -> Check<State> {
    Check::new("is_sealed", |s: &State| {
        if seal_state(s)? {
            Ok(())
        } else {
            Err(CheckFailure::new("vault is unsealed"))
        }
    })
}

/// Exactly one raft server claims leadership.
pub fn has_raft_leader() -> Check<State> {
    Check::new("has_raft_leader", |s: &State| {
        let leaders = raft(s)?.servers.iter().filter(|srv| srv.leader).count();
        if leaders == 1 {
            Ok(())
        } else {
            Err(CheckFailure::new(format!(
                "raft leader: expected exactly 1, got {leaders}"
            )))
        }
    })
}

pub fn min_raft_voters(min: usize) -> Check<State> {
    Check::new(format!("min_raft_voters({min})"), move |s: &State| {
        let voters = raft(s)?.servers.iter().filter(|srv| srv.voter).count();
        at_least("raft voters", min, voters)
    })
}

pub fn min_ha_nodes(min: usize) -> Check<State> {
    Check::new(format!("min_ha_nodes({min})"), move |s: &State| {
        at_least("ha nodes", min, ha(s)?.nodes.len())
    })
}

pub fn is_active_node() -> Check<State> {
    Check::new("is_active_node", |s: &State| {
        let health = health(s)?;
        if health.http_code == Health::ACTIVE && !health.response.standby {
            Ok(())
        } else {
            Err(CheckFailure::new(format!(
                "node is not active: sys/health returned {}",
                health.http_code
            )))
        }
    })
}

/// Matches the reported version against `prefix`, ignoring a leading `v`.
pub fn version_is(prefix: impl Into<String>) -> Check<State> {
    let prefix = prefix.into();
    let want = prefix.trim_start_matches('v').to_string();
    Check::new(format!("version_is({prefix})"), move |s: &State| {
        let version = status(s)?.response.version.trim_start_matches('v');
        if version.starts_with(&want) {
            Ok(())
        } else {
            Err(CheckFailure::new(format!(
                "version {version} does not match {want}"
            )))
        }
    })
}

pub fn unit_is_active() -> Check<State> {
    systemd::unit_is_active(|s: &State| s.unit_properties.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::{
        systemd::UnitProperties,
        vault::{HaNode, HealthResponse, RaftServer, SealStatus, StatusResponse},
    };

    fn node(sealed: bool) -> State {
        State {
            unit_properties: Some(UnitProperties::parse("ActiveState=active\nSubState=running")),
            status: Some(Status {
                exit_code: if sealed { 2 } else { 0 },
                response: StatusResponse {
                    initialized: true,
                    sealed,
                    version: "1.15.2".to_string(),
                    ..Default::default()
                },
            }),
            seal_status: Some(SealStatus {
                initialized: true,
                sealed,
                ..Default::default()
            }),
            health: Some(Health {
                http_code: if sealed { Health::SEALED } else { Health::ACTIVE },
                response: HealthResponse {
                    initialized: true,
                    sealed,
                    ..Default::default()
                },
            }),
            raft_configuration: None,
            ha_status: None,
        }
    }

    fn servers(voters: &[bool]) -> RaftConfiguration {
        RaftConfiguration {
            index: 1,
            servers: voters
                .iter()
                .enumerate()
                .map(|(i, voter)| RaftServer {
                    node_id: format!("vault_{i}"),
                    leader: i == 0,
                    voter: *voter,
                    ..Default::default()
                })
                .collect(),
        }
    }

    #[test]
    fn agreeing_sources_give_seal_state() {
        assert_eq!(seal_state(&node(false)), Ok(false));
        assert_eq!(seal_state(&node(true)), Ok(true));
        assert!(is_unsealed().evaluate(&node(false)).is_ok());
        assert!(is_sealed().evaluate(&node(true)).is_ok());
    }

    #[test]
    fn disagreement_names_both_sources() {
        let mut state = node(true);
        if let Some(seal) = state.seal_status.as_mut() {
            seal.sealed = false;
        }
        let err = seal_state_known().evaluate(&state).unwrap_err();
        assert!(err.message().contains("vault status reports sealed=true"), "{err}");
        assert!(err.message().contains("sys/seal-status reports sealed=false"), "{err}");
        assert!(is_unsealed().evaluate(&state).is_err());
        assert!(is_sealed().evaluate(&state).is_err());
    }

    #[test]
    fn exit_code_disagreeing_with_body_is_caught() {
        let mut state = node(false);
        if let Some(status) = state.status.as_mut() {
            status.exit_code = 2;
        }
        let err = seal_state(&state).unwrap_err();
        assert!(err.message().contains("vault status exit code"), "{err}");
    }

    #[test]
    fn missing_sources_are_named() {
        let mut state = node(false);
        state.health = None;
        let err = seal_state_known().evaluate(&state).unwrap_err();
        assert_eq!(err.message(), "seal state unknown: no data from sys/health");
    }

    #[test]
    fn min_voters_reports_expected_and_observed() {
        let mut state = node(false);
        state.raft_configuration = Some(servers(&[true, true, false]));

        let err = min_raft_voters(3).evaluate(&state).unwrap_err();
        assert_eq!(err.message(), "raft voters: expected at least 3, got 2");
        assert!(min_raft_voters(2).evaluate(&state).is_ok());
    }

    #[test]
    fn raft_checks_need_raft_configuration() {
        let err = has_raft_leader().evaluate(&node(false)).unwrap_err();
        assert_eq!(err.message(), "raft configuration was not fetched");
    }

    #[test]
    fn leader_must_be_unique() {
        let mut state = node(false);
        let mut raft = servers(&[true, true, true]);
        let with_raft = State {
            raft_configuration: Some(raft.clone()),
            ..state.clone()
        };
        assert!(has_raft_leader().evaluate(&with_raft).is_ok());

        raft.servers[1].leader = true;
        state.raft_configuration = Some(raft);
        let err = has_raft_leader().evaluate(&state).unwrap_err();
        assert_eq!(err.message(), "raft leader: expected exactly 1, got 2");
    }

    #[test]
    fn ha_and_activity() {
        let mut state = node(false);
        state.ha_status = Some(HaStatus {
            nodes: vec![HaNode::default(), HaNode::default()],
        });
        assert!(min_ha_nodes(2).evaluate(&state).is_ok());
        assert_eq!(
            min_ha_nodes(3).evaluate(&state).unwrap_err().message(),
            "ha nodes: expected at least 3, got 2"
        );
        assert!(is_active_node().evaluate(&state).is_ok());
        assert!(is_active_node().evaluate(&node(true)).is_err());
    }

    #[test]
    fn version_and_unit() {
        let state = node(false);
        assert!(version_is("1.15").evaluate(&state).is_ok());
        assert!(version_is("v1.15.2").evaluate(&state).is_ok());
        assert!(version_is("1.14").evaluate(&state).is_err());
        assert_eq!(version_is("1.15").name(), "version_is(1.15)");

        assert!(unit_is_active().evaluate(&state).is_ok());
        let failed = State {
            unit_properties: Some(UnitProperties::parse("ActiveState=failed\nSubState=failed")),
            ..state
        };
        assert_eq!(
            unit_is_active().evaluate(&failed).unwrap_err().message(),
            "unit is failed (failed)"
        );
    }

    #[test]
    fn uninitialized_node() {
        let mut state = node(true);
        if let Some(status) = state.status.as_mut() {
            status.response.initialized = false;
        }
        assert_eq!(
            is_initialized().evaluate(&state).unwrap_err().message(),
            "vault is not initialized"
        );
    }
}
