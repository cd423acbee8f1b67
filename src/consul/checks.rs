use crate::{
    convergence::{Check, CheckFailure, at_least, require},
    systemd,
};

use super::State;

pub fn has_leader() -> Check<State> {
    Check::new("has_leader", |s: &State| match s.leader.as_deref() {
        Some(leader) if !leader.is_empty() => Ok(()),
        Some(_) => Err(CheckFailure::new("no consul leader elected")),
        None => Err(CheckFailure::new("leader was not fetched")),
    })
}

pub fn min_voters(min: usize) -> Check<State> {
    Check::new(format!("min_voters({min})"), move |s: &State| {
        let raft = require(s.raft_configuration.as_ref(), "raft configuration")?;
        let voters = raft.servers.iter().filter(|srv| srv.voter).count();
        at_least("raft voters", min, voters)
    })
}

/// Every check registered on this node reports `passing`.
pub fn node_checks_passing() -> Check<State> {
    Check::new("node_checks_passing", |s: &State| {
        let checks = require(s.node_health.as_ref(), "node health")?;
        let failing: Vec<String> = checks
            .iter()
            .filter(|c| !c.is_passing())
            .map(|c| format!("{} is {}", c.name, c.status))
            .collect();
        if failing.is_empty() {
            Ok(())
        } else {
            Err(CheckFailure::new(failing.join(", ")))
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

    use crate::consul::{HealthCheck, RaftConfiguration, RaftServer};

    fn check(name: &str, status: &str) -> HealthCheck {
        HealthCheck {
            name: name.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    fn server(voter: bool) -> RaftServer {
        RaftServer {
            voter,
            ..Default::default()
        }
    }

    #[test]
    fn leader_must_be_non_empty() {
        let mut state = State {
            leader: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(
            has_leader().evaluate(&state).unwrap_err().message(),
            "no consul leader elected"
        );
        state.leader = Some("10.0.0.5:8300".to_string());
        assert!(has_leader().evaluate(&state).is_ok());
    }

    #[test]
    fn voters_threshold() {
        let state = State {
            raft_configuration: Some(RaftConfiguration {
                servers: vec![server(true), server(true), server(false)],
                index: 7,
            }),
            ..Default::default()
        };
        assert_eq!(
            min_voters(3).evaluate(&state).unwrap_err().message(),
            "raft voters: expected at least 3, got 2"
        );
        assert!(min_voters(2).evaluate(&state).is_ok());
    }

    #[test]
    fn failing_node_checks_are_listed() {
        let state = State {
            node_health: Some(vec![
                check("Serf Health Status", "passing"),
                check("disk", "warning"),
                check("memory", "critical"),
            ]),
            ..Default::default()
        };
        assert_eq!(
            node_checks_passing().evaluate(&state).unwrap_err().message(),
            "disk is warning, memory is critical"
        );
    }

    #[test]
    fn unit_must_be_fetched() {
        assert!(unit_is_active().evaluate(&State::default()).is_err());
    }
}
