use std::time::Duration;

use pretty_assertions::assert_eq;

use vigil::{
    context::{Context, ContextError},
    convergence::IterationFailure,
    transport::{
        TransportKind,
        scripted::{Reply, ScriptedTransport},
    },
    vault::{self, StateRequest, checks},
};

const STATUS_UNINITIALIZED: &str = r#"{"type":"shamir","initialized":false,"sealed":true,"t":0,"n":0,"progress":0,"version":"1.15.2","storage_type":"raft","ha_enabled":false}"#;
const STATUS_READY: &str = r#"{"type":"shamir","initialized":true,"sealed":false,"t":3,"n":5,"progress":0,"version":"1.15.2","storage_type":"raft","ha_enabled":false,"is_self":true}"#;
const SEAL_UNINITIALIZED: &str = r#"{"data":{"type":"shamir","initialized":false,"sealed":true,"t":0,"n":0,"progress":0,"version":"1.15.2"}}"#;
const SEAL_READY: &str = r#"{"data":{"type":"shamir","initialized":true,"sealed":false,"t":3,"n":5,"progress":0,"version":"1.15.2"}}"#;
const HEALTH_UNINITIALIZED: &str =
    "{\"initialized\":false,\"sealed\":true,\"standby\":true,\"version\":\"1.15.2\"}\n501";
const HEALTH_READY: &str =
    "{\"initialized\":true,\"sealed\":false,\"standby\":false,\"version\":\"1.15.2\"}\n200";
const PEERS: &str = r#"{"data":{"config":{"index":12,"servers":[
  {"node_id":"vault_1","address":"10.0.0.5:8201","leader":true,"voter":true,"protocol_version":"3"},
  {"node_id":"vault_2","address":"10.0.0.6:8201","leader":false,"voter":true,"protocol_version":"3"},
  {"node_id":"vault_3","address":"10.0.0.7:8201","leader":false,"voter":true,"protocol_version":"3"}
]}}}"#;

/// A node that finishes initializing and unsealing after `ready_from` polls.
fn node_ready_from(ready_from: usize) -> ScriptedTransport {
    let pick = move |ready: &'static str, pending: &'static str| {
        move |call: usize| -> &'static str { if call >= ready_from { ready } else { pending } }
    };

    let status = pick(STATUS_READY, STATUS_UNINITIALIZED);
    let seal = pick(SEAL_READY, SEAL_UNINITIALIZED);
    let health = pick(HEALTH_READY, HEALTH_UNINITIALIZED);

    ScriptedTransport::new()
        .with_kind(TransportKind::Kubernetes)
        .on_call("vault status", move |call| {
            let body = status(call);
            if call >= ready_from {
                Reply::ok(body)
            } else {
                Reply::exit(2, body)
            }
        })
        .on_call("sys/seal-status", move |call| Reply::ok(seal(call)))
        .on_call("/v1/sys/health", move |call| Reply::ok(health(call)))
        .on("raft list-peers", Reply::ok(PEERS))
}

fn cluster_checks() -> Vec<vigil::convergence::Check<vault::State>> {
    vec![
        checks::is_initialized(),
        checks::is_unsealed(),
        checks::has_raft_leader(),
        checks::min_raft_voters(3),
    ]
}

fn status_calls(tr: &ScriptedTransport) -> usize {
    tr.commands()
        .iter()
        .filter(|c| c.text().contains("vault status"))
        .count()
}

#[tokio::test(start_paused = true)]
async fn waits_until_node_is_initialized_and_unsealed() {
    let tr = node_ready_from(2);
    let req = StateRequest::new()
        .with_token("hvs.test")
        .with_poll_interval(Duration::from_secs(5));
    let ctx = Context::background().with_timeout(Duration::from_secs(60));

    let state = vault::wait_for_state(&ctx, &tr, &req, &cluster_checks())
        .await
        .unwrap();

    assert_eq!(status_calls(&tr), 3);
    let status = state.status.unwrap();
    assert!(status.response.initialized);
    assert_eq!(status.exit_code, 0);
    assert_eq!(state.raft_configuration.unwrap().servers.len(), 3);

    // raft is only read once the node reports itself ready.
    let peers_reads = tr
        .commands()
        .iter()
        .filter(|c| c.text().contains("list-peers"))
        .count();
    assert_eq!(peers_reads, 1);
}

#[tokio::test(start_paused = true)]
async fn deadline_reports_last_rejected_snapshot() {
    let tr = node_ready_from(usize::MAX);
    let req = StateRequest::new()
        .with_token("hvs.test")
        .with_poll_interval(Duration::from_secs(5));
    let ctx = Context::background().with_timeout(Duration::from_secs(12));

    let err = vault::wait_for_state(&ctx, &tr, &req, &cluster_checks())
        .await
        .unwrap_err();

    assert_eq!(err.reason, Some(ContextError::DeadlineExceeded));
    assert_eq!(err.iterations, 3);
    assert_eq!(err.failed_check().unwrap().check, "is_initialized");

    let last = err.last_state().unwrap();
    assert!(!last.status.as_ref().unwrap().response.initialized);
    assert_eq!(last.health.as_ref().unwrap().http_code, vault::Health::NOT_INITIALIZED);
    assert_eq!(last.raft_configuration, None);
    assert!(
        err.to_string()
            .ends_with("last failure: check is_initialized failed: vault is not initialized"),
        "{err}"
    );
}

#[tokio::test(start_paused = true)]
async fn fetch_failures_are_polled_through() {
    let tr = ScriptedTransport::new()
        .with_kind(TransportKind::Kubernetes)
        .on_call("vault status", |call| {
            if call < 3 {
                Reply::exit(1, "").with_stderr("Error checking seal status: connection refused")
            } else {
                Reply::ok(STATUS_READY)
            }
        })
        .on("sys/seal-status", Reply::ok(SEAL_READY))
        .on("/v1/sys/health", Reply::ok(HEALTH_READY));
    let req = StateRequest::new().with_poll_interval(Duration::from_secs(5));
    let ctx = Context::background().with_timeout(Duration::from_secs(60));

    let state = vault::wait_for_state(
        &ctx,
        &tr,
        &req,
        &[checks::seal_state_known(), checks::is_unsealed()],
    )
    .await
    .unwrap();

    assert_eq!(state.status.unwrap().exit_code, 0);
    assert!(status_calls(&tr) >= 4);
}

#[tokio::test]
async fn canceled_wait_keeps_assemble_error() {
    let tr = ScriptedTransport::new()
        .with_kind(TransportKind::Kubernetes)
        .on("vault status", Reply::exit(1, "").with_stderr("connection refused"));
    let ctx = Context::background();
    ctx.cancel();

    let err = vault::wait_for_state(&ctx, &tr, &StateRequest::new(), &cluster_checks())
        .await
        .unwrap_err();
    assert_eq!(err.reason, Some(ContextError::Canceled));
    assert!(matches!(
        err.last_failure,
        None | Some(IterationFailure::Assemble(_))
    ));
}

#[tokio::test]
async fn snapshots_are_independent_values() {
    let tr = node_ready_from(1);
    let ctx = Context::background();
    let req = StateRequest::new();

    let first = vault::get_state(&ctx, &tr, &req).await.unwrap();
    let second = vault::get_state(&ctx, &tr, &req).await.unwrap();

    assert!(!first.status.as_ref().unwrap().response.initialized);
    assert!(second.status.as_ref().unwrap().response.initialized);
    assert_ne!(first, second);
}
