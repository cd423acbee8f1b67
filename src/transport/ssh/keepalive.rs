//! Connection liveness supervision.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{broadcast, watch},
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{context::Context, transport::BoxFuture};

/// Published once when the connection stops answering keepalives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessError {
    pub addr: String,
    pub consecutive_failures: u32,
    pub last_error: String,
    pub at: DateTime<Utc>,
}

impl std::fmt::Display for LivenessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ssh connection to {} unresponsive after {} failed keepalives: {}",
            self.addr, self.consecutive_failures, self.last_error
        )
    }
}

impl std::error::Error for LivenessError {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivenessSnapshot {
    pub last_ok_at: Option<DateTime<Utc>>,
    pub last_fail_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub lost_at: Option<DateTime<Utc>>,
}

impl LivenessSnapshot {
    pub fn is_lost(&self) -> bool {
        self.lost_at.is_some()
    }
}

/// The supervised connection.
pub(crate) trait KeepaliveTarget: Send + Sync + 'static {
    /// One request the peer has to answer.
    fn ping(&self) -> BoxFuture<'_, Result<(), String>>;

    fn drop_connection(&self) -> BoxFuture<'_, ()>;
}

#[derive(Debug, Clone)]
pub(crate) struct KeepaliveOptions {
    pub addr: String,
    pub interval: Duration,
    pub fails_before_lost: u32,
    /// Canceled once the connection is marked lost.
    pub conn: Context,
}

/// Pings on a fixed period. After `fails_before_lost` consecutive failures
/// `opts.conn` is canceled, the connection is dropped, the error goes out on
/// `lost_tx` and the task ends.
pub(crate) fn spawn_keepalive(
    target: Arc<dyn KeepaliveTarget>,
    opts: KeepaliveOptions,
    lost_tx: broadcast::Sender<LivenessError>,
) -> (watch::Receiver<LivenessSnapshot>, tokio::task::JoinHandle<()>) {
    let (state_tx, state_rx) = watch::channel(LivenessSnapshot::default());

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(opts.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the connection was just
        // authenticated.
        interval.tick().await;

        loop {
            interval.tick().await;

            let result = match tokio::time::timeout(opts.interval, target.ping()).await {
                Ok(result) => result,
                Err(_) => Err(format!("no keepalive reply within {:?}", opts.interval)),
            };
            let now = Utc::now();

            match result {
                Ok(()) => {
                    state_tx.send_modify(|s| {
                        if s.consecutive_failures > 0 {
                            info!(addr = %opts.addr, "ssh keepalive recovered");
                        }
                        s.last_ok_at = Some(now);
                        s.consecutive_failures = 0;
                    });
                    debug!(addr = %opts.addr, "ssh keepalive ok");
                }
                Err(err) => {
                    let mut failures = 0;
                    state_tx.send_modify(|s| {
                        s.last_fail_at = Some(now);
                        s.consecutive_failures = s.consecutive_failures.saturating_add(1);
                        failures = s.consecutive_failures;
                    });

                    if failures < opts.fails_before_lost {
                        debug!(
                            addr = %opts.addr,
                            consecutive_failures = failures,
                            error = %err,
                            "ssh keepalive failed"
                        );
                        continue;
                    }

                    state_tx.send_modify(|s| s.lost_at = Some(now));
                    warn!(
                        addr = %opts.addr,
                        consecutive_failures = failures,
                        error = %err,
                        "ssh connection marked lost"
                    );
                    opts.conn.cancel();
                    // A half-open socket may not drain; do not wait on it forever.
                    let _ = tokio::time::timeout(opts.interval, target.drop_connection()).await;
                    let _ = lost_tx.send(LivenessError {
                        addr: opts.addr.clone(),
                        consecutive_failures: failures,
                        last_error: err,
                        at: now,
                    });
                    return;
                }
            }
        }
    });

    (state_rx, task)
}
