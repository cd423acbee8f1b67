//! Polling a remote system until its state satisfies a list of checks.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use tracing::{debug, info};

use crate::{
    context::{Context, ContextError},
    retry::{Interval, Retrier, RetryError},
};

/// Why a check rejected a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckFailure {
    message: String,
}

impl CheckFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CheckFailure {}

type CheckFn<S> = Arc<dyn Fn(&S) -> Result<(), CheckFailure> + Send + Sync>;

/// A named, pure predicate over a snapshot.
pub struct Check<S> {
    name: String,
    f: CheckFn<S>,
}

impl<S> Clone for Check<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            f: self.f.clone(),
        }
    }
}

impl<S> fmt::Debug for Check<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Check").field(&self.name).finish()
    }
}

impl<S> Check<S> {
    pub fn new(
        name: impl Into<String>,
        f: impl Fn(&S) -> Result<(), CheckFailure> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn evaluate(&self, state: &S) -> Result<(), CheckFailure> {
        (self.f)(state)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedCheck {
    pub check: String,
    pub failure: CheckFailure,
}

impl fmt::Display for FailedCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "check {} failed: {}", self.check, self.failure)
    }
}

/// Unwraps a snapshot field, failing the check when it was not fetched.
pub fn require<'a, T>(field: Option<&'a T>, what: &str) -> Result<&'a T, CheckFailure> {
    field.ok_or_else(|| CheckFailure::new(format!("{what} was not fetched")))
}

pub fn at_least(what: &str, min: usize, got: usize) -> Result<(), CheckFailure> {
    if got >= min {
        Ok(())
    } else {
        Err(CheckFailure::new(format!(
            "{what}: expected at least {min}, got {got}"
        )))
    }
}

/// Evaluates `checks` in order and stops at the first failure. Order is
/// significant: a check may assume that the ones before it passed.
pub fn check_all<S>(state: &S, checks: &[Check<S>]) -> Result<(), FailedCheck> {
    for check in checks {
        check.evaluate(state).map_err(|failure| FailedCheck {
            check: check.name.clone(),
            failure,
        })?;
    }
    Ok(())
}

/// Outcome of one poll that did not converge.
#[derive(Debug)]
pub enum IterationFailure<S, E> {
    Assemble(E),
    Check { failed: FailedCheck, state: S },
}

impl<S, E: fmt::Display> fmt::Display for IterationFailure<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assemble(e) => write!(f, "assemble state: {e}"),
            Self::Check { failed, .. } => write!(f, "{failed}"),
        }
    }
}

#[derive(Debug)]
pub struct WaitError<S, E> {
    /// Set when cancellation or the deadline ended the wait; `None` when a
    /// bounded poll budget ran out first.
    pub reason: Option<ContextError>,
    pub iterations: u32,
    pub last_failure: Option<IterationFailure<S, E>>,
}

impl<S, E> WaitError<S, E> {
    /// The latest snapshot that was assembled but rejected by a check.
    pub fn last_state(&self) -> Option<&S> {
        match &self.last_failure {
            Some(IterationFailure::Check { state, .. }) => Some(state),
            _ => None,
        }
    }

    pub fn failed_check(&self) -> Option<&FailedCheck> {
        match &self.last_failure {
            Some(IterationFailure::Check { failed, .. }) => Some(failed),
            _ => None,
        }
    }
}

impl<S, E: fmt::Display> fmt::Display for WaitError<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            Some(reason) => write!(
                f,
                "state did not converge ({reason}) after {} polls",
                self.iterations
            )?,
            None => write!(f, "state did not converge after {} polls", self.iterations)?,
        }
        if let Some(last) = &self.last_failure {
            write!(f, "; last failure: {last}")?;
        }
        Ok(())
    }
}

impl<S: fmt::Debug, E: fmt::Display + fmt::Debug> std::error::Error for WaitError<S, E> {}

/// The poll policy: a steady cadence, bounded only by `ctx`.
pub fn poll_retrier<T>(poll_interval: Duration) -> Retrier<T> {
    Retrier::new()
        .with_unlimited_retries()
        .with_interval(Interval::Poll(poll_interval))
}

pub async fn wait_for<S, E, F, Fut>(
    ctx: &Context,
    poll_interval: Duration,
    assemble: F,
    checks: &[Check<S>],
) -> Result<S, WaitError<S, E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S, E>>,
    E: fmt::Display,
{
    wait_with(ctx, &poll_retrier(poll_interval), assemble, checks).await
}

/// Assembles a fresh snapshot per iteration and returns the first one that
/// passes every check.
pub async fn wait_with<S, E, F, Fut>(
    ctx: &Context,
    retrier: &Retrier<IterationFailure<S, E>>,
    mut assemble: F,
    checks: &[Check<S>],
) -> Result<S, WaitError<S, E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S, E>>,
    E: fmt::Display,
{
    let mut iterations: u32 = 0;

    let result = retrier
        .run(ctx, || {
            iterations = iterations.saturating_add(1);
            let iteration = iterations;
            let assembled = assemble();
            async move {
                let state = assembled.await.map_err(IterationFailure::Assemble)?;
                match check_all(&state, checks) {
                    Ok(()) => Ok(state),
                    Err(failed) => {
                        debug!(
                            iteration,
                            check = %failed.check,
                            failure = %failed.failure,
                            "state not converged"
                        );
                        Err(IterationFailure::Check { failed, state })
                    }
                }
            }
        })
        .await;

    match result {
        Ok(state) => {
            info!(iterations, checks = checks.len(), "state converged");
            Ok(state)
        }
        Err(RetryError::Context { reason, last }) => Err(WaitError {
            reason: Some(reason),
            iterations,
            last_failure: last,
        }),
        Err(RetryError::Exhausted { source, .. } | RetryError::NotRetryable { source, .. }) => {
            Err(WaitError {
                reason: None,
                iterations,
                last_failure: Some(source),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    use pretty_assertions::assert_eq;

    #[derive(Debug, Clone, PartialEq)]
    struct Snap {
        poll: u32,
        ready: bool,
    }

    fn snap(poll: u32, ready: bool) -> Snap {
        Snap { poll, ready }
    }

    fn ready() -> Check<Snap> {
        Check::new("ready", |s: &Snap| {
            if s.ready {
                Ok(())
            } else {
                Err(CheckFailure::new(format!("not ready at poll {}", s.poll)))
            }
        })
    }

    #[test]
    fn field_helpers_name_what_is_missing() {
        let missing: Option<&u32> = None;
        assert_eq!(
            require(missing, "raft configuration").unwrap_err().message(),
            "raft configuration was not fetched"
        );
        assert_eq!(require(Some(&7), "x").unwrap(), &7);

        assert!(at_least("voters", 3, 3).is_ok());
        assert_eq!(
            at_least("voters", 3, 1).unwrap_err().message(),
            "voters: expected at least 3, got 1"
        );
    }

    fn never(counter: &'static AtomicU32) -> Check<Snap> {
        Check::new("never", move |_: &Snap| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(CheckFailure::new("never passes"))
        })
    }

    #[test]
    fn check_all_short_circuits_in_order() {
        static SECOND: AtomicU32 = AtomicU32::new(0);
        let checks = [ready(), never(&SECOND)];

        let err = check_all(&snap(1, false), &checks).unwrap_err();
        assert_eq!(err.check, "ready");
        assert_eq!(SECOND.load(Ordering::SeqCst), 0);

        let err = check_all(&snap(2, true), &checks).unwrap_err();
        assert_eq!(err.check, "never");
        assert_eq!(SECOND.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_check_list_passes() {
        assert!(check_all::<Snap>(&snap(0, false), &[]).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn converges_on_third_poll() {
        let polls = &AtomicU32::new(0);
        let state = wait_for(
            &Context::background(),
            Duration::from_secs(5),
            move || async move {
                let poll = polls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok::<_, String>(Snap {
                    poll,
                    ready: poll >= 3,
                })
            },
            &[ready()],
        )
        .await
        .unwrap();

        assert_eq!(state, snap(3, true));
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn assembly_errors_are_retried() {
        let polls = &AtomicU32::new(0);
        let state = wait_for(
            &Context::background(),
            Duration::from_secs(1),
            move || async move {
                let poll = polls.fetch_add(1, Ordering::SeqCst) + 1;
                if poll == 1 {
                    Err("connection reset".to_string())
                } else {
                    Ok(snap(poll, true))
                }
            },
            &[ready()],
        )
        .await
        .unwrap();
        assert_eq!(state.poll, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reports_last_failed_check_and_state() {
        let ctx = Context::background().with_timeout(Duration::from_secs(12));
        let err = wait_for(
            &ctx,
            Duration::from_secs(5),
            || async { Ok::<_, String>(snap(0, false)) },
            &[ready()],
        )
        .await
        .unwrap_err();

        assert_eq!(err.reason, Some(ContextError::DeadlineExceeded));
        assert_eq!(err.iterations, 3);
        assert_eq!(err.failed_check().unwrap().check, "ready");
        assert_eq!(err.last_state(), Some(&snap(0, false)));
        assert_eq!(
            err.to_string(),
            "state did not converge (context deadline exceeded) after 3 polls; \
             last failure: check ready failed: not ready at poll 0"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn canceled_context_is_distinguishable() {
        let ctx = Context::background();
        let canceler = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            canceler.cancel();
        });

        let err = wait_for(
            &ctx,
            Duration::from_secs(5),
            || async { Err::<Snap, _>("unreachable".to_string()) },
            &[ready()],
        )
        .await
        .unwrap_err();

        assert_eq!(err.reason, Some(ContextError::Canceled));
        assert!(err.last_state().is_none());
        assert!(matches!(err.last_failure, Some(IterationFailure::Assemble(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_budget_reports_no_context_reason() {
        let retrier = Retrier::new()
            .with_max_retries(2)
            .with_interval(Interval::Poll(Duration::from_secs(1)));
        let err = wait_with(
            &Context::background(),
            &retrier,
            || async { Ok::<_, String>(snap(0, false)) },
            &[ready()],
        )
        .await
        .unwrap_err();
        assert_eq!(err.reason, None);
        assert_eq!(err.iterations, 3);
    }
}
