use std::{fmt, future::Future, sync::Arc, time::Duration};

use tracing::debug;

use crate::context::{Context, ContextError};

pub const DEFAULT_EXPONENTIAL_BASE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxRetries {
    /// Retries after the first attempt. `Limited(0)` still makes one attempt.
    Limited(u32),
    Unlimited,
}

/// Delay policy between attempts. Every variant is a pure function of the
/// retry number, which is 1 for the sleep after the first failed attempt.
#[derive(Clone)]
pub enum Interval {
    Fixed(Duration),
    Exponential(Duration),
    Fibonacci(Duration),
    /// Steady cadence for polling an eventually consistent system.
    Poll(Duration),
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl fmt::Debug for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            Self::Exponential(d) => f.debug_tuple("Exponential").field(d).finish(),
            Self::Fibonacci(d) => f.debug_tuple("Fibonacci").field(d).finish(),
            Self::Poll(d) => f.debug_tuple("Poll").field(d).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Interval {
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            Self::Fixed(d) | Self::Poll(d) => *d,
            Self::Exponential(base) => exponential_delay(*base, retry),
            Self::Fibonacci(base) => base.saturating_mul(fibonacci(retry)),
            Self::Custom(f) => f(retry),
        }
    }
}

fn exponential_delay(base: Duration, retry: u32) -> Duration {
    let mut delay = base;
    for _ in 1..retry {
        delay = match delay.checked_mul(2) {
            Some(v) => v,
            None => return Duration::MAX,
        };
    }
    delay
}

fn fibonacci(n: u32) -> u32 {
    let (mut a, mut b) = (0u32, 1u32);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

type RetryIf<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Turns a fallible async operation into a bounded, cancellable retry loop.
///
/// A `Retrier` only holds policy. Attempt counting lives inside each
/// [`Retrier::run`] call, so clones handed to nested operations never share
/// progress.
pub struct Retrier<E> {
    max_retries: MaxRetries,
    interval: Interval,
    max_interval: Option<Duration>,
    only_retry: Vec<RetryIf<E>>,
}

impl<E> Clone for Retrier<E> {
    fn clone(&self) -> Self {
        Self {
            max_retries: self.max_retries,
            interval: self.interval.clone(),
            max_interval: self.max_interval,
            only_retry: self.only_retry.clone(),
        }
    }
}

impl<E> fmt::Debug for Retrier<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retrier")
            .field("max_retries", &self.max_retries)
            .field("interval", &self.interval)
            .field("max_interval", &self.max_interval)
            .field("only_retry", &self.only_retry.len())
            .finish()
    }
}

impl<E> Default for Retrier<E> {
    /// Unlimited retries with exponential backoff seeded at two seconds; the
    /// caller's context is the only bound.
    fn default() -> Self {
        Self {
            max_retries: MaxRetries::Unlimited,
            interval: Interval::Exponential(DEFAULT_EXPONENTIAL_BASE),
            max_interval: None,
            only_retry: Vec::new(),
        }
    }
}

impl<E> Retrier<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = MaxRetries::Limited(retries);
        self
    }

    pub fn with_unlimited_retries(mut self) -> Self {
        self.max_retries = MaxRetries::Unlimited;
        self
    }

    pub fn with_interval(mut self, interval: Interval) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_interval(mut self, cap: Duration) -> Self {
        self.max_interval = Some(cap);
        self
    }

    /// Adds an entry to the retry allow-list. Once any entry is configured,
    /// errors matching none of them end the loop on the spot.
    pub fn with_only_retry_if(mut self, pred: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.only_retry.push(Arc::new(pred));
        self
    }

    pub fn max_retries(&self) -> MaxRetries {
        self.max_retries
    }

    pub fn interval(&self) -> &Interval {
        &self.interval
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.interval.delay(retry);
        match self.max_interval {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    fn is_retryable(&self, err: &E) -> bool {
        self.only_retry.is_empty() || self.only_retry.iter().any(|pred| pred(err))
    }

    pub async fn run<T, F, Fut>(&self, ctx: &Context, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut attempts: u32 = 0;
        let mut last: Option<E> = None;

        loop {
            if let Some(reason) = ctx.err() {
                return Err(RetryError::Context { reason, last });
            }

            attempts = attempts.saturating_add(1);
            let err = match ctx.run(op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(reason) => return Err(RetryError::Context { reason, last }),
            };

            if let Some(reason) = ctx.err() {
                return Err(RetryError::Context {
                    reason,
                    last: Some(err),
                });
            }

            if let MaxRetries::Limited(max) = self.max_retries
                && attempts - 1 >= max
            {
                return Err(RetryError::Exhausted {
                    attempts,
                    source: err,
                });
            }

            if !self.is_retryable(&err) {
                return Err(RetryError::NotRetryable {
                    attempts,
                    source: err,
                });
            }

            let delay = self.delay_for(attempts);
            debug!(attempt = attempts, ?delay, error = %err, "attempt failed; retrying");
            last = Some(err);

            if let Err(reason) = ctx.sleep(delay).await {
                return Err(RetryError::Context { reason, last });
            }
        }
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// The attempt budget ran out.
    Exhausted { attempts: u32, source: E },
    /// The error is outside the retry allow-list.
    NotRetryable { attempts: u32, source: E },
    /// The context finished first. `last` is the most recent attempt error.
    Context {
        reason: ContextError,
        last: Option<E>,
    },
}

impl<E> RetryError<E> {
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Exhausted { source, .. } | Self::NotRetryable { source, .. } => Some(source),
            Self::Context { last, .. } => last.as_ref(),
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            Self::Exhausted { source, .. } | Self::NotRetryable { source, .. } => Some(source),
            Self::Context { last, .. } => last,
        }
    }

    pub fn context_error(&self) -> Option<ContextError> {
        match self {
            Self::Context { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { attempts, source } => {
                write!(f, "{source} (gave up after {attempts} attempts)")
            }
            Self::NotRetryable { source, .. } => write!(f, "{source}"),
            Self::Context { reason, last: None } => write!(f, "{reason}"),
            Self::Context {
                reason,
                last: Some(last),
            } => write!(f, "{reason}; last error: {last}"),
        }
    }
}

impl<E> std::error::Error for RetryError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Exhausted { source, .. } | Self::NotRetryable { source, .. } => Some(source),
            Self::Context { reason, .. } => Some(reason),
        }
    }
}
