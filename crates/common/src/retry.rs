//! Retry and backoff policy shared by every worker that talks to a remote node.
//!
//! The policy is a floor/ceiling pair. A [`Backoff`] starts sleeping for the floor, doubles the
//! interval after every consecutive failure until it hits the ceiling and snaps back to the floor
//! after a success. [`retry_with`] drives a fallible future generator with that discipline,
//! consulting a classifier to decide which errors are worth retrying, and gives up early when the
//! supplied [`CancellationToken`] fires.

use std::{
    fmt,
    future::Future,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default floor of the backoff interval.
pub const DEFAULT_RETRY_SLEEP_TIME: Duration = Duration::from_secs(5);

/// Default ceiling of the backoff interval.
pub const DEFAULT_MAX_RETRY_SLEEP_TIME: Duration = Duration::from_secs(5 * 60);

/// Floor and ceiling of an exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Initial interval, used after the first failure and after every success.
    pub retry_sleep_time: Duration,

    /// Upper bound of the interval.
    pub max_retry_sleep_time: Duration,
}

impl RetryPolicy {
    /// Creates a new policy.
    pub const fn new(retry_sleep_time: Duration, max_retry_sleep_time: Duration) -> Self {
        Self {
            retry_sleep_time,
            max_retry_sleep_time,
        }
    }

    /// Creates a fresh [`Backoff`] governed by this policy.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(*self)
    }

    /// Returns `min(retry_sleep_time * 2^failures, max_retry_sleep_time)`.
    ///
    /// A ceiling below the floor is treated as equal to the floor.
    pub fn interval_after(&self, failures: u32) -> Duration {
        let ceiling = self.max_retry_sleep_time.max(self.retry_sleep_time);

        2u32.checked_pow(failures)
            .and_then(|factor| self.retry_sleep_time.checked_mul(factor))
            .map_or(ceiling, |interval| interval.min(ceiling))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_SLEEP_TIME, DEFAULT_MAX_RETRY_SLEEP_TIME)
    }
}

/// Mutable backoff state: the number of consecutive failures and the last successful contact.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
    last_success: Option<Instant>,
}

impl Backoff {
    /// Creates a backoff sitting at the floor of `policy`.
    pub const fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            last_success: None,
        }
    }

    /// The interval that the next failure will sleep for.
    pub fn current(&self) -> Duration {
        self.policy.interval_after(self.failures)
    }

    /// Number of consecutive failures since the last success.
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// When the last success was recorded, if ever.
    pub const fn last_success(&self) -> Option<Instant> {
        self.last_success
    }

    /// Records a failure and returns how long the caller should sleep before trying again.
    pub fn record_failure(&mut self) -> Duration {
        let delay = self.current();
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Records a success, resetting the interval to the floor.
    pub fn record_success(&mut self) {
        self.failures = 0;
        self.last_success = Some(Instant::now());
    }
}

/// What to do with an error returned by a retried operation.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetryAction {
    /// Sleep for the current backoff interval and try again.
    Retry,

    /// Stop retrying and return the error.
    Stop,
}

/// Reasons [`retry_with`] returns without a result.
#[derive(Debug, Error)]
pub enum RetryError<E: fmt::Display> {
    /// The classifier decided the error is not worth retrying.
    #[error("giving up: {0}")]
    Stopped(E),

    /// Cancellation was requested while waiting.
    #[error("cancelled while retrying")]
    Cancelled,
}

/// Sleeps for `delay` unless `cancel` fires first.
///
/// Returns `true` if the full delay elapsed.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Repeatedly runs futures produced by `generator` until one succeeds, the classifier returns
/// [`RetryAction::Stop`], or `cancel` fires.
///
/// There is no attempt ceiling. The classifier receives the error and the number of failures so
/// far, which lets callers impose one if they want.
pub async fn retry_with<A, E, Fut, Gen, C>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    classify: C,
    mut generator: Gen,
) -> Result<A, RetryError<E>>
where
    E: fmt::Display,
    Fut: Future<Output = Result<A, E>>,
    Gen: FnMut() -> Fut,
    C: Fn(&E, u32) -> RetryAction,
{
    let mut backoff = policy.backoff();

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = generator() => result,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) => match classify(&err, backoff.failures()) {
                RetryAction::Stop => return Err(RetryError::Stopped(err)),
                RetryAction::Retry => {
                    let delay = backoff.record_failure();
                    debug!(%err, ?delay, failures = backoff.failures(), "retrying after failure");

                    if !sleep_or_cancel(delay, cancel).await {
                        return Err(RetryError::Cancelled);
                    }
                }
            },
        }
    }
}
