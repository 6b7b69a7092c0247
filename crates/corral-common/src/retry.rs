//! Backoff utilities: retrying transient failures and polling for completion
//!
//! [`retry_with_backoff`] re-runs an operation that failed transiently.
//! [`poll_until`] waits for some external state (a cloud operation reaching
//! `DONE`) under a deadline and a cancellation token, so a reconcile that is
//! stuck waiting can be abandoned and re-delivered by the controller runtime.
//!
//! # Example
//!
//! ```ignore
//! use corral_common::retry::{poll_until, PollConfig};
//!
//! let op = poll_until(&PollConfig::default(), &cancel, "operation-123", || async {
//!     let op = compute.zone_operations_get(project, zone, "operation-123").await?;
//!     Ok(op.is_done().then_some(op))
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::Error;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Only retryable errors (see [`Error::is_retryable`]) are retried; a
/// permanent error is returned on the attempt that produced it.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let jittered_delay = jitter(delay);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;
                delay = next_delay(delay, config.backoff_multiplier, config.max_delay);
            }
        }
    }
}

/// Longest deadline [`PollConfig::validate`] accepts
pub const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Bounds and pacing for [`poll_until`]
#[derive(Clone, Debug)]
pub struct PollConfig {
    /// Delay before the second check
    pub interval: Duration,
    /// Upper bound on the delay between checks
    pub max_interval: Duration,
    /// Growth factor applied to the delay after each check
    pub backoff_multiplier: f64,
    /// Total time allowed before giving up with [`Error::Timeout`]
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(30),
            backoff_multiplier: 1.5,
            timeout: Duration::from_secs(600),
        }
    }
}

impl PollConfig {
    /// Fixed starting interval and deadline, default growth
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            max_interval: Duration::from_secs(30).max(interval),
            ..Default::default()
        }
    }

    /// Reject pacing that would spin on the API or overflow the deadline
    pub fn validate(&self) -> Result<(), Error> {
        if self.interval.is_zero() {
            return Err(Error::configuration("poll interval must be greater than zero"));
        }
        if self.timeout.is_zero() || self.timeout > MAX_POLL_TIMEOUT {
            return Err(Error::configuration(format!(
                "operation timeout must be between 1s and {}s, got {}s",
                MAX_POLL_TIMEOUT.as_secs(),
                self.timeout.as_secs()
            )));
        }
        Ok(())
    }
}

/// Call `check` until it yields a value, the deadline passes, or `cancel` fires.
///
/// The first check runs immediately and each check is abandoned when
/// `cancel` fires. Check errors end the poll and are returned unchanged.
pub async fn poll_until<F, Fut, T>(
    config: &PollConfig,
    cancel: &CancellationToken,
    what: &str,
    mut check: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, Error>>,
{
    let started = Instant::now();
    let deadline = started
        .checked_add(config.timeout)
        .unwrap_or(started + MAX_POLL_TIMEOUT);
    let mut delay = config.interval;

    loop {
        if let Some(value) = cancellable(cancel, what, check()).await? {
            return Ok(value);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout {
                operation: what.to_string(),
                elapsed_secs: started.elapsed().as_secs(),
            });
        }

        let sleep_for = delay.min(deadline - now);
        debug!(operation = %what, delay_ms = sleep_for.as_millis(), "Not done yet, polling again");

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled {
                    operation: what.to_string(),
                });
            }
            _ = tokio::time::sleep(sleep_for) => {}
        }

        delay = next_delay(delay, config.backoff_multiplier, config.max_interval);
    }
}

/// Await a single external call, abandoning it once `cancel` fires.
///
/// The call future is dropped on cancellation, so an HTTP request is aborted
/// and a child process spawned with `kill_on_drop` is killed.
pub async fn cancellable<T, Fut>(cancel: &CancellationToken, what: &str, call: Fut) -> Result<T, Error>
where
    Fut: Future<Output = Result<T, Error>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled {
            operation: what.to_string(),
        }),
        result = call => result,
    }
}

/// Scale a delay by 0.5x to 1.5x
fn jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

fn next_delay(current: Duration, multiplier: f64, max: Duration) -> Duration {
    Duration::from_secs_f64((current.as_secs_f64() * multiplier).min(max.as_secs_f64()))
}
