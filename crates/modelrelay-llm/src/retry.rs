//! Retry logic with exponential backoff
//!
//! Wraps one provider's attempts. Delays come from [`backoff::ExponentialBackoff`]
//! (doubling from `base_delay`, randomized by `jitter_factor`) and are capped
//! at `max_delay`. Fallback to other providers is the router's business, not
//! this module's.

use crate::error::{Error, Result};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff parameters shared by all providers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    /// First retry delay in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound on any delay in milliseconds
    pub max_delay_ms: u64,
    /// Randomization factor (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_factor: 0.1,
        }
    }
}

impl BackoffSettings {
    /// Check the parameters are usable
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(Error::Config(format!(
                "jitter_factor must be within [0, 1], got {}",
                self.jitter_factor
            )));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(Error::Config(format!(
                "max_delay_ms ({}) must not be below base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        Ok(())
    }

    /// Upper bound on any delay
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Fresh backoff schedule
    #[must_use]
    pub fn schedule(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.base_delay_ms))
            .with_max_interval(self.max_delay())
            .with_randomization_factor(self.jitter_factor)
            .with_multiplier(2.0)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Retry budget for one provider
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay schedule
    pub backoff: BackoffSettings,
}

impl RetryPolicy {
    /// Create a policy
    #[must_use]
    pub fn new(max_retries: u32, backoff: BackoffSettings) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Total attempts including the first
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Successful result with the number of attempts it took
#[derive(Debug)]
pub struct Retried<T> {
    /// The value
    pub value: T,
    /// Attempts made, including the successful one
    pub attempts: u32,
}

/// Error type for retry operations
#[derive(Debug)]
pub struct RetryError<E> {
    /// The last error encountered
    pub last_error: E,
    /// Total number of attempts made
    pub attempts: u32,
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Operation failed after {} attempts: {}",
            self.attempts, self.last_error
        )
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for RetryError<E> {}

/// Execute an async operation with retry logic
///
/// `operation` receives the 1-based attempt number. An error is retried only
/// while attempts remain and `is_retryable` accepts it.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    operation: F,
    is_retryable: R,
) -> std::result::Result<Retried<T>, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    retry_with_hint(policy, operation, is_retryable, |_| None).await
}

/// [`retry_with_backoff`] that honors a server-supplied wait
///
/// When `retry_after` returns a hint, the next delay is the larger of the
/// hint and the backoff step, still capped at `max_delay`.
pub async fn retry_with_hint<T, E, F, Fut, R, H>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: R,
    retry_after: H,
) -> std::result::Result<Retried<T>, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    R: Fn(&E) -> bool,
    H: Fn(&E) -> Option<Duration>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts();
    let max_delay = policy.backoff.max_delay();
    let mut schedule = policy.backoff.schedule();
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(Retried { value, attempts: attempt });
            }
            Err(e) => {
                if attempt >= max_attempts || !is_retryable(&e) {
                    debug!(attempt, error = %e, "Operation failed, no more retries");
                    return Err(RetryError {
                        last_error: e,
                        attempts: attempt,
                    });
                }

                let step = schedule.next_backoff().unwrap_or(max_delay);
                let delay = retry_after(&e).map_or(step, |hint| hint.max(step)).min(max_delay);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
