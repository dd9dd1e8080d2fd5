//! Backoff for failed connector calls.
//!
//! A call is repeated only when its error says it is transient
//! ([`Retryable::is_retryable`]) and the [`RetryPolicy`] still allows another
//! attempt. A third party that names its own wait (a rate limit with
//! `Retry-After`) is honored up to the policy's `max_delay`.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// How often a connector call is attempted and how long to wait in between.
///
/// The delay after failed attempt `n` is
/// `initial_delay * backoff_multiplier^(n-1)`, never more than `max_delay`.
///
/// ```
/// use lethe::core::RetryPolicy;
/// use std::time::Duration;
///
/// let vendor = RetryPolicy {
///     max_attempts: 4,
///     initial_delay: Duration::from_millis(500),
///     max_delay: Duration::from_secs(2),
///     backoff_multiplier: 3.0,
/// };
/// assert_eq!(vendor.delay_for_attempt(1), Some(Duration::from_millis(500)));
/// assert_eq!(vendor.delay_for_attempt(2), Some(Duration::from_millis(1500)));
/// assert_eq!(vendor.delay_for_attempt(3), Some(Duration::from_secs(2)));
/// assert_eq!(vendor.delay_for_attempt(4), None);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts per task, the first call included. `1` disables retries.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// Ceiling for any single wait, including one a rate limit asks for.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Wait before the attempt after failed attempt `attempt` (1-indexed), or
    /// `None` once the task has used all of its attempts.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }

        let exponent = attempt.saturating_sub(1) as f64;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powf(exponent);
        Some(Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64())))
    }

    /// The wait after a failed attempt, stretched to what the error asks
    /// for but never past `max_delay`.
    fn wait_after<E: Retryable>(&self, attempt: u32, error: &E) -> Option<Duration> {
        let backoff = self.delay_for_attempt(attempt)?;
        Some(match error.retry_after() {
            Some(requested) => backoff.max(requested.min(self.max_delay)),
            None => backoff,
        })
    }
}

impl Default for RetryPolicy {
    /// Three attempts, one second then two seconds apart.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

/// Classification of a failed call.
pub trait Retryable {
    /// True for failures another attempt may fix: dropped connections,
    /// timeouts, rate limits.
    fn is_retryable(&self) -> bool;

    /// A wait the remote side asked for, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// runs out of attempts. The operation receives the 1-indexed attempt.
pub async fn retry_with_policy<F, Fut, T, E>(policy: RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempt = 1;

    loop {
        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !error.is_retryable() {
            tracing::debug!(attempt, %error, "connector call failed permanently");
            return Err(error);
        }

        let Some(delay) = policy.wait_after(attempt, &error) else {
            tracing::warn!(
                attempt,
                max_attempts = policy.max_attempts,
                %error,
                "connector call out of attempts"
            );
            return Err(error);
        };

        tracing::warn!(attempt, ?delay, %error, "connector call failed, retrying");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
