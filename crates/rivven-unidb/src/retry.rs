//! Bounded exponential-backoff retry.
//!
//! [`run_with_retry`] attempts an operation up to `max_retries + 1` times.
//! The delay before retry `n` is `min(min_delay * backoff_factor^(n-1), max_delay)`.
//! Every retry is reported to a [`RetryObserver`] (and logged) before the
//! task sleeps; the final failure is returned unchanged.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;
use validator::Validate;

use crate::error::{Error, Result};

/// Retry policy passed to a dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not including the initial attempt)
    #[serde(default = "default_max_retries")]
    #[validate(range(max = 100))]
    pub max_retries: u32,

    /// Multiplier applied to the delay after every failed attempt
    #[serde(default = "default_backoff_factor")]
    #[validate(range(min = 1.0, max = 100.0))]
    pub backoff_factor: f64,

    /// Delay before the first retry
    #[serde(
        rename = "min_delay_ms",
        default = "default_min_delay",
        with = "crate::config::duration_ms"
    )]
    pub min_delay: Duration,

    /// Upper bound for any single delay
    #[serde(
        rename = "max_delay_ms",
        default = "default_max_delay",
        with = "crate::config::duration_ms"
    )]
    pub max_delay: Duration,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_min_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_factor: default_backoff_factor(),
            min_delay: default_min_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Create a default retry policy
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set max retries (builder pattern)
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set backoff factor (builder pattern)
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Set initial delay (builder pattern)
    pub fn with_min_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self
    }

    /// Set max delay (builder pattern)
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Total number of attempts this policy allows
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry `attempt` (1-indexed); zero for attempt 0
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        // cap the exponent so powi cannot overflow to inf
        let exponent = attempt.min(64) as i32 - 1;
        let base = self.min_delay.as_nanos() as f64 * self.backoff_factor.powi(exponent);
        let max = self.max_delay.as_nanos() as f64;

        if base.is_nan() || base <= 0.0 {
            Duration::ZERO
        } else if base >= max {
            self.max_delay
        } else {
            Duration::from_nanos(base as u64)
        }
    }
}

/// A retry that is about to be scheduled
#[derive(Debug)]
pub struct RetryEvent<'a> {
    /// Number of the failed attempt (1 for the initial call)
    pub attempt: u32,
    /// Delay before the next attempt
    pub delay: Duration,
    /// Error that caused the retry
    pub error: &'a Error,
}

/// Observability hook invoked before every retry sleep
pub trait RetryObserver: Send + Sync {
    /// Called once per scheduled retry
    fn on_retry(&self, event: &RetryEvent<'_>);
}

impl<F> RetryObserver for F
where
    F: Fn(&RetryEvent<'_>) + Send + Sync,
{
    fn on_retry(&self, event: &RetryEvent<'_>) {
        self(event)
    }
}

/// Observer that ignores retry events
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RetryObserver for NoopObserver {
    fn on_retry(&self, _event: &RetryEvent<'_>) {}
}

/// Run `operation` under `policy`, retrying every failure with backoff.
///
/// # Example
///
/// ```rust,ignore
/// use rivven_unidb::retry::{run_with_retry, NoopObserver, RetryPolicy};
///
/// let policy = RetryPolicy::default().with_max_retries(3);
/// let rows = run_with_retry(&policy, &NoopObserver, || async {
///     handle.execute(&query, &params).await
/// })
/// .await?;
/// ```
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    observer: &dyn RetryObserver,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt > policy.max_retries {
                    return Err(error);
                }

                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "operation failed, retrying"
                );
                observer.on_retry(&RetryEvent {
                    attempt,
                    delay,
                    error: &error,
                });
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.min_delay, Duration::from_millis(100));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn test_delay_calculation_exponential() {
        let policy = RetryPolicy::new()
            .with_min_delay(Duration::from_millis(100))
            .with_backoff_factor(2.0)
            .with_max_delay(Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy::new()
            .with_min_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_factor(10.0);

        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(500), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_transient_failures() {
        let policy = RetryPolicy::new().with_max_retries(3);
        let calls = Arc::new(AtomicU32::new(0));

        let result = run_with_retry(&policy, &NoopObserver, || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::internal("temporary failure"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_returns_last_error() {
        let policy = RetryPolicy::new().with_max_retries(2);
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = run_with_retry(&policy, &NoopObserver, || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(Error::internal(format!("failure {n}")))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err().to_string(), "internal error: failure 3");
    }

    #[tokio::test]
    async fn test_no_retry_policy_single_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = run_with_retry(&RetryPolicy::no_retry(), &NoopObserver, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::internal("boom")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
