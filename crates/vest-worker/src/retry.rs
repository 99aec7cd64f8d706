//! Retry helpers for infrastructure calls made by the worker itself.
//!
//! Job-level retries go through the queue; these helpers cover the pool's
//! own background calls (claims, lock renewal, maintenance sweeps) and the
//! self-check binary.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Backoff settings for a retried store call.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first call
    pub max_retries: u32,
    /// First delay; doubled on every further retry
    pub base_delay: Duration,
    /// Upper bound of a single delay
    pub max_delay: Duration,
    /// Label used in log lines
    pub operation_name: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            operation_name: "store call".to_string(),
        }
    }
}

impl RetryConfig {
    pub fn new(operation_name: impl Into<String>) -> Self {
        Self {
            operation_name: operation_name.into(),
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Execute an async operation, retrying failures with exponential backoff.
///
/// Returns the last error together with the number of attempts made.
pub async fn retry_async<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, (E, u32)>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut retries = 0u32;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if retries >= config.max_retries {
            return Err((err, retries + 1));
        }
        retries += 1;
        let wait = config.backoff(retries);
        debug!(
            operation = %config.operation_name,
            retry = retries,
            wait_ms = wait.as_millis() as u64,
            "Store call failed: {}", err
        );
        tokio::time::sleep(wait).await;
    }
}

/// Counts consecutive failures of a background loop so an unreachable
/// store is reported a few times instead of on every tick.
#[derive(Debug, Default)]
pub struct FailureTracker {
    streak: u32,
    log_limit: u32,
    muted: bool,
}

impl FailureTracker {
    pub fn new(log_limit: u32) -> Self {
        Self {
            streak: 0,
            log_limit,
            muted: false,
        }
    }

    pub fn record_success(&mut self) {
        if self.muted {
            info!(failures = self.streak, "Store calls recovered");
        }
        self.streak = 0;
        self.muted = false;
    }

    /// Returns whether the caller should log this failure.
    pub fn record_failure(&mut self) -> bool {
        self.streak += 1;
        if self.streak <= self.log_limit {
            return true;
        }
        if !self.muted {
            self.muted = true;
            warn!(failures = self.streak, "Store keeps failing, muting further reports until it recovers");
        }
        false
    }

    pub fn failure_count(&self) -> u32 {
        self.streak
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    #[test]
    fn test_backoff_doubles_up_to_the_cap() {
        let config = RetryConfig::new("ping").with_base_delay(Duration::from_millis(100));

        let waits: Vec<u128> = (1..=4).map(|n| config.backoff(n).as_millis()).collect();
        assert_eq!(waits, vec![100, 200, 400, 800]);
        assert_eq!(config.backoff(40), Duration::from_secs(5));
    }

    #[test]
    fn test_tracker_mutes_after_limit_until_success() {
        let mut tracker = FailureTracker::new(2);

        let logged: Vec<bool> = (0..4).map(|_| tracker.record_failure()).collect();
        assert_eq!(logged, vec![true, true, false, false]);
        assert_eq!(tracker.failure_count(), 4);

        tracker.record_success();
        assert_eq!(tracker.failure_count(), 0);
        assert!(tracker.record_failure());
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_errors() {
        let config = RetryConfig::new("ping").with_base_delay(Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let outcome = retry_async(&config, || {
            let n = calls.fetch_add(1, AtomicOrdering::SeqCst);
            async move {
                if n < 2 {
                    Err("connection refused")
                } else {
                    Ok("PONG")
                }
            }
        })
        .await;

        assert_eq!(outcome, Ok("PONG"));
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_reports_attempts_when_exhausted() {
        let config = RetryConfig::new("ping")
            .with_base_delay(Duration::from_millis(1))
            .with_max_retries(2);

        let result: Result<(), _> = retry_async(&config, || async { Err("down") }).await;
        assert_eq!(result, Err(("down", 3)));
    }
}
