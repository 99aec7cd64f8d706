//! Per-job options: attempts, backoff, priority, delay and retention.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Highest accepted priority value. Lower values are dispatched first.
pub const MAX_PRIORITY: u32 = 2_097_151;

/// Longest accepted initial delay or backoff base: one year.
pub const MAX_DELAY_MS: u64 = 365 * 24 * 60 * 60 * 1000;

/// Backoff curve applied between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Constant delay between every retry
    Fixed,
    /// Delay doubles on each retry
    #[default]
    Exponential,
}

/// Backoff strategy: curve plus base delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackoffStrategy {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    pub base_delay_ms: u64,
}

impl BackoffStrategy {
    pub fn fixed(base_delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_delay_ms,
        }
    }

    pub fn exponential(base_delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay_ms,
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::exponential(5_000)
    }
}

/// Fully resolved options attached to every job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Maximum number of processor executions (>= 1)
    pub attempts_allowed: u32,
    /// Delay curve between retries
    pub backoff: BackoffStrategy,
    /// Dispatch priority, lower runs first (0..=MAX_PRIORITY)
    #[serde(default)]
    pub priority: u32,
    /// Initial delay before the job becomes eligible
    #[serde(default)]
    pub delay_ms: u64,
    /// Number of completed jobs retained before purging the oldest
    pub remove_on_complete: usize,
    /// Number of failed jobs retained before purging the oldest
    pub remove_on_fail: usize,
    /// Deduplication key; a second live job with the same key is rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts_allowed: 5,
            backoff: BackoffStrategy::default(),
            priority: 0,
            delay_ms: 0,
            remove_on_complete: 100,
            remove_on_fail: 200,
            dedup_key: None,
        }
    }
}

impl JobOptions {
    /// Check the options are admissible.
    pub fn validate(&self) -> Result<(), String> {
        if self.attempts_allowed == 0 {
            return Err("attemptsAllowed must be at least 1".to_string());
        }
        if self.priority > MAX_PRIORITY {
            return Err(format!("priority must be between 0 and {}", MAX_PRIORITY));
        }
        if self.delay_ms > MAX_DELAY_MS {
            return Err(format!("delayMs must be at most {}", MAX_DELAY_MS));
        }
        if self.backoff.base_delay_ms > MAX_DELAY_MS {
            return Err(format!("backoff.baseDelayMs must be at most {}", MAX_DELAY_MS));
        }
        if let Some(key) = &self.dedup_key {
            if key.trim().is_empty() {
                return Err("dedupKey must not be blank".to_string());
            }
        }
        Ok(())
    }

    /// Set the number of allowed attempts.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts_allowed = attempts;
        self
    }

    /// Set the backoff strategy.
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the dispatch priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the initial delay.
    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Set the deduplication key.
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}

/// Partial options supplied by a producer; unset fields fall back to the
/// queue defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobOptionsOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts_allowed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_complete: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_fail: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
}

impl JobOptionsOverride {
    /// Merge onto the given defaults.
    pub fn apply(&self, defaults: &JobOptions) -> JobOptions {
        JobOptions {
            attempts_allowed: self.attempts_allowed.unwrap_or(defaults.attempts_allowed),
            backoff: self.backoff.unwrap_or(defaults.backoff),
            priority: self.priority.unwrap_or(defaults.priority),
            delay_ms: self.delay_ms.unwrap_or(defaults.delay_ms),
            remove_on_complete: self.remove_on_complete.unwrap_or(defaults.remove_on_complete),
            remove_on_fail: self.remove_on_fail.unwrap_or(defaults.remove_on_fail),
            dedup_key: self.dedup_key.clone().or_else(|| defaults.dedup_key.clone()),
        }
    }
}

impl From<JobOptions> for JobOptionsOverride {
    fn from(options: JobOptions) -> Self {
        Self {
            attempts_allowed: Some(options.attempts_allowed),
            backoff: Some(options.backoff),
            priority: Some(options.priority),
            delay_ms: Some(options.delay_ms),
            remove_on_complete: Some(options.remove_on_complete),
            remove_on_fail: Some(options.remove_on_fail),
            dedup_key: options.dedup_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_process_configuration() {
        let options = JobOptions::default();
        assert_eq!(options.attempts_allowed, 5);
        assert_eq!(options.backoff, BackoffStrategy::exponential(5_000));
        assert_eq!(options.remove_on_complete, 100);
        assert_eq!(options.remove_on_fail, 200);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_attempts_and_large_priority() {
        assert!(JobOptions::default().with_attempts(0).validate().is_err());
        assert!(JobOptions::default()
            .with_priority(MAX_PRIORITY + 1)
            .validate()
            .is_err());
        assert!(JobOptions::default().with_priority(MAX_PRIORITY).validate().is_ok());
    }

    #[test]
    fn test_validate_bounds_delays() {
        assert!(JobOptions::default().with_delay_ms(MAX_DELAY_MS).validate().is_ok());
        let err = JobOptions::default()
            .with_delay_ms(u64::MAX)
            .validate()
            .unwrap_err();
        assert!(err.contains("delayMs"));
        assert!(JobOptions::default()
            .with_backoff(BackoffStrategy::fixed(MAX_DELAY_MS + 1))
            .validate()
            .is_err());
    }

    #[test]
    fn test_override_only_replaces_set_fields() {
        let defaults = JobOptions::default();
        let patch = JobOptionsOverride {
            attempts_allowed: Some(2),
            delay_ms: Some(1_500),
            ..Default::default()
        };

        let merged = patch.apply(&defaults);
        assert_eq!(merged.attempts_allowed, 2);
        assert_eq!(merged.delay_ms, 1_500);
        assert_eq!(merged.backoff, defaults.backoff);
        assert_eq!(merged.remove_on_fail, 200);
    }

    #[test]
    fn test_backoff_wire_format() {
        let json = serde_json::to_value(BackoffStrategy::fixed(250)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "fixed", "baseDelayMs": 250}));
    }
}
