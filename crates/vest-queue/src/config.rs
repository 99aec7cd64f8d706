//! Queue configuration.

use std::str::FromStr;
use std::time::Duration;

use vest_models::{BackoffKind, BackoffStrategy, JobOptions};

/// Backing store for job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    /// Redis, shared by every worker process
    #[default]
    Redis,
    /// Process-local memory
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown queue store: {}", other)),
        }
    }
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Prefix of every Redis key (`{prefix}:{queue}:...`)
    pub key_prefix: String,
    /// Store backend
    pub store: StoreBackend,
    /// Options applied to every job unless overridden at enqueue time
    pub default_job_options: JobOptions,
    /// Maximum dead-letter entries kept per queue
    pub dlq_max_len: usize,
    /// How long `close` waits for in-flight jobs
    pub close_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "vest".to_string(),
            store: StoreBackend::Redis,
            default_job_options: JobOptions::default(),
            dlq_max_len: 10_000,
            close_timeout: Duration::from_secs(30),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let default_options = defaults.default_job_options.clone();

        let backoff_kind = match std::env::var("QUEUE_BACKOFF_TYPE")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "fixed" => BackoffKind::Fixed,
            _ => BackoffKind::Exponential,
        };

        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: std::env::var("QUEUE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            store: env_parse("QUEUE_STORE").unwrap_or_default(),
            default_job_options: JobOptions {
                attempts_allowed: env_parse::<u32>("QUEUE_ATTEMPTS")
                    .filter(|n| *n >= 1)
                    .unwrap_or(default_options.attempts_allowed),
                backoff: BackoffStrategy {
                    kind: backoff_kind,
                    base_delay_ms: env_parse("QUEUE_BACKOFF_DELAY_MS")
                        .unwrap_or(default_options.backoff.base_delay_ms),
                },
                remove_on_complete: env_parse("QUEUE_REMOVE_ON_COMPLETE")
                    .unwrap_or(default_options.remove_on_complete),
                remove_on_fail: env_parse("QUEUE_REMOVE_ON_FAIL")
                    .unwrap_or(default_options.remove_on_fail),
                ..default_options
            },
            dlq_max_len: env_parse("QUEUE_DLQ_MAX_LEN").unwrap_or(defaults.dlq_max_len),
            close_timeout: Duration::from_secs(
                env_parse("QUEUE_CLOSE_TIMEOUT_SECS").unwrap_or(30),
            ),
        }
    }

    /// In-memory configuration, used by tests and single-process setups.
    pub fn in_memory() -> Self {
        Self {
            store: StoreBackend::Memory,
            ..Self::default()
        }
    }
}
