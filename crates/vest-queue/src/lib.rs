//! Durable job queue engine.
//!
//! This crate provides:
//! - Job admission with priority, delay and deduplication
//! - Atomic claims, lock renewal and stalled-job recovery
//! - Retry scheduling through a backoff policy
//! - A dead-letter sink for permanently failed jobs
//! - A registry of every declared queue with aggregate statistics
//!
//! Storage is pluggable through [`JobStore`]: [`RedisStore`] is the durable
//! backend shared by every worker process, [`MemoryStore`] serves single
//! process deployments and tests.

pub mod backoff;
pub mod config;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod store;

pub use backoff::{next_delay, BackoffPolicy};
pub use config::{QueueConfig, StoreBackend};
pub use error::{QueueError, QueueResult};
pub use queue::{Lease, Queue};
pub use registry::QueueRegistry;
pub use store::{AddOutcome, JobStore, MemoryStore, RedisStore, StalledReport, StateCounts};

pub use vest_models::{
    DeadLetterEntry, Job, JobId, JobOptions, JobOptionsOverride, JobState, QueueName, QueueStats,
};
