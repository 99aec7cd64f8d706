//! Shared data models for the Vest job queue.
//!
//! This crate provides Serde-serializable types for:
//! - Job records, states and options
//! - The closed set of queue names
//! - Queue statistics and dead-letter entries
//! - Typed payloads for each job processor

pub mod job;
pub mod options;
pub mod payload;
pub mod queue_name;
pub mod stats;

// Re-export common types
pub use job::{schedule_after, Job, JobId, JobState, MAX_SCHEDULE_AHEAD_DAYS};
pub use options::{
    BackoffKind, BackoffStrategy, JobOptions, JobOptionsOverride, MAX_DELAY_MS, MAX_PRIORITY,
};
pub use payload::{
    CalculationMethod, EmailPayload, NotificationPayload, ReportFormat, ReportPayload, ReportType,
    RoiDistributionPayload,
};
pub use queue_name::{InvalidQueueName, QueueName};
pub use stats::{DeadLetterEntry, QueueStats};
