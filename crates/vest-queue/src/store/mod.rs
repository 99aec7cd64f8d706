//! Job state storage.
//!
//! A [`JobStore`] owns every state transition of a job. Implementations must
//! make each transition atomic with respect to other workers, in particular
//! [`JobStore::claim`]: two callers must never receive the same job.
//!
//! Transitions out of `active` carry the lock token handed out by `claim`.
//! A token that no longer owns the job (the lock expired and the job was
//! recovered as stalled) is rejected with [`QueueError::LockLost`].
//!
//! [`QueueError::LockLost`]: crate::QueueError::LockLost

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vest_models::{DeadLetterEntry, Job, JobId, QueueName};

use crate::error::QueueResult;

/// Reason recorded on jobs that exceeded the stall limit.
pub const STALLED_REASON: &str = "job stalled more than allowable limit";

/// Result of admitting a job.
#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    /// Stored; carries the job with its assigned sequence number
    Added(Job),
    /// Rejected because a retained job already holds the dedup key
    Duplicate(JobId),
}

/// Jobs handled by one stalled-job sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StalledReport {
    /// Returned to the waiting set
    pub requeued: Vec<JobId>,
    /// Exceeded the stall limit and were dead-lettered
    pub failed: Vec<DeadLetterEntry>,
}

impl StalledReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }

    pub fn total(&self) -> u64 {
        (self.requeued.len() + self.failed.len()) as u64
    }
}

/// Raw per-state job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: bool,
}

/// Durable job storage shared by producers and worker pools.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Check the store is reachable.
    async fn ping(&self) -> QueueResult<()>;

    /// Admit a job into `waiting` or `delayed`, assigning its sequence number.
    async fn add(&self, job: Job) -> QueueResult<AddOutcome>;

    /// Move delayed jobs whose run time has passed into `waiting`.
    async fn promote_delayed(&self, queue: QueueName, now: DateTime<Utc>) -> QueueResult<u64>;

    /// Atomically take the next waiting job and lock it for `token` until
    /// `lock_until`. Returns `None` when nothing is eligible or the queue is
    /// paused.
    async fn claim(
        &self,
        queue: QueueName,
        token: &str,
        lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>>;

    /// Push the lock expiry of an active job forward.
    async fn extend_lock(
        &self,
        queue: QueueName,
        id: &JobId,
        token: &str,
        lock_until: DateTime<Utc>,
    ) -> QueueResult<()>;

    /// Record a successful execution.
    async fn complete(
        &self,
        queue: QueueName,
        id: &JobId,
        token: &str,
        return_value: serde_json::Value,
        now: DateTime<Utc>,
    ) -> QueueResult<Job>;

    /// Record a failed execution and schedule the next attempt at `run_at`.
    async fn retry(
        &self,
        queue: QueueName,
        id: &JobId,
        token: &str,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<Job>;

    /// Record a failed execution that ends the job, and append it to the
    /// dead-letter sink.
    async fn fail(
        &self,
        queue: QueueName,
        id: &JobId,
        token: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<DeadLetterEntry>;

    /// Return active jobs with expired locks to `waiting`, or dead-letter
    /// them once they stalled more than `max_stalled_count` times.
    async fn recover_stalled(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
        max_stalled_count: u32,
    ) -> QueueResult<StalledReport>;

    async fn counts(&self, queue: QueueName) -> QueueResult<StateCounts>;

    /// Remove every waiting, delayed, completed and failed job. Active jobs
    /// and the dead-letter sink are kept. Returns the number removed.
    async fn clear(&self, queue: QueueName) -> QueueResult<u64>;

    async fn get_job(&self, queue: QueueName, id: &JobId) -> QueueResult<Option<Job>>;

    /// Most recent dead-letter entries, newest first.
    async fn dead_letters(&self, queue: QueueName, limit: usize)
        -> QueueResult<Vec<DeadLetterEntry>>;

    async fn set_paused(&self, queue: QueueName, paused: bool) -> QueueResult<()>;
}
