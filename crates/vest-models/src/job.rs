//! Job records and their lifecycle.

use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{JobOptions, QueueName};

/// Furthest point in the future a job or lock may be scheduled.
pub const MAX_SCHEDULE_AHEAD_DAYS: i64 = 36_500;

/// `now + delay`, clamped to [`MAX_SCHEDULE_AHEAD_DAYS`].
pub fn schedule_after(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    let horizon = Duration::days(MAX_SCHEDULE_AHEAD_DAYS);
    let delay = Duration::from_std(delay).map_or(horizon, |d| d.min(horizon));
    now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Job state in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Eligible for dispatch
    #[default]
    Waiting,
    /// Scheduled for a future time (initial delay or retry backoff)
    Delayed,
    /// Claimed by exactly one worker
    Active,
    /// Processor returned successfully
    Completed,
    /// Attempts exhausted or permanent error
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of enqueued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Queue the job belongs to
    pub queue_name: QueueName,

    /// Processor-specific payload, opaque to the queue
    pub payload: serde_json::Value,

    /// Resolved job options
    pub options: JobOptions,

    /// Current state
    #[serde(default)]
    pub state: JobState,

    /// Number of finished processor executions
    #[serde(default)]
    pub attempts_made: u32,

    /// Number of times the job was recovered from a dead worker
    #[serde(default)]
    pub stalled_count: u32,

    /// Last error message (set only once failed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,

    /// Value returned by the processor on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,

    /// Enqueue sequence number within the queue (FIFO tie-breaker)
    #[serde(default)]
    pub seq: u64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Earliest time the job may be dispatched
    pub run_at: DateTime<Utc>,

    /// When the current or last attempt was claimed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,

    /// When the job reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new job. The store assigns `seq` on admission.
    pub fn new(queue_name: QueueName, payload: serde_json::Value, options: JobOptions) -> Self {
        let now = Utc::now();
        let state = if options.delay_ms > 0 {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        let run_at = schedule_after(now, std::time::Duration::from_millis(options.delay_ms));

        Self {
            id: JobId::new(),
            queue_name,
            payload,
            options,
            state,
            attempts_made: 0,
            stalled_count: 0,
            failed_reason: None,
            return_value: None,
            seq: 0,
            created_at: now,
            run_at,
            processed_at: None,
            finished_at: None,
        }
    }

    /// Ordering key among eligible jobs: priority first, then enqueue order.
    ///
    /// Fits in the 53-bit mantissa of a Redis sorted-set score because
    /// priority is below 2^21 and the sequence is folded into 32 bits.
    /// FIFO order within one priority therefore only holds across 2^32
    /// consecutive enqueues on a queue: after the sequence wraps, newer jobs
    /// sort ahead of older ones still waiting at the same priority.
    pub fn dispatch_score(&self) -> u64 {
        ((self.options.priority as u64) << 32) | (self.seq & 0xFFFF_FFFF)
    }

    /// Attempt number the next execution will carry (1-based).
    pub fn next_attempt(&self) -> u32 {
        self.attempts_made + 1
    }

    /// Whether another attempt is allowed after the current failure was recorded.
    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.options.attempts_allowed
    }

    /// Mark as claimed by a worker.
    pub fn mark_active(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Active;
        self.processed_at = Some(now);
    }

    /// Mark as completed after a successful execution.
    pub fn mark_completed(&mut self, return_value: serde_json::Value, now: DateTime<Utc>) {
        self.attempts_made += 1;
        self.state = JobState::Completed;
        self.return_value = Some(return_value);
        self.finished_at = Some(now);
    }

    /// Record a failed execution that will be retried at `run_at`.
    pub fn mark_retrying(&mut self, run_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.attempts_made += 1;
        self.state = if run_at > now {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        self.run_at = run_at;
    }

    /// Record a failed execution that ends the job.
    pub fn mark_failed(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.attempts_made += 1;
        self.state = JobState::Failed;
        self.failed_reason = Some(reason.into());
        self.finished_at = Some(now);
    }

    /// Return a job from a dead worker to the waiting set.
    ///
    /// The attempt counter is untouched: the execution never finished.
    pub fn mark_stalled(&mut self) {
        self.stalled_count += 1;
        self.state = JobState::Waiting;
        self.processed_at = None;
    }

    /// Fail a job that stalled too many times. No execution is counted.
    pub fn mark_stalled_out(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.stalled_count += 1;
        self.state = JobState::Failed;
        self.failed_reason = Some(reason.into());
        self.finished_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_creation() {
        let job = Job::new(QueueName::Email, json!({"to": "a@b.co"}), JobOptions::default());

        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.next_attempt(), 1);
        assert_eq!(job.run_at, job.created_at);
    }

    #[test]
    fn test_delayed_job_creation() {
        let options = JobOptions::default().with_delay_ms(60_000);
        let job = Job::new(QueueName::Email, json!({}), options);

        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.run_at - job.created_at, Duration::milliseconds(60_000));
    }

    #[test]
    fn test_job_state_transitions() {
        let now = Utc::now();
        let mut job = Job::new(QueueName::Email, json!({}), JobOptions::default());

        job.mark_active(now);
        assert_eq!(job.state, JobState::Active);
        assert!(job.processed_at.is_some());

        job.mark_completed(json!({"sent": true}), now);
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts_made, 1);
        assert!(job.failed_reason.is_none());
    }

    #[test]
    fn test_retry_budget() {
        let now = Utc::now();
        let mut job = Job::new(
            QueueName::Email,
            json!({}),
            JobOptions::default().with_attempts(2),
        );

        job.mark_retrying(now + Duration::seconds(5), now);
        assert_eq!(job.state, JobState::Delayed);
        assert!(job.can_retry());

        job.mark_failed("boom", now);
        assert_eq!(job.attempts_made, 2);
        assert!(!job.can_retry());
        assert_eq!(job.failed_reason.as_deref(), Some("boom"));
    }

    #[test]
    fn test_stall_keeps_attempt_count() {
        let now = Utc::now();
        let mut job = Job::new(QueueName::Email, json!({}), JobOptions::default());
        job.mark_active(now);
        job.mark_stalled();

        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.stalled_count, 1);
    }

    #[test]
    fn test_dispatch_score_orders_priority_before_sequence() {
        let mut urgent = Job::new(QueueName::Email, json!({}), JobOptions::default().with_priority(1));
        urgent.seq = 500;
        let mut normal = Job::new(QueueName::Email, json!({}), JobOptions::default().with_priority(5));
        normal.seq = 1;
        let mut later = Job::new(QueueName::Email, json!({}), JobOptions::default().with_priority(5));
        later.seq = 2;

        assert!(urgent.dispatch_score() < normal.dispatch_score());
        assert!(normal.dispatch_score() < later.dispatch_score());
        // Largest score must survive an f64 round-trip (Redis sorted-set score)
        let mut max = Job::new(
            QueueName::Email,
            json!({}),
            JobOptions::default().with_priority(crate::MAX_PRIORITY),
        );
        max.seq = u32::MAX as u64;
        assert_eq!(max.dispatch_score() as f64 as u64, max.dispatch_score());
    }

    #[test]
    fn test_dispatch_score_sequence_wraps_within_priority() {
        let mut first = Job::new(QueueName::Email, json!({}), JobOptions::default().with_priority(3));
        first.seq = 7;
        let mut wrapped = first.clone();
        wrapped.seq = (1u64 << 32) + 7;

        assert_eq!(first.dispatch_score(), wrapped.dispatch_score());
        assert_eq!(first.dispatch_score() >> 32, 3);
    }

    #[test]
    fn test_schedule_after_clamps_to_horizon() {
        let now = Utc::now();
        let horizon = now + Duration::days(MAX_SCHEDULE_AHEAD_DAYS);

        assert_eq!(
            schedule_after(now, std::time::Duration::from_millis(1_500)),
            now + Duration::milliseconds(1_500)
        );
        assert_eq!(schedule_after(now, std::time::Duration::from_millis(u64::MAX)), horizon);
        assert_eq!(schedule_after(now, std::time::Duration::MAX), horizon);
        assert_eq!(
            schedule_after(DateTime::<Utc>::MAX_UTC, std::time::Duration::from_secs(1)),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[test]
    fn test_huge_delay_does_not_overflow_run_at() {
        let options = JobOptions::default().with_delay_ms(u64::MAX);
        let job = Job::new(QueueName::Email, json!({}), options);

        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.run_at - job.created_at, Duration::days(MAX_SCHEDULE_AHEAD_DAYS));
    }
}
