//! Queue statistics and dead-letter records.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Job, JobId, QueueName};

/// Point-in-time job counts for one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queue_name: QueueName,
    pub waiting_count: u64,
    pub active_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
    pub delayed_count: u64,
    /// Waiting jobs held back because the queue is paused
    pub paused_count: u64,
    pub is_paused: bool,
}

impl QueueStats {
    /// Build stats from raw per-state counts. When paused, waiting jobs are
    /// reported as paused.
    pub fn from_counts(
        queue_name: QueueName,
        waiting: u64,
        active: u64,
        completed: u64,
        failed: u64,
        delayed: u64,
        is_paused: bool,
    ) -> Self {
        let (waiting_count, paused_count) = if is_paused { (0, waiting) } else { (waiting, 0) };
        Self {
            queue_name,
            waiting_count,
            active_count: active,
            completed_count: completed,
            failed_count: failed,
            delayed_count: delayed,
            paused_count,
            is_paused,
        }
    }

    /// Total number of jobs tracked by the queue.
    pub fn total(&self) -> u64 {
        self.waiting_count
            + self.active_count
            + self.completed_count
            + self.failed_count
            + self.delayed_count
            + self.paused_count
    }
}

/// A permanently failed job captured for operator inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub job_id: JobId,
    pub queue_name: QueueName,
    pub payload: serde_json::Value,
    pub failed_reason: String,
    pub attempts_made: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Capture a failed job.
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            queue_name: job.queue_name,
            payload: job.payload.clone(),
            failed_reason: job.failed_reason.clone().unwrap_or_default(),
            attempts_made: job.attempts_made,
            failed_at: job.finished_at.unwrap_or_else(Utc::now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paused_queue_reports_waiting_as_paused() {
        let stats = QueueStats::from_counts(QueueName::Email, 7, 1, 2, 3, 4, true);
        assert_eq!(stats.waiting_count, 0);
        assert_eq!(stats.paused_count, 7);
        assert_eq!(stats.total(), 17);
    }

    #[test]
    fn test_stats_wire_format() {
        let stats = QueueStats::from_counts(QueueName::Email, 1, 0, 0, 0, 0, false);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["waitingCount"], 1);
        assert_eq!(json["queueName"], "email");
    }
}
