//! Queue metrics collection.
//!
//! Counters are labelled by queue name. Exporting is left to the binaries,
//! which install a Prometheus recorder.

use metrics::{counter, gauge, histogram};
use vest_models::{QueueName, QueueStats};

// =============================================================================
// Metric Names
// =============================================================================

/// Metric name constants for consistency.
pub mod names {
    pub const JOBS_ENQUEUED_TOTAL: &str = "vest_jobs_enqueued_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "vest_jobs_completed_total";
    pub const JOBS_RETRIED_TOTAL: &str = "vest_jobs_retried_total";
    pub const JOBS_FAILED_TOTAL: &str = "vest_jobs_failed_total";
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "vest_jobs_dead_lettered_total";
    pub const JOBS_STALLED_TOTAL: &str = "vest_jobs_stalled_total";

    /// Processor execution time in seconds.
    pub const JOB_DURATION_SECONDS: &str = "vest_job_duration_seconds";

    /// Jobs per queue and state, refreshed on every stats call.
    pub const QUEUE_JOBS: &str = "vest_queue_jobs";
}

// =============================================================================
// Recording Functions
// =============================================================================

pub fn record_enqueued(queue: QueueName) {
    counter!(names::JOBS_ENQUEUED_TOTAL, "queue" => queue.as_str()).increment(1);
}

pub fn record_completed(queue: QueueName) {
    counter!(names::JOBS_COMPLETED_TOTAL, "queue" => queue.as_str()).increment(1);
}

pub fn record_retried(queue: QueueName) {
    counter!(names::JOBS_RETRIED_TOTAL, "queue" => queue.as_str()).increment(1);
}

/// Record a job reaching the failed state. Every failed job is also
/// dead-lettered.
pub fn record_failed(queue: QueueName) {
    counter!(names::JOBS_FAILED_TOTAL, "queue" => queue.as_str()).increment(1);
    counter!(names::JOBS_DEAD_LETTERED_TOTAL, "queue" => queue.as_str()).increment(1);
}

/// Record stalled jobs found by a recovery sweep.
pub fn record_stalled(queue: QueueName, count: u64) {
    if count > 0 {
        counter!(names::JOBS_STALLED_TOTAL, "queue" => queue.as_str()).increment(count);
    }
}

/// Record how long one processor execution took.
pub fn record_duration(queue: QueueName, outcome: &'static str, duration_secs: f64) {
    histogram!(
        names::JOB_DURATION_SECONDS,
        "queue" => queue.as_str(),
        "outcome" => outcome
    )
    .record(duration_secs);
}

/// Publish a stats snapshot as gauges.
pub fn set_queue_gauges(stats: &QueueStats) {
    let queue = stats.queue_name.as_str();
    for (state, value) in [
        ("waiting", stats.waiting_count),
        ("active", stats.active_count),
        ("completed", stats.completed_count),
        ("failed", stats.failed_count),
        ("delayed", stats.delayed_count),
        ("paused", stats.paused_count),
    ] {
        gauge!(names::QUEUE_JOBS, "queue" => queue, "state" => state).set(value as f64);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        assert!(names::JOBS_ENQUEUED_TOTAL.starts_with("vest_"));
        assert!(names::JOBS_DEAD_LETTERED_TOTAL.ends_with("_total"));
        assert!(names::JOB_DURATION_SECONDS.contains("seconds"));
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_enqueued(QueueName::Email);
        record_stalled(QueueName::Email, 0);
        set_queue_gauges(&QueueStats::from_counts(QueueName::Email, 1, 0, 0, 0, 0, false));
    }
}
