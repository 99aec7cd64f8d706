//! Job processor abstraction.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use vest_models::{Job, JobId, QueueName};

use crate::error::WorkerResult;
use crate::logging::JobLogger;

/// Everything a processor sees of the job it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub queue: QueueName,
    /// 1-based number of this execution
    pub attempt: u32,
    pub attempts_allowed: u32,
    pub payload: serde_json::Value,
    pub logger: JobLogger,
}

impl JobContext {
    pub fn new(job: &Job) -> Self {
        let attempt = job.next_attempt();
        Self {
            job_id: job.id.clone(),
            queue: job.queue_name,
            attempt,
            attempts_allowed: job.options.attempts_allowed,
            payload: job.payload.clone(),
            logger: JobLogger::new(&job.id, job.queue_name, attempt),
        }
    }

    /// Executions that finished before this one.
    pub fn attempts_made(&self) -> u32 {
        self.attempt.saturating_sub(1)
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.attempts_allowed
    }

    /// Deserialize the payload. A shape mismatch is a permanent failure.
    pub fn payload_as<T: DeserializeOwned>(&self) -> WorkerResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Business logic for one queue.
///
/// A processor classifies its own failures through the returned
/// [`WorkerError`](crate::error::WorkerError) variant; the pool decides
/// between retry and dead-letter from that classification alone.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Queue this processor consumes.
    fn queue(&self) -> QueueName;

    /// Run one attempt. The returned value is stored as the job result.
    async fn process(&self, ctx: &JobContext) -> WorkerResult<serde_json::Value>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vest_models::{JobOptions, NotificationPayload};

    #[test]
    fn test_context_attempt_numbering() {
        let mut job = Job::new(
            QueueName::Notification,
            json!({"userId": "u1", "title": "Hi", "message": "Hello"}),
            JobOptions::default().with_attempts(3),
        );
        job.attempts_made = 2;

        let ctx = JobContext::new(&job);
        assert_eq!(ctx.attempt, 3);
        assert_eq!(ctx.attempts_made(), 2);
        assert!(ctx.is_last_attempt());
        assert_eq!(ctx.logger.attempt(), 3);
    }

    #[test]
    fn test_payload_shape_mismatch_is_permanent() {
        let job = Job::new(QueueName::Notification, json!({"userId": 7}), JobOptions::default());
        let ctx = JobContext::new(&job);

        let err = ctx.payload_as::<NotificationPayload>().unwrap_err();
        assert!(!err.is_retryable());
    }
}
