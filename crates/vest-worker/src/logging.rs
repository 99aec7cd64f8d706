//! Structured job logging utilities.
//!
//! Provides consistent, structured logging for job processing with
//! tracing spans and contextual information.

use tracing::{error, info, warn, Span};
use vest_models::{JobId, QueueName};

/// Job logger for structured logging with consistent formatting.
///
/// Every event carries the job id, queue and attempt number.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    queue: QueueName,
    attempt: u32,
}

impl JobLogger {
    /// Create a new job logger for one execution of a job.
    pub fn new(job_id: &JobId, queue: QueueName, attempt: u32) -> Self {
        Self {
            job_id: job_id.to_string(),
            queue,
            attempt,
        }
    }

    /// Log the start of a job execution.
    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            queue = %self.queue,
            attempt = self.attempt,
            "Job started: {}", message
        );
    }

    /// Log a progress update during job execution.
    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            queue = %self.queue,
            attempt = self.attempt,
            "Job progress: {}", message
        );
    }

    /// Log a warning during job execution.
    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            queue = %self.queue,
            attempt = self.attempt,
            "Job warning: {}", message
        );
    }

    /// Log an error during job execution.
    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            queue = %self.queue,
            attempt = self.attempt,
            "Job error: {}", message
        );
    }

    /// Log the completion of a job execution.
    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            queue = %self.queue,
            attempt = self.attempt,
            "Job completed: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn queue(&self) -> QueueName {
        self.queue
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Create a tracing span for this job execution.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            queue = %self.queue,
            attempt = self.attempt
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_logger_creation() {
        let job_id = JobId::new();
        let logger = JobLogger::new(&job_id, QueueName::ReportGeneration, 2);

        assert_eq!(logger.job_id(), job_id.to_string());
        assert_eq!(logger.queue(), QueueName::ReportGeneration);
        assert_eq!(logger.attempt(), 2);
    }
}
