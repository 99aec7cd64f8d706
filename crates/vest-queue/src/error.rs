//! Queue error types.

use thiserror::Error;
use vest_models::{InvalidQueueName, JobId};

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Invalid queue name: {0}")]
    InvalidQueueName(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid job options: {0}")]
    InvalidOptions(String),

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Queue closed: {0}")]
    QueueClosed(String),

    #[error("Duplicate job: {0}")]
    DuplicateJob(JobId),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Lock lost for job {0}")]
    LockLost(JobId),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Redis error: {0}")]
    Redis(#[source] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::QueueUnavailable(msg.into())
    }

    /// True when the backing store could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, QueueError::QueueUnavailable(_))
    }
}

impl From<InvalidQueueName> for QueueError {
    fn from(err: InvalidQueueName) -> Self {
        Self::InvalidQueueName(err.0)
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        // Connectivity problems mean the store cannot accept writes
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
            || err.is_cluster_error()
        {
            Self::QueueUnavailable(err.to_string())
        } else {
            Self::Redis(err)
        }
    }
}
