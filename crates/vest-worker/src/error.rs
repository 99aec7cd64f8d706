//! Worker error types.
//!
//! The variant decides whether a failed job is retried: see
//! [`WorkerError::is_retryable`].

use thiserror::Error;
use vest_queue::QueueError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    // ---- permanent ----
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Business rule violated: {0}")]
    BusinessRule(String),

    #[error("Rejected by upstream: {0}")]
    Rejected(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // ---- retryable ----
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Delivery deferred: {0}")]
    Deferred(String),

    #[error("Upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Processor panicked: {0}")]
    Panicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl WorkerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn business_rule(msg: impl Into<String>) -> Self {
        Self::BusinessRule(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Classify an HTTP-style status returned by a downstream service.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => Self::RateLimited(message),
            _ => Self::Upstream { status, message },
        }
    }

    /// Check if error is retryable.
    ///
    /// Only the variant is inspected, never the message text.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Timeout(_)
            | WorkerError::Connection(_)
            | WorkerError::RateLimited(_)
            | WorkerError::Deferred(_)
            | WorkerError::ResourceExhausted(_)
            | WorkerError::Panicked(_)
            | WorkerError::Io(_) => true,
            WorkerError::Upstream { status, .. } => *status == 429 || *status >= 500,
            // A closing queue during shutdown is retried by the next process
            WorkerError::Queue(err) => matches!(
                err,
                QueueError::QueueUnavailable(_) | QueueError::Redis(_) | QueueError::QueueClosed(_)
            ),
            WorkerError::Validation(_)
            | WorkerError::MalformedPayload(_)
            | WorkerError::InvalidAddress(_)
            | WorkerError::Template(_)
            | WorkerError::NotFound(_)
            | WorkerError::BusinessRule(_)
            | WorkerError::Rejected(_)
            | WorkerError::Config(_) => false,
        }
    }

    /// Short machine-readable class for logs.
    pub fn kind(&self) -> &'static str {
        if self.is_retryable() {
            "retryable"
        } else {
            "permanent"
        }
    }
}

impl From<validator::ValidationErrors> for WorkerError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Validation(errors.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for WorkerError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::Timeout(err.to_string())
    }
}
