//! Job processors, one per queue.

pub mod email;
pub mod notification;
pub mod report;
pub mod roi;

pub use email::EmailProcessor;
pub use notification::NotificationProcessor;
pub use report::ReportProcessor;
pub use roi::RoiDistributionProcessor;

use vest_models::{JobOptionsOverride, QueueName};
use vest_queue::{QueueError, QueueRegistry};

use crate::error::WorkerResult;

/// Enqueue a follow-up job at most once per `dedup_key`.
///
/// Returns `false` when a job with the same key is already retained.
pub(crate) async fn enqueue_once(
    registry: &QueueRegistry,
    queue: QueueName,
    payload: serde_json::Value,
    dedup_key: String,
) -> WorkerResult<bool> {
    let options = JobOptionsOverride {
        dedup_key: Some(dedup_key),
        ..Default::default()
    };
    match registry.enqueue(queue.as_str(), payload, Some(options)).await {
        Ok(_) => Ok(true),
        Err(QueueError::DuplicateJob(_)) => Ok(false),
        Err(e) => Err(e.into()),
    }
}
