//! In-app notifications.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use validator::Validate;
use vest_models::{NotificationPayload, QueueName};

use crate::error::WorkerResult;
use crate::processor::{JobContext, JobProcessor};
use crate::services::notifier::Notifier;

pub struct NotificationProcessor {
    notifier: Arc<dyn Notifier>,
}

impl NotificationProcessor {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl JobProcessor for NotificationProcessor {
    fn queue(&self) -> QueueName {
        QueueName::Notification
    }

    async fn process(&self, ctx: &JobContext) -> WorkerResult<serde_json::Value> {
        let payload: NotificationPayload = ctx.payload_as()?;
        payload.validate()?;

        let id = self.notifier.notify(&payload).await?;
        Ok(json!({ "notificationId": id, "userId": payload.user_id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::notifier::MemoryNotifier;
    use vest_models::{Job, JobOptions};

    #[tokio::test]
    async fn test_delivers_valid_notification() {
        let notifier = Arc::new(MemoryNotifier::new());
        let processor = NotificationProcessor::new(notifier.clone());
        let job = Job::new(
            QueueName::Notification,
            json!({"userId": "u1", "title": "Report ready", "message": "Your report is ready"}),
            JobOptions::default(),
        );

        processor.process(&JobContext::new(&job)).await.unwrap();
        let delivered = notifier.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].kind, "info");
    }

    #[tokio::test]
    async fn test_blank_title_is_permanent() {
        let processor = NotificationProcessor::new(Arc::new(MemoryNotifier::new()));
        let job = Job::new(
            QueueName::Notification,
            json!({"userId": "u1", "title": "", "message": "m"}),
            JobOptions::default(),
        );

        let err = processor.process(&JobContext::new(&job)).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
