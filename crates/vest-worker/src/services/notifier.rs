//! In-app notification delivery.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;
use vest_models::NotificationPayload;

use crate::error::WorkerResult;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver the notification, returning its id.
    async fn notify(&self, notification: &NotificationPayload) -> WorkerResult<String>;
}

/// Writes notifications to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &NotificationPayload) -> WorkerResult<String> {
        let id = Uuid::new_v4().to_string();
        info!(
            notification_id = %id,
            user_id = %notification.user_id,
            kind = %notification.kind,
            title = %notification.title,
            "Notification delivered"
        );
        Ok(id)
    }
}

/// Keeps delivered notifications in memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    delivered: Mutex<Vec<NotificationPayload>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<NotificationPayload> {
        self.delivered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, notification: &NotificationPayload) -> WorkerResult<String> {
        self.delivered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(notification.clone());
        Ok(Uuid::new_v4().to_string())
    }
}
