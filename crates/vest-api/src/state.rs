//! Application state.

use std::sync::Arc;

use vest_queue::{QueueConfig, QueueRegistry, QueueResult};

use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub registry: Arc<QueueRegistry>,
}

impl AppState {
    /// Build state over an existing registry.
    pub fn new(config: ApiConfig, registry: Arc<QueueRegistry>) -> Self {
        Self { config, registry }
    }

    /// Connect to the queue store described by the environment.
    pub async fn from_env(config: ApiConfig) -> QueueResult<Self> {
        let registry = QueueRegistry::from_config(QueueConfig::from_env())?;
        registry.initialize_queues().await?;
        Ok(Self::new(config, Arc::new(registry)))
    }
}
