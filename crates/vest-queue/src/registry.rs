//! Registry of every declared queue.
//!
//! The registry is constructed explicitly and shared (`Arc<QueueRegistry>`)
//! with producers, worker pools and the operator API. It hands out exactly
//! one [`Queue`] per name for its lifetime and closes them all on shutdown.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use tokio::sync::OnceCell;
use tracing::{info, warn};
use vest_models::{JobId, JobOptionsOverride, QueueName, QueueStats};

use crate::config::{QueueConfig, StoreBackend};
use crate::error::{QueueError, QueueResult};
use crate::queue::Queue;
use crate::store::{JobStore, MemoryStore, RedisStore};

/// Central lookup of queues and aggregate statistics.
pub struct QueueRegistry {
    config: QueueConfig,
    store: Arc<dyn JobStore>,
    queues: RwLock<HashMap<QueueName, Arc<Queue>>>,
    shutdown: OnceCell<()>,
}

impl QueueRegistry {
    /// Create a registry over an existing store.
    pub fn new(config: QueueConfig, store: Arc<dyn JobStore>) -> Self {
        Self {
            config,
            store,
            queues: RwLock::new(HashMap::new()),
            shutdown: OnceCell::new(),
        }
    }

    /// Create a registry with the store selected by the configuration.
    pub fn from_config(config: QueueConfig) -> QueueResult<Self> {
        let store: Arc<dyn JobStore> = match config.store {
            StoreBackend::Redis => Arc::new(RedisStore::new(&config)?),
            StoreBackend::Memory => Arc::new(MemoryStore::new(config.dlq_max_len)),
        };
        Ok(Self::new(config, store))
    }

    /// Registry over a fresh in-memory store.
    pub fn in_memory() -> Self {
        let config = QueueConfig::in_memory();
        let store = Arc::new(MemoryStore::new(config.dlq_max_len));
        Self::new(config, store)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    /// Look up a queue, creating it on first use.
    pub fn get_queue(&self, name: QueueName) -> Arc<Queue> {
        if let Some(queue) = self
            .queues
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&name)
        {
            return queue.clone();
        }

        let mut queues = self
            .queues
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        queues
            .entry(name)
            .or_insert_with(|| {
                Arc::new(Queue::new(
                    name,
                    self.store.clone(),
                    self.config.default_job_options.clone(),
                    self.config.close_timeout,
                ))
            })
            .clone()
    }

    /// Look up a queue by its wire name.
    pub fn get_queue_by_str(&self, name: &str) -> QueueResult<Arc<Queue>> {
        let name: QueueName = name.parse()?;
        Ok(self.get_queue(name))
    }

    /// Create every declared queue and check the store is reachable.
    pub async fn initialize_queues(&self) -> QueueResult<()> {
        for name in QueueName::ALL {
            self.get_queue(name);
        }
        self.store.ping().await?;
        info!(
            backend = self.store.backend(),
            queues = QueueName::ALL.len(),
            "Initialized queues"
        );
        Ok(())
    }

    /// Registered queues in declaration order.
    pub fn queues(&self) -> Vec<Arc<Queue>> {
        let queues = self
            .queues
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        QueueName::ALL
            .iter()
            .filter_map(|name| queues.get(name).cloned())
            .collect()
    }

    /// Producer entry point.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        payload: serde_json::Value,
        options: Option<JobOptionsOverride>,
    ) -> QueueResult<JobId> {
        if self.is_shut_down() {
            return Err(QueueError::QueueClosed(queue_name.to_string()));
        }
        self.get_queue_by_str(queue_name)?
            .enqueue(payload, options)
            .await
    }

    pub async fn get_queue_stats(&self, queue_name: &str) -> QueueResult<QueueStats> {
        self.get_queue_by_str(queue_name)?.get_stats().await
    }

    /// Stats of every registered queue.
    pub async fn get_all_queue_stats(&self) -> QueueResult<Vec<QueueStats>> {
        let mut all = Vec::new();
        for queue in self.queues() {
            all.push(queue.get_stats().await?);
        }
        Ok(all)
    }

    /// Remove every non-active job of a queue.
    pub async fn clear_queue(&self, queue_name: &str) -> QueueResult<u64> {
        self.get_queue_by_str(queue_name)?.clear().await
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.initialized()
    }

    /// Close every queue, waiting (bounded) for in-flight jobs.
    ///
    /// Concurrent and repeated calls share a single shutdown.
    pub async fn shutdown(&self) {
        self.shutdown
            .get_or_init(|| async {
                let queues = self.queues();
                info!(queues = queues.len(), "Shutting down queue registry");

                let results = join_all(queues.iter().map(|queue| queue.close())).await;
                let undrained = results.iter().filter(|drained| !**drained).count();
                if undrained > 0 {
                    warn!(undrained, "Some queues still had running jobs at shutdown");
                } else {
                    info!("All queues drained");
                }
            })
            .await;
    }
}
