//! Worker runtime: one pool per served queue and a single shutdown path.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use vest_models::QueueName;
use vest_queue::QueueRegistry;

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::pool::{PoolConfig, WorkerPool};
use crate::processor::JobProcessor;

struct RunningPool {
    pool: Arc<WorkerPool>,
    handle: JoinHandle<()>,
}

/// Owns the worker pools of this process.
pub struct WorkerRuntime {
    config: WorkerConfig,
    registry: Arc<QueueRegistry>,
    processors: HashMap<QueueName, Arc<dyn JobProcessor>>,
    pools: Mutex<Vec<RunningPool>>,
    shutdown: OnceCell<()>,
}

impl WorkerRuntime {
    pub fn new(config: WorkerConfig, registry: Arc<QueueRegistry>) -> Self {
        Self {
            config,
            registry,
            processors: HashMap::new(),
            pools: Mutex::new(Vec::new()),
            shutdown: OnceCell::new(),
        }
    }

    /// Register the processor for its queue, replacing any earlier one.
    pub fn with_processor(mut self, processor: Arc<dyn JobProcessor>) -> Self {
        self.processors.insert(processor.queue(), processor);
        self
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    /// Start a pool for every configured queue that has a processor.
    ///
    /// Returns the number of pools started.
    pub async fn start(&self) -> WorkerResult<usize> {
        if self.shutdown.initialized() {
            return Err(WorkerError::Config("runtime already shut down".to_string()));
        }

        let mut pools = self.pools.lock().await;
        if !pools.is_empty() {
            return Ok(pools.len());
        }

        let pool_config = PoolConfig::from(&self.config);
        for queue_name in &self.config.queues {
            let Some(processor) = self.processors.get(queue_name) else {
                warn!(queue = %queue_name, "No processor registered, queue not served");
                continue;
            };

            let pool = Arc::new(WorkerPool::new(
                pool_config.clone(),
                self.registry.get_queue(*queue_name),
                Arc::clone(processor),
            ));
            let handle = tokio::spawn(Arc::clone(&pool).run());
            pools.push(RunningPool { pool, handle });
        }

        if pools.is_empty() {
            return Err(WorkerError::Config(
                "no configured queue has a registered processor".to_string(),
            ));
        }

        info!(
            pools = pools.len(),
            concurrency = pool_config.concurrency,
            "Worker runtime started"
        );
        Ok(pools.len())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.initialized()
    }

    /// Stop claiming on every pool, drain running jobs, then close the
    /// queues. Concurrent and repeated calls share a single shutdown.
    pub async fn shutdown(&self) {
        self.shutdown
            .get_or_init(|| async {
                let pools: Vec<RunningPool> = self.pools.lock().await.drain(..).collect();
                info!(pools = pools.len(), "Shutting down worker runtime");

                for running in &pools {
                    running.pool.signal_shutdown();
                }
                for running in pools {
                    if let Err(e) = running.handle.await {
                        warn!(
                            worker_id = running.pool.worker_id(),
                            "Worker pool task ended abnormally: {}", e
                        );
                    }
                }

                self.registry.shutdown().await;
                info!("Worker runtime stopped");
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerResult;
    use crate::processor::JobContext;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl JobProcessor for Echo {
        fn queue(&self) -> QueueName {
            QueueName::Notification
        }

        async fn process(&self, ctx: &JobContext) -> WorkerResult<serde_json::Value> {
            Ok(ctx.payload.clone())
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            concurrency: 2,
            poll_interval: Duration::from_millis(10),
            promote_interval: Duration::from_millis(10),
            shutdown_timeout: Duration::from_secs(2),
            queues: vec![QueueName::Notification, QueueName::Email],
            ..WorkerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_skips_queues_without_processor() {
        let runtime = WorkerRuntime::new(config(), Arc::new(QueueRegistry::in_memory()))
            .with_processor(Arc::new(Echo));

        assert_eq!(runtime.start().await.unwrap(), 1);
        // A second start is a no-op
        assert_eq!(runtime.start().await.unwrap(), 1);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_without_processors_fails() {
        let runtime = WorkerRuntime::new(config(), Arc::new(QueueRegistry::in_memory()));
        assert!(matches!(runtime.start().await, Err(WorkerError::Config(_))));
    }

    #[tokio::test]
    async fn test_concurrent_shutdown_runs_once() {
        let registry = Arc::new(QueueRegistry::in_memory());
        let runtime = Arc::new(
            WorkerRuntime::new(config(), registry.clone()).with_processor(Arc::new(Echo)),
        );
        runtime.start().await.unwrap();
        registry
            .enqueue("notification", json!({"userId": "u1"}), None)
            .await
            .unwrap();

        let calls: Vec<_> = (0..4)
            .map(|_| {
                let runtime = runtime.clone();
                tokio::spawn(async move { runtime.shutdown().await })
            })
            .collect();
        for call in calls {
            call.await.unwrap();
        }

        assert!(runtime.is_shut_down());
        assert!(registry.is_shut_down());
        assert!(runtime.start().await.is_err());
    }
}
