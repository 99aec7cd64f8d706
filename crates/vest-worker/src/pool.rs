//! Worker pool.
//!
//! One pool serves one queue. It claims jobs while it holds a free
//! concurrency permit, runs each job in its own task, renews the job lock
//! while the processor runs, and reports the outcome back to the queue.
//! A maintenance task promotes delayed jobs and recovers stalled ones.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use vest_queue::metrics as queue_metrics;
use vest_queue::{BackoffPolicy, Lease, Queue, QueueError};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::processor::{JobContext, JobProcessor};
use crate::retry::FailureTracker;

/// Tuning of a single pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub concurrency: usize,
    pub lock_duration: Duration,
    pub lock_renew_interval: Duration,
    pub stalled_interval: Duration,
    pub max_stalled_count: u32,
    pub poll_interval: Duration,
    pub promote_interval: Duration,
    pub shutdown_timeout: Duration,
    pub backoff_jitter: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for PoolConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            lock_duration: config.lock_duration,
            lock_renew_interval: config.lock_renew_interval,
            stalled_interval: config.stalled_interval,
            max_stalled_count: config.max_stalled_count,
            poll_interval: config.poll_interval,
            promote_interval: config.promote_interval,
            shutdown_timeout: config.shutdown_timeout,
            backoff_jitter: config.backoff_jitter,
        }
    }
}

/// Concurrency-bounded executor for one queue.
pub struct WorkerPool {
    config: PoolConfig,
    queue: Arc<Queue>,
    processor: Arc<dyn JobProcessor>,
    backoff: BackoffPolicy,
    job_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    worker_id: String,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, queue: Arc<Queue>, processor: Arc<dyn JobProcessor>) -> Self {
        let concurrency = config.concurrency.max(1);
        let (shutdown, _) = watch::channel(false);
        let worker_id = format!("{}-{}", queue.name(), Uuid::new_v4().simple());

        Self {
            backoff: BackoffPolicy::with_jitter(config.backoff_jitter),
            job_semaphore: Arc::new(Semaphore::new(concurrency)),
            config: PoolConfig {
                concurrency,
                ..config
            },
            queue,
            processor,
            shutdown,
            worker_id,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Jobs currently executing in this pool.
    pub fn running(&self) -> usize {
        self.config
            .concurrency
            .saturating_sub(self.job_semaphore.available_permits())
    }

    /// Ask the pool to stop claiming and drain.
    pub fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Run until [`signal_shutdown`](Self::signal_shutdown) is called, then
    /// wait (bounded) for running jobs.
    pub async fn run(self: Arc<Self>) {
        info!(
            worker_id = %self.worker_id,
            queue = %self.queue.name(),
            concurrency = self.config.concurrency,
            "Starting worker pool"
        );

        let maintenance = tokio::spawn(Arc::clone(&self).maintenance_loop());
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut claim_failures = FailureTracker::new(3);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            // A permit is held before claiming so the cap is never exceeded
            let permit = tokio::select! {
                _ = shutdown_rx.changed() => continue,
                permit = Arc::clone(&self.job_semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self
                .queue
                .claim(&self.worker_id, self.config.lock_duration)
                .await
            {
                Ok(Some(lease)) => {
                    claim_failures.record_success();
                    let pool = Arc::clone(&self);
                    tokio::spawn(async move {
                        let _permit = permit;
                        pool.execute(lease).await;
                    });
                }
                Ok(None) => {
                    claim_failures.record_success();
                    drop(permit);
                    Self::idle(&mut shutdown_rx, self.config.poll_interval).await;
                }
                Err(e) => {
                    drop(permit);
                    if claim_failures.record_failure() {
                        warn!(queue = %self.queue.name(), "Failed to claim job: {}", e);
                    }
                    Self::idle(&mut shutdown_rx, self.config.poll_interval).await;
                }
            }
        }

        maintenance.abort();

        info!(
            queue = %self.queue.name(),
            running = self.running(),
            "Worker pool stopping, waiting for running jobs"
        );
        let drained = tokio::time::timeout(
            self.config.shutdown_timeout,
            self.job_semaphore.acquire_many(self.config.concurrency as u32),
        )
        .await;

        match drained {
            Ok(Ok(_permits)) => info!(queue = %self.queue.name(), "Worker pool stopped"),
            _ => warn!(
                queue = %self.queue.name(),
                running = self.running(),
                "Worker pool stopped with jobs still running"
            ),
        }
    }

    async fn idle(shutdown_rx: &mut watch::Receiver<bool>, wait: Duration) {
        tokio::select! {
            _ = shutdown_rx.changed() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    /// Promote due delayed jobs and recover stalled ones.
    async fn maintenance_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut promote = tokio::time::interval(self.config.promote_interval);
        let mut stalled = tokio::time::interval(self.config.stalled_interval);
        promote.set_missed_tick_behavior(MissedTickBehavior::Delay);
        stalled.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = FailureTracker::new(3);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = promote.tick() => {
                    match self.queue.promote_delayed().await {
                        Ok(_) => failures.record_success(),
                        Err(e) => {
                            if failures.record_failure() {
                                warn!(queue = %self.queue.name(), "Failed to promote delayed jobs: {}", e);
                            }
                        }
                    }
                }
                _ = stalled.tick() => {
                    match self.queue.recover_stalled(self.config.max_stalled_count).await {
                        Ok(report) => {
                            failures.record_success();
                            if !report.is_empty() {
                                info!(
                                    queue = %self.queue.name(),
                                    requeued = report.requeued.len(),
                                    dead_lettered = report.failed.len(),
                                    "Recovered stalled jobs"
                                );
                            }
                        }
                        Err(e) => {
                            if failures.record_failure() {
                                warn!(queue = %self.queue.name(), "Failed to recover stalled jobs: {}", e);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Execute one claimed job and report its outcome.
    async fn execute(self: Arc<Self>, lease: Lease) {
        let ctx = JobContext::new(&lease.job);
        let logger = ctx.logger.clone();
        let span = logger.create_span();

        async move {
            logger.log_start(&format!("claimed by {}", self.worker_id));
            let started = Instant::now();

            let processor = Arc::clone(&self.processor);
            let mut task = tokio::spawn(async move { processor.process(&ctx).await });

            let renew_every = self.config.lock_renew_interval;
            let mut renew = interval_at(Instant::now() + renew_every, renew_every);
            renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut renew_failures = FailureTracker::new(2);

            let joined = loop {
                tokio::select! {
                    joined = &mut task => break joined,
                    _ = renew.tick() => {
                        match self.queue.extend_lock(&lease, self.config.lock_duration).await {
                            Ok(()) => renew_failures.record_success(),
                            Err(QueueError::LockLost(_)) => {
                                // Another worker owns the job now
                                logger.log_warning("lock lost, abandoning execution");
                                task.abort();
                                self.queue.abandon(lease);
                                return;
                            }
                            Err(e) => {
                                if renew_failures.record_failure() {
                                    logger.log_warning(&format!("failed to renew lock: {}", e));
                                }
                            }
                        }
                    }
                }
            };

            let outcome = match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    let message = panic_message(e.into_panic());
                    metrics::counter!(
                        "vest_worker_panics_total",
                        "queue" => self.queue.name().as_str()
                    )
                    .increment(1);
                    logger.log_error(&format!("processor panicked: {}", message));
                    Err(WorkerError::Panicked(message))
                }
                Err(e) => Err(WorkerError::Panicked(e.to_string())),
            };

            let elapsed = started.elapsed().as_secs_f64();
            self.report(lease, outcome, &logger, elapsed).await;
        }
        .instrument(span)
        .await
    }

    async fn report(
        &self,
        lease: Lease,
        outcome: WorkerResult<serde_json::Value>,
        logger: &JobLogger,
        elapsed: f64,
    ) {
        let queue_name = self.queue.name();

        let err = match outcome {
            Ok(value) => {
                match self.queue.complete(lease, value).await {
                    Ok(job) => {
                        queue_metrics::record_duration(queue_name, "completed", elapsed);
                        logger.log_completion(&format!(
                            "in {:.3}s after {} attempt(s)",
                            elapsed, job.attempts_made
                        ));
                    }
                    Err(e) => Self::log_report_error(logger, "complete", &e),
                }
                return;
            }
            Err(err) => err,
        };

        let attempts_made = lease.job.attempts_made + 1;
        let attempts_allowed = lease.job.options.attempts_allowed;

        if err.is_retryable() && attempts_made < attempts_allowed {
            let delay = self.backoff.delay_for(attempts_made, &lease.job.options.backoff);
            logger.log_warning(&format!(
                "attempt {}/{} failed ({}), retrying in {:?}: {}",
                attempts_made,
                attempts_allowed,
                err.kind(),
                delay,
                err
            ));
            match self.queue.retry(lease, delay).await {
                Ok(_) => queue_metrics::record_duration(queue_name, "retried", elapsed),
                Err(e) => Self::log_report_error(logger, "retry", &e),
            }
        } else {
            logger.log_error(&format!(
                "attempt {}/{} failed ({}), dead-lettering: {}",
                attempts_made,
                attempts_allowed,
                err.kind(),
                err
            ));
            match self.queue.fail(lease, &err.to_string()).await {
                Ok(entry) => {
                    queue_metrics::record_duration(queue_name, "failed", elapsed);
                    debug!(
                        job_id = %entry.job_id,
                        attempts_made = entry.attempts_made,
                        "Job moved to dead letters"
                    );
                }
                Err(e) => Self::log_report_error(logger, "fail", &e),
            }
        }
    }

    fn log_report_error(logger: &JobLogger, action: &str, err: &QueueError) {
        match err {
            QueueError::LockLost(_) => {
                logger.log_warning(&format!("could not {} job: lock was lost", action))
            }
            _ => error!(
                job_id = logger.job_id(),
                queue = %logger.queue(),
                "Failed to {} job: {}", action, err
            ),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vest_models::{BackoffStrategy, JobOptionsOverride, JobState, QueueName};
    use vest_queue::QueueRegistry;

    fn fast_config(concurrency: usize) -> PoolConfig {
        PoolConfig {
            concurrency,
            lock_duration: Duration::from_secs(5),
            lock_renew_interval: Duration::from_millis(50),
            stalled_interval: Duration::from_millis(50),
            max_stalled_count: 1,
            poll_interval: Duration::from_millis(10),
            promote_interval: Duration::from_millis(10),
            shutdown_timeout: Duration::from_secs(2),
            backoff_jitter: 0.0,
        }
    }

    struct Counting {
        calls: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl JobProcessor for Counting {
        fn queue(&self) -> QueueName {
            QueueName::DataExport
        }

        async fn process(&self, _ctx: &JobContext) -> WorkerResult<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(json!({"ok": true}))
        }
    }

    struct AlwaysTimeout;

    #[async_trait]
    impl JobProcessor for AlwaysTimeout {
        fn queue(&self) -> QueueName {
            QueueName::DataImport
        }

        async fn process(&self, _ctx: &JobContext) -> WorkerResult<serde_json::Value> {
            Err(WorkerError::timeout("upstream did not answer"))
        }
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_concurrency_is_a_hard_cap() {
        let registry = QueueRegistry::in_memory();
        let queue = registry.get_queue(QueueName::DataExport);
        for i in 0..12 {
            queue.enqueue(json!({"n": i}), None).await.unwrap();
        }

        let processor = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let pool = Arc::new(WorkerPool::new(fast_config(3), queue.clone(), processor.clone()));
        let handle = tokio::spawn(Arc::clone(&pool).run());

        wait_until(|| processor.calls.load(Ordering::SeqCst) == 12).await;
        pool.signal_shutdown();
        handle.await.unwrap();

        assert!(processor.peak.load(Ordering::SeqCst) <= 3);
        let stats = queue.get_stats().await.unwrap();
        assert_eq!(stats.completed_count, 12);
        assert_eq!(stats.active_count, 0);
    }

    #[tokio::test]
    async fn test_retryable_failures_exhaust_attempts() {
        let registry = QueueRegistry::in_memory();
        let queue = registry.get_queue(QueueName::DataImport);
        let options = JobOptionsOverride {
            attempts_allowed: Some(3),
            backoff: Some(BackoffStrategy::fixed(1)),
            ..Default::default()
        };
        let id = queue.enqueue(json!({"file": "a.csv"}), Some(options)).await.unwrap();

        let pool = Arc::new(WorkerPool::new(fast_config(1), queue.clone(), Arc::new(AlwaysTimeout)));
        let handle = tokio::spawn(Arc::clone(&pool).run());

        let q = queue.clone();
        let job = tokio::time::timeout(Duration::from_secs(5), async move {
            loop {
                if let Some(job) = q.get_job(&id).await.unwrap() {
                    if job.state == JobState::Failed {
                        return job;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(job.attempts_made, 3);
        assert!(job.failed_reason.unwrap().contains("upstream did not answer"));

        pool.signal_shutdown();
        handle.await.unwrap();
        assert_eq!(queue.dead_letters(10).await.unwrap().len(), 1);
    }

    #[test]
    fn test_pool_config_never_zero_concurrency() {
        let config = PoolConfig {
            concurrency: 0,
            ..PoolConfig::default()
        };
        let registry = QueueRegistry::in_memory();
        let pool = WorkerPool::new(
            config,
            registry.get_queue(QueueName::DataImport),
            Arc::new(AlwaysTimeout),
        );
        assert_eq!(pool.running(), 0);
        assert!(pool.worker_id().starts_with("data-import-"));
    }

    #[test]
    fn test_panic_message_extraction() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(42u8)), "unknown panic");
    }
}
