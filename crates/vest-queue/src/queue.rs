//! Named job queue.
//!
//! A [`Queue`] is the producer and worker facing handle of one queue name.
//! Producers call [`Queue::enqueue`]; worker pools claim [`Lease`]s and
//! report their outcome through [`Queue::complete`], [`Queue::retry`] or
//! [`Queue::fail`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use vest_models::{
    schedule_after, DeadLetterEntry, Job, JobId, JobOptions, JobOptionsOverride, QueueName,
    QueueStats,
};

use crate::error::{QueueError, QueueResult};
use crate::metrics;
use crate::store::{AddOutcome, JobStore, StalledReport};

/// A claimed job together with the lock token proving ownership.
#[derive(Debug, Clone)]
pub struct Lease {
    pub job: Job,
    pub token: String,
}

impl Lease {
    pub fn id(&self) -> &JobId {
        &self.job.id
    }

    /// Attempt number of the execution this lease is for (1-based).
    pub fn attempt(&self) -> u32 {
        self.job.next_attempt()
    }
}

/// One named queue backed by a [`JobStore`].
pub struct Queue {
    name: QueueName,
    store: Arc<dyn JobStore>,
    default_options: JobOptions,
    close_timeout: Duration,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("backend", &self.store.backend())
            .field("closed", &self.is_closed())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Queue {
    pub fn new(
        name: QueueName,
        store: Arc<dyn JobStore>,
        default_options: JobOptions,
        close_timeout: Duration,
    ) -> Self {
        Self {
            name,
            store,
            default_options,
            close_timeout,
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    pub fn name(&self) -> QueueName {
        self.name
    }

    pub fn default_options(&self) -> &JobOptions {
        &self.default_options
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Jobs claimed through this handle that have not reported an outcome.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Admit a job. Returns as soon as the job is durably stored.
    pub async fn enqueue(
        &self,
        payload: serde_json::Value,
        options: Option<JobOptionsOverride>,
    ) -> QueueResult<JobId> {
        if self.is_closed() {
            return Err(QueueError::QueueClosed(self.name.to_string()));
        }
        if payload.is_null() {
            return Err(QueueError::invalid_payload("payload must not be null"));
        }

        let options = match options {
            Some(patch) => patch.apply(&self.default_options),
            None => self.default_options.clone(),
        };
        options.validate().map_err(QueueError::InvalidOptions)?;

        let job = Job::new(self.name, payload, options);
        match self.store.add(job).await? {
            AddOutcome::Added(job) => {
                metrics::record_enqueued(self.name);
                debug!(
                    job_id = %job.id,
                    queue = %self.name,
                    priority = job.options.priority,
                    delay_ms = job.options.delay_ms,
                    "Enqueued job"
                );
                Ok(job.id)
            }
            AddOutcome::Duplicate(existing) => {
                debug!(job_id = %existing, queue = %self.name, "Rejected duplicate job");
                Err(QueueError::DuplicateJob(existing))
            }
        }
    }

    /// Point-in-time job counts.
    pub async fn get_stats(&self) -> QueueResult<QueueStats> {
        let counts = self.store.counts(self.name).await?;
        let stats = QueueStats::from_counts(
            self.name,
            counts.waiting,
            counts.active,
            counts.completed,
            counts.failed,
            counts.delayed,
            counts.paused,
        );
        metrics::set_queue_gauges(&stats);
        Ok(stats)
    }

    /// Remove every non-active job. Irreversible.
    pub async fn clear(&self) -> QueueResult<u64> {
        let removed = self.store.clear(self.name).await?;
        warn!(queue = %self.name, removed, "Cleared queue");
        Ok(removed)
    }

    /// Stop handing out jobs; enqueues are still accepted.
    pub async fn pause(&self) -> QueueResult<()> {
        self.store.set_paused(self.name, true).await?;
        info!(queue = %self.name, "Paused queue");
        Ok(())
    }

    pub async fn resume(&self) -> QueueResult<()> {
        self.store.set_paused(self.name, false).await?;
        info!(queue = %self.name, "Resumed queue");
        Ok(())
    }

    pub async fn get_job(&self, id: &JobId) -> QueueResult<Option<Job>> {
        self.store.get_job(self.name, id).await
    }

    /// Most recent dead-letter entries, newest first.
    pub async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetterEntry>> {
        self.store.dead_letters(self.name, limit).await
    }

    /// Stop accepting work and wait (bounded) for claimed jobs to report.
    ///
    /// Returns `true` when every in-flight job finished within the timeout.
    pub async fn close(&self) -> bool {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(queue = %self.name, in_flight = self.in_flight(), "Closing queue");
        }

        let drained = tokio::time::timeout(self.close_timeout, async {
            loop {
                let notified = self.drained.notified();
                if self.in_flight() == 0 {
                    break;
                }
                notified.await;
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                queue = %self.name,
                in_flight = self.in_flight(),
                "Closed queue with jobs still running; they will be recovered as stalled"
            );
        }
        drained
    }

    // ------------------------------------------------------------------
    // Worker side
    // ------------------------------------------------------------------

    /// Move due delayed jobs into the waiting set.
    pub async fn promote_delayed(&self) -> QueueResult<u64> {
        let promoted = self.store.promote_delayed(self.name, Utc::now()).await?;
        if promoted > 0 {
            debug!(queue = %self.name, promoted, "Promoted delayed jobs");
        }
        Ok(promoted)
    }

    /// Claim the next eligible job, locking it for `lock_duration`.
    ///
    /// Returns `None` when the queue is empty, paused or closed.
    pub async fn claim(
        &self,
        worker_id: &str,
        lock_duration: Duration,
    ) -> QueueResult<Option<Lease>> {
        if self.is_closed() {
            return Ok(None);
        }

        let token = format!("{}:{:016x}", worker_id, rand::random::<u64>());
        let now = Utc::now();
        let lock_until = schedule_after(now, lock_duration);

        let Some(job) = self.store.claim(self.name, &token, lock_until, now).await? else {
            return Ok(None);
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Lease { job, token }))
    }

    /// Keep the lease alive while the processor runs.
    pub async fn extend_lock(&self, lease: &Lease, lock_duration: Duration) -> QueueResult<()> {
        let lock_until = schedule_after(Utc::now(), lock_duration);
        self.store
            .extend_lock(self.name, lease.id(), &lease.token, lock_until)
            .await
    }

    /// Record a successful execution.
    pub async fn complete(&self, lease: Lease, return_value: serde_json::Value) -> QueueResult<Job> {
        let result = self
            .store
            .complete(self.name, lease.id(), &lease.token, return_value, Utc::now())
            .await;
        self.finish_lease();

        let job = result?;
        metrics::record_completed(self.name);
        Ok(job)
    }

    /// Record a failed execution and schedule another attempt after `delay`.
    pub async fn retry(&self, lease: Lease, delay: Duration) -> QueueResult<Job> {
        let now = Utc::now();
        let run_at = schedule_after(now, delay);
        let result = self
            .store
            .retry(self.name, lease.id(), &lease.token, run_at, now)
            .await;
        self.finish_lease();

        let job = result?;
        metrics::record_retried(self.name);
        Ok(job)
    }

    /// Record a failed execution that ends the job and dead-letter it.
    pub async fn fail(&self, lease: Lease, reason: &str) -> QueueResult<DeadLetterEntry> {
        let result = self
            .store
            .fail(self.name, lease.id(), &lease.token, reason, Utc::now())
            .await;
        self.finish_lease();

        let entry = result?;
        metrics::record_failed(self.name);
        Ok(entry)
    }

    /// Give up a lease without reporting an outcome. The job stays active
    /// until its lock expires and stall recovery picks it up.
    pub fn abandon(&self, lease: Lease) {
        warn!(job_id = %lease.id(), queue = %self.name, "Abandoned job lease");
        self.finish_lease();
    }

    /// Recover jobs whose worker stopped renewing the lock.
    pub async fn recover_stalled(&self, max_stalled_count: u32) -> QueueResult<StalledReport> {
        let report = self
            .store
            .recover_stalled(self.name, Utc::now(), max_stalled_count)
            .await?;

        if !report.is_empty() {
            metrics::record_stalled(self.name, report.total());
            for entry in &report.failed {
                metrics::record_failed(self.name);
                warn!(
                    job_id = %entry.job_id,
                    queue = %self.name,
                    reason = %entry.failed_reason,
                    "Stalled job moved to dead letters"
                );
            }
            for id in &report.requeued {
                warn!(job_id = %id, queue = %self.name, "Recovered stalled job");
            }
        }

        Ok(report)
    }

    fn finish_lease(&self) {
        let previous = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if previous <= 1 {
            self.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use vest_models::{BackoffStrategy, JobState};

    fn queue(store: Arc<MemoryStore>) -> Queue {
        Queue::new(
            QueueName::Email,
            store,
            JobOptions::default(),
            Duration::from_millis(200),
        )
    }

    const LOCK: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_enqueue_applies_defaults_and_overrides() {
        let store = Arc::new(MemoryStore::default());
        let queue = queue(store);

        let id = queue
            .enqueue(
                json!({"to": "a@example.com"}),
                Some(JobOptionsOverride {
                    attempts_allowed: Some(2),
                    backoff: Some(BackoffStrategy::fixed(100)),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.options.attempts_allowed, 2);
        assert_eq!(job.options.backoff, BackoffStrategy::fixed(100));
        assert_eq!(job.options.remove_on_complete, 100);
        assert_eq!(job.state, JobState::Waiting);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_null_payload_and_bad_options() {
        let queue = queue(Arc::new(MemoryStore::default()));

        let err = queue.enqueue(serde_json::Value::Null, None).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidPayload(_)));

        let err = queue
            .enqueue(
                json!({}),
                Some(JobOptionsOverride {
                    attempts_allowed: Some(0),
                    ..Default::default()
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidOptions(_)));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_delay_beyond_limit() {
        let queue = queue(Arc::new(MemoryStore::default()));

        let err = queue
            .enqueue(
                json!({"x": 1}),
                Some(JobOptionsOverride {
                    delay_ms: Some(u64::MAX),
                    ..Default::default()
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidOptions(_)));
        assert_eq!(queue.get_stats().await.unwrap().delayed_count, 0);
    }

    #[tokio::test]
    async fn test_retry_with_huge_backoff_is_clamped() {
        let queue = queue(Arc::new(MemoryStore::default()));
        let id = queue.enqueue(json!({}), None).await.unwrap();
        let lease = queue.claim("w1", LOCK).await.unwrap().unwrap();

        let delay = crate::BackoffPolicy::default()
            .delay_for(42, &BackoffStrategy::exponential(5_000));
        let before = Utc::now();
        let job = queue.retry(lease, delay).await.unwrap();

        assert_eq!(job.id, id);
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.attempts_made, 1);
        let horizon = chrono::Duration::days(vest_models::MAX_SCHEDULE_AHEAD_DAYS + 1);
        assert!(job.run_at <= before + horizon);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_extreme_lock_durations_do_not_overflow() {
        let queue = queue(Arc::new(MemoryStore::default()));
        queue.enqueue(json!({}), None).await.unwrap();

        let lease = queue.claim("w1", Duration::MAX).await.unwrap().unwrap();
        queue.extend_lock(&lease, Duration::MAX).await.unwrap();
        queue.complete(lease, json!(null)).await.unwrap();
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_surfaces_unavailable_store() {
        let store = Arc::new(MemoryStore::default());
        let queue = queue(store.clone());
        store.set_available(false);

        let err = queue.enqueue(json!({}), None).await.unwrap_err();
        assert!(matches!(err, QueueError::QueueUnavailable(_)));
    }

    #[tokio::test]
    async fn test_duplicate_dedup_key_returns_existing_id() {
        let queue = queue(Arc::new(MemoryStore::default()));
        let options = Some(JobOptions::default().with_dedup_key("welcome:42").into());

        let first = queue.enqueue(json!({}), options.clone()).await.unwrap();
        match queue.enqueue(json!({}), options).await {
            Err(QueueError::DuplicateJob(existing)) => assert_eq!(existing, first),
            other => panic!("expected duplicate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stats_are_stable_without_activity() {
        let queue = queue(Arc::new(MemoryStore::default()));
        queue.enqueue(json!({}), None).await.unwrap();
        queue
            .enqueue(json!({}), Some(JobOptions::default().with_delay_ms(60_000).into()))
            .await
            .unwrap();

        let first = queue.get_stats().await.unwrap();
        let second = queue.get_stats().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.waiting_count, 1);
        assert_eq!(first.delayed_count, 1);
    }

    #[tokio::test]
    async fn test_paused_queue_reports_paused_count() {
        let queue = queue(Arc::new(MemoryStore::default()));
        queue.enqueue(json!({}), None).await.unwrap();
        queue.pause().await.unwrap();

        let stats = queue.get_stats().await.unwrap();
        assert!(stats.is_paused);
        assert_eq!(stats.paused_count, 1);
        assert!(queue.claim("w1", LOCK).await.unwrap().is_none());

        queue.resume().await.unwrap();
        assert!(queue.claim("w1", LOCK).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_work() {
        let queue = queue(Arc::new(MemoryStore::default()));
        queue.enqueue(json!({}), None).await.unwrap();

        assert!(queue.close().await);
        assert!(matches!(
            queue.enqueue(json!({}), None).await,
            Err(QueueError::QueueClosed(_))
        ));
        assert!(queue.claim("w1", LOCK).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_waits_for_in_flight_job() {
        let queue = Arc::new(queue(Arc::new(MemoryStore::default())));
        queue.enqueue(json!({}), None).await.unwrap();
        let lease = queue.claim("w1", LOCK).await.unwrap().unwrap();
        assert_eq!(queue.in_flight(), 1);

        let finisher = {
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                queue.complete(lease, json!("ok")).await.unwrap();
            })
        };

        assert!(queue.close().await);
        assert_eq!(queue.in_flight(), 0);
        finisher.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_gives_up_after_timeout() {
        let queue = queue(Arc::new(MemoryStore::default()));
        queue.enqueue(json!({}), None).await.unwrap();
        let _lease = queue.claim("w1", LOCK).await.unwrap().unwrap();

        assert!(!queue.close().await);
    }

    #[tokio::test]
    async fn test_retry_then_complete_counts_attempts() {
        let queue = queue(Arc::new(MemoryStore::default()));
        let id = queue.enqueue(json!({}), None).await.unwrap();

        let lease = queue.claim("w1", LOCK).await.unwrap().unwrap();
        assert_eq!(lease.attempt(), 1);
        let job = queue.retry(lease, Duration::ZERO).await.unwrap();
        assert_eq!(job.state, JobState::Waiting);

        let lease = queue.claim("w1", LOCK).await.unwrap().unwrap();
        assert_eq!(lease.attempt(), 2);
        let job = queue.complete(lease, json!({"ok": true})).await.unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.attempts_made, 2);
        assert_eq!(job.state, JobState::Completed);
    }
}
