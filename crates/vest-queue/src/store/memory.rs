//! Process-local job store.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use vest_models::{DeadLetterEntry, Job, JobId, JobState, QueueName};

use super::{AddOutcome, JobStore, StalledReport, StateCounts, STALLED_REASON};
use crate::error::{QueueError, QueueResult};

#[derive(Debug)]
struct ActiveLock {
    token: String,
    lock_until: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueData {
    seq: u64,
    paused: bool,
    jobs: HashMap<JobId, Job>,
    waiting: BTreeSet<(u64, JobId)>,
    delayed: BTreeSet<(DateTime<Utc>, u64, JobId)>,
    active: HashMap<JobId, ActiveLock>,
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    dedup: HashMap<String, JobId>,
    dead_letters: VecDeque<DeadLetterEntry>,
}

impl QueueData {
    fn enqueue_waiting(&mut self, job: &Job) {
        self.waiting.insert((job.dispatch_score(), job.id.clone()));
    }

    fn enqueue_delayed(&mut self, job: &Job) {
        self.delayed.insert((job.run_at, job.seq, job.id.clone()));
    }

    /// Drop a job record together with its dedup reservation.
    fn purge(&mut self, id: &JobId) {
        if let Some(job) = self.jobs.remove(id) {
            if let Some(key) = job.options.dedup_key {
                if self.dedup.get(&key) == Some(id) {
                    self.dedup.remove(&key);
                }
            }
        }
    }

    fn trim_completed(&mut self, keep: usize) {
        while self.completed.len() > keep {
            if let Some(id) = self.completed.pop_front() {
                self.purge(&id);
            }
        }
    }

    fn trim_failed(&mut self, keep: usize) {
        while self.failed.len() > keep {
            if let Some(id) = self.failed.pop_front() {
                self.purge(&id);
            }
        }
    }

    fn push_dead_letter(&mut self, entry: DeadLetterEntry, max_len: usize) {
        self.dead_letters.push_back(entry);
        while self.dead_letters.len() > max_len {
            self.dead_letters.pop_front();
        }
    }

    /// Release the lock held by `token`, returning the job for mutation.
    fn release(&mut self, id: &JobId, token: &str) -> QueueResult<&mut Job> {
        match self.active.get(id) {
            Some(lock) if lock.token == token => {
                self.active.remove(id);
            }
            _ => return Err(QueueError::LockLost(id.clone())),
        }
        self.jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))
    }
}

/// In-memory [`JobStore`].
///
/// State lives behind a single async mutex, so every transition is atomic
/// within the process. Jobs do not survive a restart.
pub struct MemoryStore {
    queues: Mutex<HashMap<QueueName, QueueData>>,
    dlq_max_len: usize,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl MemoryStore {
    pub fn new(dlq_max_len: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            dlq_max_len,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> QueueResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::unavailable("memory store marked unavailable"))
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> QueueResult<()> {
        self.check_available()
    }

    async fn add(&self, mut job: Job) -> QueueResult<AddOutcome> {
        self.check_available()?;
        let mut queues = self.queues.lock().await;
        let data = queues.entry(job.queue_name).or_default();

        if let Some(key) = &job.options.dedup_key {
            if let Some(existing) = data.dedup.get(key) {
                return Ok(AddOutcome::Duplicate(existing.clone()));
            }
            data.dedup.insert(key.clone(), job.id.clone());
        }

        data.seq += 1;
        job.seq = data.seq;
        if job.state == JobState::Delayed {
            data.enqueue_delayed(&job);
        } else {
            data.enqueue_waiting(&job);
        }
        data.jobs.insert(job.id.clone(), job.clone());

        Ok(AddOutcome::Added(job))
    }

    async fn promote_delayed(&self, queue: QueueName, now: DateTime<Utc>) -> QueueResult<u64> {
        self.check_available()?;
        let mut queues = self.queues.lock().await;
        let data = queues.entry(queue).or_default();

        let mut promoted = 0;
        while let Some(first) = data.delayed.first() {
            if first.0 > now {
                break;
            }
            let Some((_, _, id)) = data.delayed.pop_first() else {
                break;
            };
            let Some(job) = data.jobs.get_mut(&id) else {
                continue;
            };
            job.state = JobState::Waiting;
            let entry = (job.dispatch_score(), id);
            data.waiting.insert(entry);
            promoted += 1;
        }

        Ok(promoted)
    }

    async fn claim(
        &self,
        queue: QueueName,
        token: &str,
        lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        self.check_available()?;
        let mut queues = self.queues.lock().await;
        let data = queues.entry(queue).or_default();

        if data.paused {
            return Ok(None);
        }

        while let Some((_, id)) = data.waiting.pop_first() {
            let Some(job) = data.jobs.get_mut(&id) else {
                continue;
            };
            job.mark_active(now);
            let claimed = job.clone();
            data.active.insert(
                id,
                ActiveLock {
                    token: token.to_string(),
                    lock_until,
                },
            );
            return Ok(Some(claimed));
        }

        Ok(None)
    }

    async fn extend_lock(
        &self,
        queue: QueueName,
        id: &JobId,
        token: &str,
        lock_until: DateTime<Utc>,
    ) -> QueueResult<()> {
        self.check_available()?;
        let mut queues = self.queues.lock().await;
        let data = queues.entry(queue).or_default();

        match data.active.get_mut(id) {
            Some(lock) if lock.token == token => {
                lock.lock_until = lock_until;
                Ok(())
            }
            _ => Err(QueueError::LockLost(id.clone())),
        }
    }

    async fn complete(
        &self,
        queue: QueueName,
        id: &JobId,
        token: &str,
        return_value: serde_json::Value,
        now: DateTime<Utc>,
    ) -> QueueResult<Job> {
        self.check_available()?;
        let mut queues = self.queues.lock().await;
        let data = queues.entry(queue).or_default();

        let job = data.release(id, token)?;
        job.mark_completed(return_value, now);
        let done = job.clone();

        data.completed.push_back(id.clone());
        data.trim_completed(done.options.remove_on_complete);

        Ok(done)
    }

    async fn retry(
        &self,
        queue: QueueName,
        id: &JobId,
        token: &str,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<Job> {
        self.check_available()?;
        let mut queues = self.queues.lock().await;
        let data = queues.entry(queue).or_default();

        let job = data.release(id, token)?;
        job.mark_retrying(run_at, now);
        let scheduled = job.clone();

        if scheduled.state == JobState::Delayed {
            data.enqueue_delayed(&scheduled);
        } else {
            data.enqueue_waiting(&scheduled);
        }

        Ok(scheduled)
    }

    async fn fail(
        &self,
        queue: QueueName,
        id: &JobId,
        token: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<DeadLetterEntry> {
        self.check_available()?;
        let mut queues = self.queues.lock().await;
        let data = queues.entry(queue).or_default();

        let job = data.release(id, token)?;
        job.mark_failed(reason, now);
        let entry = DeadLetterEntry::from_job(job);
        let keep = job.options.remove_on_fail;

        data.failed.push_back(id.clone());
        data.push_dead_letter(entry.clone(), self.dlq_max_len);
        data.trim_failed(keep);

        Ok(entry)
    }

    async fn recover_stalled(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
        max_stalled_count: u32,
    ) -> QueueResult<StalledReport> {
        self.check_available()?;
        let mut queues = self.queues.lock().await;
        let data = queues.entry(queue).or_default();

        let expired: Vec<JobId> = data
            .active
            .iter()
            .filter(|(_, lock)| lock.lock_until <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut report = StalledReport::default();
        for id in expired {
            data.active.remove(&id);
            let Some(job) = data.jobs.get_mut(&id) else {
                continue;
            };

            if job.stalled_count + 1 > max_stalled_count {
                job.mark_stalled_out(STALLED_REASON, now);
                let entry = DeadLetterEntry::from_job(job);
                let keep = job.options.remove_on_fail;
                data.failed.push_back(id.clone());
                data.push_dead_letter(entry.clone(), self.dlq_max_len);
                data.trim_failed(keep);
                report.failed.push(entry);
            } else {
                job.mark_stalled();
                let entry = (job.dispatch_score(), id.clone());
                data.waiting.insert(entry);
                report.requeued.push(id);
            }
        }

        Ok(report)
    }

    async fn counts(&self, queue: QueueName) -> QueueResult<StateCounts> {
        self.check_available()?;
        let mut queues = self.queues.lock().await;
        let data = queues.entry(queue).or_default();

        Ok(StateCounts {
            waiting: data.waiting.len() as u64,
            active: data.active.len() as u64,
            completed: data.completed.len() as u64,
            failed: data.failed.len() as u64,
            delayed: data.delayed.len() as u64,
            paused: data.paused,
        })
    }

    async fn clear(&self, queue: QueueName) -> QueueResult<u64> {
        self.check_available()?;
        let mut queues = self.queues.lock().await;
        let data = queues.entry(queue).or_default();

        let mut ids: Vec<JobId> = Vec::new();
        ids.extend(std::mem::take(&mut data.waiting).into_iter().map(|(_, id)| id));
        ids.extend(std::mem::take(&mut data.delayed).into_iter().map(|(_, _, id)| id));
        ids.extend(std::mem::take(&mut data.completed));
        ids.extend(std::mem::take(&mut data.failed));

        for id in &ids {
            data.purge(id);
        }

        Ok(ids.len() as u64)
    }

    async fn get_job(&self, queue: QueueName, id: &JobId) -> QueueResult<Option<Job>> {
        self.check_available()?;
        let queues = self.queues.lock().await;
        Ok(queues.get(&queue).and_then(|data| data.jobs.get(id).cloned()))
    }

    async fn dead_letters(
        &self,
        queue: QueueName,
        limit: usize,
    ) -> QueueResult<Vec<DeadLetterEntry>> {
        self.check_available()?;
        let queues = self.queues.lock().await;
        Ok(queues
            .get(&queue)
            .map(|data| data.dead_letters.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn set_paused(&self, queue: QueueName, paused: bool) -> QueueResult<()> {
        self.check_available()?;
        let mut queues = self.queues.lock().await;
        queues.entry(queue).or_default().paused = paused;
        Ok(())
    }
}
