//! Redis-backed job store.
//!
//! Every queue owns a family of keys under `{prefix}:{queue}:`:
//!
//! | Key         | Type   | Content                                   |
//! |-------------|--------|-------------------------------------------|
//! | `seq`       | string | enqueue sequence counter                  |
//! | `jobs`      | hash   | job id -> job JSON                        |
//! | `prio`      | hash   | job id -> dispatch score                  |
//! | `waiting`   | zset   | job id scored by dispatch score           |
//! | `delayed`   | zset   | job id scored by run time (ms)            |
//! | `active`    | zset   | job id scored by lock expiry (ms)         |
//! | `locks`     | hash   | job id -> lock token                      |
//! | `completed` | zset   | job id scored by finish time (ms)         |
//! | `failed`    | zset   | job id scored by finish time (ms)         |
//! | `dedup`     | hash   | dedup key -> job id                       |
//! | `dedupOf`   | hash   | job id -> dedup key                       |
//! | `stalls`    | hash   | job id -> stall count                     |
//! | `dlq`       | stream | dead-letter entries                       |
//! | `paused`    | string | present while the queue is paused         |
//!
//! Set membership is changed only by the Lua scripts below, which makes every
//! transition atomic across processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::streams::StreamRangeReply;
use redis::{AsyncCommands, Script, ScriptInvocation};
use tracing::{debug, info, warn};
use vest_models::{DeadLetterEntry, Job, JobId, JobState, QueueName};

use super::{AddOutcome, JobStore, StalledReport, StateCounts, STALLED_REASON};
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};

/// Upper bound of jobs handled by one stalled sweep.
const STALLED_BATCH: usize = 1_000;

/// Upper bound of jobs promoted by one delayed sweep.
const PROMOTE_BATCH: usize = 1_000;

// KEYS layout shared by every script:
//  1 jobs  2 prio  3 waiting  4 delayed  5 active  6 locks  7 completed
//  8 failed  9 dedup  10 dedupOf  11 stalls  12 dlq  13 paused
const HELPERS_LUA: &str = r#"
local function purge(id)
  redis.call('HDEL', KEYS[1], id)
  redis.call('HDEL', KEYS[2], id)
  redis.call('HDEL', KEYS[11], id)
  local key = redis.call('HGET', KEYS[10], id)
  if key then
    if redis.call('HGET', KEYS[9], key) == id then
      redis.call('HDEL', KEYS[9], key)
    end
    redis.call('HDEL', KEYS[10], id)
  end
end

local function trim(set, keep)
  local excess = redis.call('ZCARD', set) - keep
  if excess > 0 then
    local old = redis.call('ZRANGE', set, 0, excess - 1)
    for _, id in ipairs(old) do
      redis.call('ZREM', set, id)
      purge(id)
    end
  end
end

local function owns(id, token)
  return redis.call('HGET', KEYS[6], id) == token
end

local function release(id)
  redis.call('HDEL', KEYS[6], id)
  redis.call('ZREM', KEYS[5], id)
end

local function bury(id, json, finished, keep, entry, maxlen)
  redis.call('HSET', KEYS[1], id, json)
  redis.call('ZADD', KEYS[8], finished, id)
  redis.call('XADD', KEYS[12], 'MAXLEN', maxlen, '*', 'entry', entry)
  trim(KEYS[8], tonumber(keep))
end
"#;

// ARGV: id, json, dedup key ('' for none), 'delayed'|'waiting', score, run_at
const ADD_LUA: &str = r#"
if ARGV[3] ~= '' then
  local existing = redis.call('HGET', KEYS[9], ARGV[3])
  if existing then
    return {0, existing}
  end
  redis.call('HSET', KEYS[9], ARGV[3], ARGV[1])
  redis.call('HSET', KEYS[10], ARGV[1], ARGV[3])
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[5])
if ARGV[4] == 'delayed' then
  redis.call('ZADD', KEYS[4], ARGV[6], ARGV[1])
else
  redis.call('ZADD', KEYS[3], ARGV[5], ARGV[1])
end
return {1, ARGV[1]}
"#;

// ARGV: now, limit
const PROMOTE_LUA: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[4], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[4], id)
  redis.call('ZADD', KEYS[3], redis.call('HGET', KEYS[2], id) or '0', id)
end
return #ids
"#;

// ARGV: token, lock_until
const CLAIM_LUA: &str = r#"
if redis.call('EXISTS', KEYS[13]) == 1 then
  return false
end
while true do
  local popped = redis.call('ZPOPMIN', KEYS[3])
  if #popped == 0 then
    return false
  end
  local id = popped[1]
  local json = redis.call('HGET', KEYS[1], id)
  if json then
    redis.call('ZADD', KEYS[5], ARGV[2], id)
    redis.call('HSET', KEYS[6], id, ARGV[1])
    return {json, redis.call('HGET', KEYS[11], id) or '0'}
  end
end
"#;

// ARGV: id, token, lock_until
const EXTEND_LUA: &str = r#"
if not owns(ARGV[1], ARGV[2]) then
  return 0
end
redis.call('ZADD', KEYS[5], ARGV[3], ARGV[1])
return 1
"#;

// ARGV: id, token, json, finished, keep
const COMPLETE_LUA: &str = r#"
if not owns(ARGV[1], ARGV[2]) then
  return 0
end
release(ARGV[1])
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
redis.call('ZADD', KEYS[7], ARGV[4], ARGV[1])
trim(KEYS[7], tonumber(ARGV[5]))
return 1
"#;

// ARGV: id, token, json, '1' when delayed, run_at
const RETRY_LUA: &str = r#"
if not owns(ARGV[1], ARGV[2]) then
  return 0
end
release(ARGV[1])
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
if ARGV[4] == '1' then
  redis.call('ZADD', KEYS[4], ARGV[5], ARGV[1])
else
  redis.call('ZADD', KEYS[3], redis.call('HGET', KEYS[2], ARGV[1]) or '0', ARGV[1])
end
return 1
"#;

// ARGV: id, token, json, finished, keep, entry, dlq max len
const FAIL_LUA: &str = r#"
if not owns(ARGV[1], ARGV[2]) then
  return 0
end
release(ARGV[1])
bury(ARGV[1], ARGV[3], ARGV[4], ARGV[5], ARGV[6], ARGV[7])
return 1
"#;

// ARGV: now, max stalled count, limit
// Returns {requeued ids, {id, json, stalls, ...} of jobs over the limit}
const RECOVER_LUA: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[5], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[3]))
local requeued = {}
local dead = {}
for _, id in ipairs(ids) do
  release(id)
  local stalls = redis.call('HINCRBY', KEYS[11], id, 1)
  local json = redis.call('HGET', KEYS[1], id)
  if json then
    if stalls > tonumber(ARGV[2]) then
      redis.call('ZADD', KEYS[8], ARGV[1], id)
      table.insert(dead, id)
      table.insert(dead, json)
      table.insert(dead, tostring(stalls))
    else
      redis.call('ZADD', KEYS[3], redis.call('HGET', KEYS[2], id) or '0', id)
      table.insert(requeued, id)
    end
  end
end
return {requeued, dead}
"#;

// ARGV: id, json, finished, keep, entry, dlq max len
const BURY_LUA: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 0 then
  return 0
end
bury(ARGV[1], ARGV[2], ARGV[3], ARGV[4], ARGV[5], ARGV[6])
return 1
"#;

const CLEAR_LUA: &str = r#"
local removed = 0
for _, set in ipairs({KEYS[3], KEYS[4], KEYS[7], KEYS[8]}) do
  local ids = redis.call('ZRANGE', set, 0, -1)
  for _, id in ipairs(ids) do
    purge(id)
    removed = removed + 1
  end
  redis.call('DEL', set)
end
return removed
"#;

struct Scripts {
    add: Script,
    promote: Script,
    claim: Script,
    extend: Script,
    complete: Script,
    retry: Script,
    fail: Script,
    recover: Script,
    bury: Script,
    clear: Script,
}

impl Scripts {
    fn load() -> Self {
        let with_helpers = |body: &str| Script::new(&format!("{}\n{}", HELPERS_LUA, body));
        Self {
            add: Script::new(ADD_LUA),
            promote: Script::new(PROMOTE_LUA),
            claim: Script::new(CLAIM_LUA),
            extend: with_helpers(EXTEND_LUA),
            complete: with_helpers(COMPLETE_LUA),
            retry: with_helpers(RETRY_LUA),
            fail: with_helpers(FAIL_LUA),
            recover: with_helpers(RECOVER_LUA),
            bury: with_helpers(BURY_LUA),
            clear: with_helpers(CLEAR_LUA),
        }
    }
}

/// Redis key names of one queue.
struct QueueKeys {
    seq: String,
    jobs: String,
    prio: String,
    waiting: String,
    delayed: String,
    active: String,
    locks: String,
    completed: String,
    failed: String,
    dedup: String,
    dedup_of: String,
    stalls: String,
    dlq: String,
    paused: String,
}

impl QueueKeys {
    fn new(prefix: &str, queue: QueueName) -> Self {
        let key = |name: &str| format!("{}:{}:{}", prefix, queue.as_str(), name);
        Self {
            seq: key("seq"),
            jobs: key("jobs"),
            prio: key("prio"),
            waiting: key("waiting"),
            delayed: key("delayed"),
            active: key("active"),
            locks: key("locks"),
            completed: key("completed"),
            failed: key("failed"),
            dedup: key("dedup"),
            dedup_of: key("dedupOf"),
            stalls: key("stalls"),
            dlq: key("dlq"),
            paused: key("paused"),
        }
    }

    /// Attach every key, in the order the scripts expect.
    fn bind<'a>(&self, script: &'a Script) -> ScriptInvocation<'a> {
        let mut invocation = script.prepare_invoke();
        for key in [
            &self.jobs,
            &self.prio,
            &self.waiting,
            &self.delayed,
            &self.active,
            &self.locks,
            &self.completed,
            &self.failed,
            &self.dedup,
            &self.dedup_of,
            &self.stalls,
            &self.dlq,
            &self.paused,
        ] {
            invocation.key(key);
        }
        invocation
    }
}

/// Durable [`JobStore`] shared by every worker process.
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
    dlq_max_len: usize,
    scripts: Scripts,
}

impl RedisStore {
    /// Create a store. No connection is made until the first operation.
    pub fn new(config: &QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        info!(prefix = %config.key_prefix, "Configured Redis job store");
        Ok(Self {
            client,
            prefix: config.key_prefix.clone(),
            dlq_max_len: config.dlq_max_len,
            scripts: Scripts::load(),
        })
    }

    async fn conn(&self) -> QueueResult<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn keys(&self, queue: QueueName) -> QueueKeys {
        QueueKeys::new(&self.prefix, queue)
    }

    async fn load_job(
        &self,
        conn: &mut MultiplexedConnection,
        keys: &QueueKeys,
        id: &JobId,
    ) -> QueueResult<Job> {
        let json: Option<String> = conn.hget(&keys.jobs, id.as_str()).await?;
        let json = json.ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
        Ok(serde_json::from_str(&json)?)
    }
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn lock_lost(owned: i64, id: &JobId) -> QueueResult<()> {
    if owned == 1 {
        Ok(())
    } else {
        Err(QueueError::LockLost(id.clone()))
    }
}

#[async_trait]
impl JobStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn add(&self, mut job: Job) -> QueueResult<AddOutcome> {
        let keys = self.keys(job.queue_name);
        let mut conn = self.conn().await?;

        // Duplicates leave a gap in the sequence, which ordering tolerates
        job.seq = conn.incr(&keys.seq, 1u64).await?;
        let json = serde_json::to_string(&job)?;
        let placement = if job.state == JobState::Delayed {
            "delayed"
        } else {
            "waiting"
        };

        let (added, id): (i64, String) = keys
            .bind(&self.scripts.add)
            .arg(job.id.as_str())
            .arg(&json)
            .arg(job.options.dedup_key.as_deref().unwrap_or(""))
            .arg(placement)
            .arg(job.dispatch_score())
            .arg(millis(job.run_at))
            .invoke_async(&mut conn)
            .await?;

        if added == 1 {
            Ok(AddOutcome::Added(job))
        } else {
            Ok(AddOutcome::Duplicate(JobId::from_string(id)))
        }
    }

    async fn promote_delayed(&self, queue: QueueName, now: DateTime<Utc>) -> QueueResult<u64> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;
        let promoted: u64 = keys
            .bind(&self.scripts.promote)
            .arg(millis(now))
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;
        Ok(promoted)
    }

    async fn claim(
        &self,
        queue: QueueName,
        token: &str,
        lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let claimed: Option<(String, String)> = keys
            .bind(&self.scripts.claim)
            .arg(token)
            .arg(millis(lock_until))
            .invoke_async(&mut conn)
            .await?;

        let Some((json, stalls)) = claimed else {
            return Ok(None);
        };

        let mut job: Job = serde_json::from_str(&json)?;
        job.stalled_count = stalls.parse().unwrap_or(job.stalled_count);
        job.mark_active(now);
        conn.hset::<_, _, _, ()>(&keys.jobs, job.id.as_str(), serde_json::to_string(&job)?)
            .await?;

        debug!(job_id = %job.id, queue = %queue, "Claimed job");
        Ok(Some(job))
    }

    async fn extend_lock(
        &self,
        queue: QueueName,
        id: &JobId,
        token: &str,
        lock_until: DateTime<Utc>,
    ) -> QueueResult<()> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;
        let owned: i64 = keys
            .bind(&self.scripts.extend)
            .arg(id.as_str())
            .arg(token)
            .arg(millis(lock_until))
            .invoke_async(&mut conn)
            .await?;
        lock_lost(owned, id)
    }

    async fn complete(
        &self,
        queue: QueueName,
        id: &JobId,
        token: &str,
        return_value: serde_json::Value,
        now: DateTime<Utc>,
    ) -> QueueResult<Job> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let mut job = self.load_job(&mut conn, &keys, id).await?;
        job.mark_completed(return_value, now);

        let owned: i64 = keys
            .bind(&self.scripts.complete)
            .arg(id.as_str())
            .arg(token)
            .arg(serde_json::to_string(&job)?)
            .arg(millis(now))
            .arg(job.options.remove_on_complete)
            .invoke_async(&mut conn)
            .await?;
        lock_lost(owned, id)?;

        Ok(job)
    }

    async fn retry(
        &self,
        queue: QueueName,
        id: &JobId,
        token: &str,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<Job> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let mut job = self.load_job(&mut conn, &keys, id).await?;
        job.mark_retrying(run_at, now);
        let delayed = if job.state == JobState::Delayed { "1" } else { "0" };

        let owned: i64 = keys
            .bind(&self.scripts.retry)
            .arg(id.as_str())
            .arg(token)
            .arg(serde_json::to_string(&job)?)
            .arg(delayed)
            .arg(millis(run_at))
            .invoke_async(&mut conn)
            .await?;
        lock_lost(owned, id)?;

        Ok(job)
    }

    async fn fail(
        &self,
        queue: QueueName,
        id: &JobId,
        token: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<DeadLetterEntry> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let mut job = self.load_job(&mut conn, &keys, id).await?;
        job.mark_failed(reason, now);
        let entry = DeadLetterEntry::from_job(&job);

        let owned: i64 = keys
            .bind(&self.scripts.fail)
            .arg(id.as_str())
            .arg(token)
            .arg(serde_json::to_string(&job)?)
            .arg(millis(now))
            .arg(job.options.remove_on_fail)
            .arg(serde_json::to_string(&entry)?)
            .arg(self.dlq_max_len)
            .invoke_async(&mut conn)
            .await?;
        lock_lost(owned, id)?;

        Ok(entry)
    }

    async fn recover_stalled(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
        max_stalled_count: u32,
    ) -> QueueResult<StalledReport> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let (requeued, dead): (Vec<String>, Vec<String>) = keys
            .bind(&self.scripts.recover)
            .arg(millis(now))
            .arg(max_stalled_count)
            .arg(STALLED_BATCH)
            .invoke_async(&mut conn)
            .await?;

        let mut report = StalledReport {
            requeued: requeued.into_iter().map(JobId::from_string).collect(),
            failed: Vec::new(),
        };

        // The script already moved these into the failed set; record the
        // final job state and the dead-letter entry.
        for chunk in dead.chunks(3) {
            let [id, json, stalls] = chunk else {
                continue;
            };
            let mut job: Job = match serde_json::from_str(json) {
                Ok(job) => job,
                Err(e) => {
                    warn!(job_id = %id, queue = %queue, "Unreadable stalled job: {}", e);
                    continue;
                }
            };
            let stalls: u32 = stalls.parse().unwrap_or(max_stalled_count + 1);
            job.stalled_count = stalls.saturating_sub(1);
            job.mark_stalled_out(STALLED_REASON, now);
            let entry = DeadLetterEntry::from_job(&job);

            let _buried: i64 = keys
                .bind(&self.scripts.bury)
                .arg(id)
                .arg(serde_json::to_string(&job)?)
                .arg(millis(now))
                .arg(job.options.remove_on_fail)
                .arg(serde_json::to_string(&entry)?)
                .arg(self.dlq_max_len)
                .invoke_async(&mut conn)
                .await?;
            report.failed.push(entry);
        }

        Ok(report)
    }

    async fn counts(&self, queue: QueueName) -> QueueResult<StateCounts> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let (waiting, active, completed, failed, delayed, paused): (u64, u64, u64, u64, u64, bool) =
            redis::pipe()
                .zcard(&keys.waiting)
                .zcard(&keys.active)
                .zcard(&keys.completed)
                .zcard(&keys.failed)
                .zcard(&keys.delayed)
                .exists(&keys.paused)
                .query_async(&mut conn)
                .await?;

        Ok(StateCounts {
            waiting,
            active,
            completed,
            failed,
            delayed,
            paused,
        })
    }

    async fn clear(&self, queue: QueueName) -> QueueResult<u64> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;
        let removed: u64 = keys.bind(&self.scripts.clear).invoke_async(&mut conn).await?;
        Ok(removed)
    }

    async fn get_job(&self, queue: QueueName, id: &JobId) -> QueueResult<Option<Job>> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        #[allow(clippy::type_complexity)]
        let (json, stalls, waiting, delayed, active): (
            Option<String>,
            Option<u32>,
            Option<f64>,
            Option<f64>,
            Option<f64>,
        ) = redis::pipe()
            .hget(&keys.jobs, id.as_str())
            .hget(&keys.stalls, id.as_str())
            .zscore(&keys.waiting, id.as_str())
            .zscore(&keys.delayed, id.as_str())
            .zscore(&keys.active, id.as_str())
            .query_async(&mut conn)
            .await?;

        let Some(json) = json else {
            return Ok(None);
        };
        let mut job: Job = serde_json::from_str(&json)?;

        // Promotion and stall recovery move ids between sets without
        // rewriting the record
        if waiting.is_some() {
            job.state = JobState::Waiting;
        } else if delayed.is_some() {
            job.state = JobState::Delayed;
        } else if active.is_some() {
            job.state = JobState::Active;
        }
        if let Some(stalls) = stalls {
            job.stalled_count = job.stalled_count.max(stalls);
        }

        Ok(Some(job))
    }

    async fn dead_letters(
        &self,
        queue: QueueName,
        limit: usize,
    ) -> QueueResult<Vec<DeadLetterEntry>> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let reply: StreamRangeReply = conn.xrevrange_count(&keys.dlq, "+", "-", limit).await?;

        let mut entries = Vec::with_capacity(reply.ids.len());
        for stream_id in reply.ids {
            if let Some(redis::Value::BulkString(raw)) = stream_id.map.get("entry") {
                match serde_json::from_slice::<DeadLetterEntry>(raw) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!(queue = %queue, id = %stream_id.id, "Skipping malformed dead letter: {}", e),
                }
            }
        }

        Ok(entries)
    }

    async fn set_paused(&self, queue: QueueName, paused: bool) -> QueueResult<()> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;
        if paused {
            conn.set::<_, _, ()>(&keys.paused, 1).await?;
        } else {
            conn.del::<_, ()>(&keys.paused).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = QueueKeys::new("vest", QueueName::RoiDistribution);
        assert_eq!(keys.jobs, "vest:roi-distribution:jobs");
        assert_eq!(keys.dedup_of, "vest:roi-distribution:dedupOf");
        assert_eq!(keys.dlq, "vest:roi-distribution:dlq");
    }

    #[test]
    fn test_scripts_include_helpers_where_needed() {
        // Scripts calling helper functions must be prefixed with them
        for body in [EXTEND_LUA, COMPLETE_LUA, RETRY_LUA, FAIL_LUA, RECOVER_LUA, BURY_LUA, CLEAR_LUA] {
            assert!(
                body.contains("owns(")
                    || body.contains("release(")
                    || body.contains("bury(")
                    || body.contains("purge("),
            );
        }
        for body in [ADD_LUA, PROMOTE_LUA, CLAIM_LUA] {
            assert!(!body.contains("purge(") && !body.contains("owns("));
        }
    }

    #[test]
    fn test_store_creation_is_lazy() {
        let config = QueueConfig {
            redis_url: "redis://127.0.0.1:1".to_string(),
            ..QueueConfig::default()
        };
        let store = RedisStore::new(&config).unwrap();
        assert_eq!(store.backend(), "redis");
    }
}
