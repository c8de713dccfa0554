//! Redis key layout and low-level queue operations
//!
//! Per queue, under `{prefix}:queue:{name}`:
//!
//! | suffix       | type | content                                   |
//! |--------------|------|-------------------------------------------|
//! | `:jobs`      | HASH | job id -> JSON record                     |
//! | `:wait`      | ZSET | ready job ids, scored by priority and seq |
//! | `:delayed`   | ZSET | job ids scored by ready time (ms)         |
//! | `:active`    | SET  | job ids being processed                   |
//! | `:completed` | ZSET | job ids scored by finish time (ms)        |
//! | `:failed`    | ZSET | job ids scored by finish time (ms)        |
//! | `:repeat`    | HASH | job name -> recurring definition          |
//! | `:seq`       | STR  | insertion counter                         |
//! | `:lock:{id}` | STR  | token of the worker running the job (TTL) |
//!
//! Worker heartbeats live at `{prefix}:workers:{queue}:{worker_id}`.
//!
//! Every state transition runs as one Lua script, so a crash never leaves a
//! job in no set at all. Each script checks its precondition first: a
//! delayed job moves only if it is still delayed, a finished run is recorded
//! only while the worker still holds the job lock, and a stalled job is
//! recovered only once that lock has expired.

use deadpool_redis::Connection;
use redis::{AsyncCommands, Script};
use std::sync::LazyLock;
use std::time::Duration;

use super::job::{Job, KeepJobs};
use crate::error::Result;

/// Delayed jobs promoted per dequeue
const PROMOTE_BATCH: isize = 100;

/// Key names for one queue
#[derive(Debug, Clone)]
pub struct QueueKeys {
    pub jobs: String,
    pub wait: String,
    pub delayed: String,
    pub active: String,
    pub completed: String,
    pub failed: String,
    pub repeat: String,
    pub seq: String,
    pub workers: String,
    /// Prefix of the per-job lock keys
    pub locks: String,
}

impl QueueKeys {
    pub fn new(prefix: &str, queue: &str) -> Self {
        let base = format!("{prefix}:queue:{queue}");
        Self {
            jobs: format!("{base}:jobs"),
            wait: format!("{base}:wait"),
            delayed: format!("{base}:delayed"),
            active: format!("{base}:active"),
            completed: format!("{base}:completed"),
            failed: format!("{base}:failed"),
            repeat: format!("{base}:repeat"),
            seq: format!("{base}:seq"),
            workers: format!("{prefix}:workers:{queue}"),
            locks: format!("{base}:lock:"),
        }
    }

    pub fn lock(&self, job_id: &str) -> String {
        format!("{}{}", self.locks, job_id)
    }

    pub fn worker(&self, worker_id: &str) -> String {
        format!("{}:{}", self.workers, worker_id)
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) async fn load_job(conn: &mut Connection, keys: &QueueKeys, id: &str) -> Result<Option<Job>> {
    let raw: Option<String> = conn.hget(&keys.jobs, id).await?;
    match raw {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub(crate) async fn save_job(conn: &mut Connection, keys: &QueueKeys, job: &Job) -> Result<()> {
    let raw = serde_json::to_string(job)?;
    let _: () = conn.hset(&keys.jobs, &job.id, raw).await?;
    Ok(())
}

/// KEYS: wait, active. ARGV: lock prefix, token, lock ttl (ms)
static TAKE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then return false end
local id = popped[1]
redis.call('SADD', KEYS[2], id)
redis.call('SET', ARGV[1] .. id, ARGV[2], 'PX', ARGV[3])
return id
",
    )
});

/// KEYS: delayed, jobs, wait. ARGV: id, record, wait score
static PROMOTE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then return 0 end
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
return 1
",
    )
});

/// KEYS: lock. ARGV: token, lock ttl (ms)
static EXTEND: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then return 0 end
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return 1
",
    )
});

/// KEYS: lock, active, jobs, target. ARGV: id, token, record, score
static FINISH: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('GET', KEYS[1]) ~= ARGV[2] then return 0 end
redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
return 1
",
    )
});

/// KEYS: lock, active, jobs, target. ARGV: id, record, score
static RECOVER: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
if redis.call('SREM', KEYS[2], ARGV[1]) == 0 then return 0 end
redis.call('HSET', KEYS[3], ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[4], ARGV[3], ARGV[1])
return 1
",
    )
});

/// Move delayed jobs whose time has come into the waiting set
pub(crate) async fn promote_due(conn: &mut Connection, keys: &QueueKeys) -> Result<usize> {
    let due: Vec<String> = conn
        .zrangebyscore_limit(&keys.delayed, "-inf", now_ms(), 0, PROMOTE_BATCH)
        .await?;

    let mut promoted = 0;
    for id in due {
        let Some(mut job) = load_job(conn, keys, &id).await? else {
            let _: () = conn.zrem(&keys.delayed, &id).await?;
            continue;
        };
        job.state = super::JobState::Waiting;
        job.ready_at = None;
        let raw = serde_json::to_string(&job)?;

        // Another consumer may have promoted or discarded it since the read
        let moved: i64 = PROMOTE
            .key(&keys.delayed)
            .key(&keys.jobs)
            .key(&keys.wait)
            .arg(&id)
            .arg(raw)
            .arg(job.wait_score())
            .invoke_async(&mut **conn)
            .await?;
        promoted += moved as usize;
    }

    Ok(promoted)
}

/// Pop the highest-priority ready job id, mark it active and lock it
pub(crate) async fn take_ready(
    conn: &mut Connection,
    keys: &QueueKeys,
    token: &str,
    lock_ttl: Duration,
) -> Result<Option<String>> {
    let id: Option<String> = TAKE
        .key(&keys.wait)
        .key(&keys.active)
        .arg(&keys.locks)
        .arg(token)
        .arg(duration_ms(lock_ttl).max(1))
        .invoke_async(&mut **conn)
        .await?;
    Ok(id)
}

/// Push back the expiry of a lock `token` still holds
pub(crate) async fn extend_lock(
    conn: &mut Connection,
    keys: &QueueKeys,
    job_id: &str,
    token: &str,
    lock_ttl: Duration,
) -> Result<bool> {
    let extended: i64 = EXTEND
        .key(keys.lock(job_id))
        .arg(token)
        .arg(duration_ms(lock_ttl).max(1))
        .invoke_async(&mut **conn)
        .await?;
    Ok(extended == 1)
}

/// Record the end of a run held under `token` and move the job to `target`
///
/// Returns `false`, changing nothing, when the lock is no longer held.
pub(crate) async fn finish(
    conn: &mut Connection,
    keys: &QueueKeys,
    job: &Job,
    token: &str,
    target: &str,
    score: i64,
) -> Result<bool> {
    let raw = serde_json::to_string(job)?;
    let finished: i64 = FINISH
        .key(keys.lock(&job.id))
        .key(&keys.active)
        .key(&keys.jobs)
        .key(target)
        .arg(&job.id)
        .arg(token)
        .arg(raw)
        .arg(score)
        .invoke_async(&mut **conn)
        .await?;
    Ok(finished == 1)
}

/// Move an active job whose lock expired to `target`
///
/// Returns `false` when the job is locked again or no longer active.
pub(crate) async fn recover(
    conn: &mut Connection,
    keys: &QueueKeys,
    job: &Job,
    target: &str,
    score: f64,
) -> Result<bool> {
    let raw = serde_json::to_string(job)?;
    let recovered: i64 = RECOVER
        .key(keys.lock(&job.id))
        .key(&keys.active)
        .key(&keys.jobs)
        .key(target)
        .arg(&job.id)
        .arg(raw)
        .arg(score)
        .invoke_async(&mut **conn)
        .await?;
    Ok(recovered == 1)
}

/// Drop finished jobs beyond the retention policy from `set`
pub(crate) async fn prune(
    conn: &mut Connection,
    keys: &QueueKeys,
    set: &str,
    keep: &KeepJobs,
) -> Result<usize> {
    let mut doomed: Vec<String> = Vec::new();

    if let Some(max_age) = keep.max_age {
        let cutoff = now_ms() - duration_ms(max_age);
        let expired: Vec<String> = conn.zrangebyscore(set, "-inf", cutoff).await?;
        doomed.extend(expired);
    }

    let total: usize = conn.zcard(set).await?;
    let remaining = total.saturating_sub(doomed.len());
    if remaining > keep.count {
        let excess = (total - keep.count) as isize;
        // Oldest first; overlaps with the age cut are harmless
        let oldest: Vec<String> = conn.zrange(set, 0, excess - 1).await?;
        doomed.extend(oldest);
    }

    if doomed.is_empty() {
        return Ok(0);
    }

    doomed.sort_unstable();
    doomed.dedup();

    let _: () = redis::pipe()
        .atomic()
        .zrem(set, &doomed)
        .ignore()
        .hdel(&keys.jobs, &doomed)
        .ignore()
        .query_async(&mut **conn)
        .await?;

    Ok(doomed.len())
}

pub(crate) fn duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = QueueKeys::new("redlead", "reply-tracking");
        assert_eq!(keys.wait, "redlead:queue:reply-tracking:wait");
        assert_eq!(keys.jobs, "redlead:queue:reply-tracking:jobs");
        assert_eq!(keys.worker("w1"), "redlead:workers:reply-tracking:w1");
        assert_eq!(keys.lock("42"), "redlead:queue:reply-tracking:lock:42");
    }

    #[test]
    fn test_duration_ms_saturates() {
        assert_eq!(duration_ms(Duration::from_secs(2)), 2000);
        assert_eq!(duration_ms(Duration::MAX), i64::MAX);
    }
}
