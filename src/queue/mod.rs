//! Durable job queues backed by Redis
//!
//! [`create_queue`] and [`create_worker`] return `None` while the store probe
//! reports the store unavailable. The scheduler relies on that to choose
//! between queue mode and its in-process timers.
//!
//! Jobs are retried with exponential backoff until their attempt budget is
//! spent, then kept in a bounded failed set for inspection. Completed jobs
//! are kept by count and age.

mod backend;
pub mod job;
pub mod worker;

pub use backend::QueueKeys;
pub use job::{Job, JobCounts, JobOptions, JobState, KeepJobs};
pub use worker::{create_worker, JobProcessor, Worker, WorkerOptions};

use async_trait::async_trait;
use chrono::{Local, TimeZone, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::jobs::{JobDefinition, JobKind};
use crate::scheduler::error::SchedulerError;
use crate::scheduler::{CronPattern, RecurringJobRegistrar};
use crate::store::StoreProbe;
use backend::{duration_ms, now_ms};

/// Failure reason recorded on a job whose worker lock expired
pub const STALLED_REASON: &str = "job stalled: worker lock expired";

/// Default options for jobs added to a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub attempts: u32,
    pub backoff: Duration,
    pub remove_on_complete: KeepJobs,
    pub remove_on_fail: KeepJobs,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
            remove_on_complete: KeepJobs {
                count: 100,
                max_age: Some(Duration::from_secs(24 * 3600)),
            },
            remove_on_fail: KeepJobs {
                count: 500,
                max_age: None,
            },
        }
    }
}

/// Stored definition of a recurring job
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RepeatDefinition {
    pattern: String,
    data: serde_json::Value,
    priority: u32,
    /// Id of the pending occurrence
    next_id: String,
}

/// Handle to one named queue
#[derive(Debug)]
pub struct Queue {
    name: String,
    probe: Arc<StoreProbe>,
    keys: QueueKeys,
    options: QueueOptions,
    closed: AtomicBool,
}

/// Create a queue handle, `None` when the store is unavailable
pub fn create_queue(probe: &Arc<StoreProbe>, name: &str, options: QueueOptions) -> Option<Arc<Queue>> {
    if !probe.is_available() {
        debug!(queue = %name, "Store unavailable, queue not created");
        return None;
    }

    Some(Arc::new(Queue::new(Arc::clone(probe), name, options)))
}

impl Queue {
    fn new(probe: Arc<StoreProbe>, name: &str, options: QueueOptions) -> Self {
        let keys = QueueKeys::new(probe.key_prefix(), name);
        Self {
            name: name.to_string(),
            probe,
            keys,
            options,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::queue_closed(&self.name));
        }
        Ok(())
    }

    fn job_options(&self, priority: u32, repeat: Option<String>) -> JobOptions {
        JobOptions {
            priority,
            attempts: self.options.attempts.max(1),
            backoff: self.options.backoff,
            repeat,
            remove_on_complete: self.options.remove_on_complete,
            remove_on_fail: self.options.remove_on_fail,
        }
    }

    async fn next_seq(&self, conn: &mut deadpool_redis::Connection) -> Result<u64> {
        let seq: u64 = conn.incr(&self.keys.seq, 1).await?;
        Ok(seq)
    }

    /// Enqueue a one-off job
    pub async fn add(&self, name: &str, data: serde_json::Value, priority: u32) -> Result<Job> {
        self.ensure_open()?;
        let mut conn = self.probe.connection().await?;

        let seq = self.next_seq(&mut conn).await?;
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            queue: self.name.clone(),
            name: name.to_string(),
            data,
            opts: self.job_options(priority, None),
            state: JobState::Waiting,
            attempts_made: 0,
            seq,
            created_at: Utc::now(),
            ready_at: None,
            processed_at: None,
            finished_at: None,
            failed_reason: None,
        };

        backend::save_job(&mut conn, &self.keys, &job).await?;
        let _: () = conn.zadd(&self.keys.wait, &job.id, job.wait_score()).await?;

        debug!(queue = %self.name, job_id = %job.id, job_name = %name, "Job added");
        Ok(job)
    }

    /// Register a recurring job and schedule its next occurrence
    ///
    /// Idempotent per job name: re-registering the same pattern keeps the
    /// pending occurrence, a new pattern replaces it.
    pub async fn add_repeatable(
        &self,
        name: &str,
        data: serde_json::Value,
        priority: u32,
        pattern: &CronPattern,
    ) -> Result<Job> {
        self.ensure_open()?;
        let mut conn = self.probe.connection().await?;

        let existing: Option<String> = conn.hget(&self.keys.repeat, name).await?;
        if let Some(existing) = existing {
            let existing: RepeatDefinition = serde_json::from_str(&existing)?;
            if existing.pattern == pattern.as_str() {
                if let Some(job) = backend::load_job(&mut conn, &self.keys, &existing.next_id).await? {
                    if matches!(job.state, JobState::Delayed | JobState::Waiting) {
                        debug!(queue = %self.name, job_name = %name, "Recurring job already scheduled");
                        return Ok(job);
                    }
                }
            } else {
                self.discard_pending(&mut conn, &existing.next_id).await?;
            }
        }

        let job = self
            .schedule_occurrence(&mut conn, name, data, priority, pattern, Local::now())
            .await?
            .ok_or_else(|| SchedulerError::NoUpcomingRun {
                pattern: pattern.to_string(),
            })?;

        info!(
            queue = %self.name,
            job_name = %name,
            pattern = %pattern,
            next_run = ?job.ready_at,
            "Recurring job registered"
        );
        Ok(job)
    }

    /// Stop a recurring job; its pending occurrence is discarded
    pub async fn remove_repeatable(&self, name: &str) -> Result<bool> {
        let mut conn = self.probe.connection().await?;

        let existing: Option<String> = conn.hget(&self.keys.repeat, name).await?;
        let Some(existing) = existing else {
            return Ok(false);
        };
        let existing: RepeatDefinition = serde_json::from_str(&existing)?;

        self.discard_pending(&mut conn, &existing.next_id).await?;
        let _: () = conn.hdel(&self.keys.repeat, name).await?;
        Ok(true)
    }

    async fn discard_pending(&self, conn: &mut deadpool_redis::Connection, id: &str) -> Result<()> {
        let _: () = redis::pipe()
            .atomic()
            .zrem(&self.keys.delayed, id)
            .ignore()
            .zrem(&self.keys.wait, id)
            .ignore()
            .hdel(&self.keys.jobs, id)
            .ignore()
            .query_async(&mut **conn)
            .await?;
        Ok(())
    }

    /// Create the occurrence of a recurring job that follows `after`
    async fn schedule_occurrence<Tz: TimeZone>(
        &self,
        conn: &mut deadpool_redis::Connection,
        name: &str,
        data: serde_json::Value,
        priority: u32,
        pattern: &CronPattern,
        after: chrono::DateTime<Tz>,
    ) -> Result<Option<Job>> {
        let Some(run_at) = pattern.next_after(&after) else {
            return Ok(None);
        };
        let run_at = run_at.with_timezone(&Utc);
        let run_ms = run_at.timestamp_millis();
        let id = format!("repeat:{}:{}", name, run_ms);

        let seq = self.next_seq(conn).await?;
        let job = Job {
            id: id.clone(),
            queue: self.name.clone(),
            name: name.to_string(),
            data: data.clone(),
            opts: self.job_options(priority, Some(pattern.to_string())),
            state: JobState::Delayed,
            attempts_made: 0,
            seq,
            created_at: Utc::now(),
            ready_at: Some(run_at),
            processed_at: None,
            finished_at: None,
            failed_reason: None,
        };

        // HSETNX: concurrent schedulers racing for one occurrence create it once
        let raw = serde_json::to_string(&job)?;
        let created: bool = conn.hset_nx(&self.keys.jobs, &id, raw).await?;
        if created {
            let _: () = conn.zadd(&self.keys.delayed, &id, run_ms).await?;
        }

        let definition = RepeatDefinition {
            pattern: pattern.to_string(),
            data,
            priority,
            next_id: id.clone(),
        };
        let _: () = conn
            .hset(&self.keys.repeat, name, serde_json::to_string(&definition)?)
            .await?;

        if created {
            Ok(Some(job))
        } else {
            Ok(backend::load_job(conn, &self.keys, &id).await?)
        }
    }

    /// Take the next ready job, mark it active and lock it for `token`
    ///
    /// The lock expires after `lock_ttl` unless renewed with
    /// [`Queue::extend_lock`]; a job whose lock expires while it is active
    /// is picked up by [`Queue::recover_stalled`].
    pub async fn take_next(&self, token: &str, lock_ttl: Duration) -> Result<Option<Job>> {
        let mut conn = self.probe.connection().await?;

        backend::promote_due(&mut conn, &self.keys).await?;

        let Some(id) = backend::take_ready(&mut conn, &self.keys, token, lock_ttl).await? else {
            return Ok(None);
        };

        let Some(mut job) = backend::load_job(&mut conn, &self.keys, &id).await? else {
            warn!(queue = %self.name, job_id = %id, "Dequeued job has no record, dropping");
            let _: () = redis::pipe()
                .atomic()
                .srem(&self.keys.active, &id)
                .ignore()
                .del(self.keys.lock(&id))
                .ignore()
                .query_async(&mut *conn)
                .await?;
            return Ok(None);
        };

        job.state = JobState::Active;
        job.attempts_made += 1;
        job.processed_at = Some(Utc::now());
        backend::save_job(&mut conn, &self.keys, &job).await?;

        if job.attempts_made == 1 {
            self.schedule_next_repeat(&mut conn, &job).await;
        }

        Ok(Some(job))
    }

    /// Renew the lock `token` holds on an active job
    ///
    /// Returns `false` once the lock has been lost.
    pub async fn extend_lock(&self, job_id: &str, token: &str, lock_ttl: Duration) -> Result<bool> {
        let mut conn = self.probe.connection().await?;
        backend::extend_lock(&mut conn, &self.keys, job_id, token, lock_ttl).await
    }

    /// Queue the following occurrence when a recurring job starts
    async fn schedule_next_repeat(&self, conn: &mut deadpool_redis::Connection, job: &Job) {
        if !job.is_repeat() {
            return;
        }

        let result = async {
            let raw: Option<String> = conn.hget(&self.keys.repeat, &job.name).await?;
            let Some(raw) = raw else {
                // Removed since this occurrence was scheduled
                return Ok(None);
            };
            let definition: RepeatDefinition = serde_json::from_str(&raw)?;
            if definition.next_id != job.id {
                return Ok(None);
            }

            let pattern = CronPattern::parse(&definition.pattern)?;
            let after = job.ready_at.unwrap_or_else(Utc::now).max(Utc::now());
            self.schedule_occurrence(
                conn,
                &job.name,
                definition.data,
                definition.priority,
                &pattern,
                after.with_timezone(&Local),
            )
            .await
        }
        .await;

        match result {
            Ok(Some(next)) => {
                debug!(queue = %self.name, job_name = %job.name, next_run = ?next.ready_at, "Next occurrence scheduled");
            }
            Ok(None) => {}
            Err(e) => {
                warn!(queue = %self.name, job_name = %job.name, error = %e, "Failed to schedule next occurrence");
            }
        }
    }

    /// Record a successful run held under `token`
    pub async fn complete(&self, mut job: Job, token: &str) -> Result<()> {
        let mut conn = self.probe.connection().await?;
        let finished = Utc::now();

        job.state = JobState::Completed;
        job.finished_at = Some(finished);
        job.failed_reason = None;

        let keys = &self.keys;
        if !backend::finish(&mut conn, keys, &job, token, &keys.completed, finished.timestamp_millis()).await? {
            return Err(Error::lock_lost(&self.name, &job.id));
        }

        backend::prune(&mut conn, keys, &keys.completed, &job.opts.remove_on_complete).await?;
        Ok(())
    }

    /// Record a failed run held under `token`; retries with backoff while
    /// attempts remain
    ///
    /// Returns the state the job moved to.
    pub async fn fail(&self, mut job: Job, token: &str, reason: &str) -> Result<JobState> {
        let mut conn = self.probe.connection().await?;
        let keys = &self.keys;
        job.failed_reason = Some(reason.to_string());

        if job.can_retry() {
            let ready_ms = now_ms() + duration_ms(job.retry_delay());
            job.state = JobState::Delayed;
            job.ready_at = Utc.timestamp_millis_opt(ready_ms).single();

            if !backend::finish(&mut conn, keys, &job, token, &keys.delayed, ready_ms).await? {
                return Err(Error::lock_lost(&self.name, &job.id));
            }
            return Ok(JobState::Delayed);
        }

        let finished = Utc::now();
        job.state = JobState::Failed;
        job.finished_at = Some(finished);

        if !backend::finish(&mut conn, keys, &job, token, &keys.failed, finished.timestamp_millis()).await? {
            return Err(Error::lock_lost(&self.name, &job.id));
        }

        backend::prune(&mut conn, keys, &keys.failed, &job.opts.remove_on_fail).await?;
        Ok(JobState::Failed)
    }

    /// Return active jobs whose worker lock expired to the queue
    ///
    /// A job with attempts left goes back to waiting; one that has used them
    /// all is failed. Returns the recovered job ids with their new state.
    pub async fn recover_stalled(&self) -> Result<Vec<(String, JobState)>> {
        let mut conn = self.probe.connection().await?;
        let keys = &self.keys;

        let active: Vec<String> = conn.smembers(&keys.active).await?;
        let mut recovered = Vec::new();

        for id in active {
            let locked: bool = conn.exists(keys.lock(&id)).await?;
            if locked {
                continue;
            }

            let Some(mut job) = backend::load_job(&mut conn, keys, &id).await? else {
                let _: () = conn.srem(&keys.active, &id).await?;
                continue;
            };

            job.failed_reason = Some(STALLED_REASON.to_string());
            let moved = if job.can_retry() {
                job.state = JobState::Waiting;
                backend::recover(&mut conn, keys, &job, &keys.wait, job.wait_score()).await?
            } else {
                let finished = Utc::now();
                job.state = JobState::Failed;
                job.finished_at = Some(finished);
                let moved = backend::recover(&mut conn, keys, &job, &keys.failed, finished.timestamp_millis() as f64).await?;
                if moved {
                    backend::prune(&mut conn, keys, &keys.failed, &job.opts.remove_on_fail).await?;
                }
                moved
            };

            if moved {
                warn!(
                    queue = %self.name,
                    job_id = %id,
                    attempt = job.attempts_made,
                    state = ?job.state,
                    "Recovered stalled job"
                );
                recovered.push((id, job.state));
            }
        }

        Ok(recovered)
    }

    /// Job counts by state
    pub async fn counts(&self) -> Result<JobCounts> {
        let mut conn = self.probe.connection().await?;

        let (waiting, delayed, active, completed, failed): (u64, u64, u64, u64, u64) = redis::pipe()
            .zcard(&self.keys.wait)
            .zcard(&self.keys.delayed)
            .scard(&self.keys.active)
            .zcard(&self.keys.completed)
            .zcard(&self.keys.failed)
            .query_async(&mut *conn)
            .await?;

        Ok(JobCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }

    /// Look up a job by id
    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let mut conn = self.probe.connection().await?;
        backend::load_job(&mut conn, &self.keys, id).await
    }

    /// Most recently failed jobs, newest first
    pub async fn failed_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.probe.connection().await?;
        let ids: Vec<String> = conn
            .zrevrange(&self.keys.failed, 0, limit as isize - 1)
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = backend::load_job(&mut conn, &self.keys, &id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Number of workers with a live heartbeat on this queue
    pub async fn worker_count(&self) -> Result<usize> {
        let mut conn = self.probe.connection().await?;
        let pattern = format!("{}:*", self.keys.workers);
        let mut cursor: u64 = 0;
        let mut count = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut *conn)
                .await?;
            count += batch.len();
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(count)
    }

    /// Stop accepting new jobs
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(queue = %self.name, "Queue closed");
        }
    }
}

/// The six recurring-job queues with their workers
pub struct QueueRegistry {
    queues: Vec<(&'static JobDefinition, Arc<Queue>)>,
    workers: tokio::sync::Mutex<Vec<Worker>>,
}

impl QueueRegistry {
    /// Create all six queues, `None` when the store is unavailable
    pub fn connect(probe: &Arc<StoreProbe>, options: &QueueOptions) -> Option<Self> {
        let mut queues = Vec::with_capacity(JobKind::ALL.len());
        for kind in JobKind::ALL {
            let definition = kind.definition();
            let queue = create_queue(probe, definition.queue, options.clone())?;
            queues.push((definition, queue));
        }

        Some(Self {
            queues,
            workers: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn queue(&self, name: &str) -> Option<&Arc<Queue>> {
        self.queues
            .iter()
            .find(|(definition, _)| definition.queue == name)
            .map(|(_, queue)| queue)
    }

    pub fn queues(&self) -> impl Iterator<Item = &Arc<Queue>> {
        self.queues.iter().map(|(_, queue)| queue)
    }

    /// Track a worker so it is closed with the registry
    pub async fn attach(&self, worker: Worker) {
        self.workers.lock().await.push(worker);
    }

    pub async fn worker_handles(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Counts for every queue
    pub async fn counts(&self) -> Vec<(String, Result<JobCounts>)> {
        let mut out = Vec::with_capacity(self.queues.len());
        for (_, queue) in &self.queues {
            out.push((queue.name().to_string(), queue.counts().await));
        }
        out
    }

    /// Close workers first, then queues
    pub async fn close_all(&self) {
        let workers: Vec<Worker> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            worker.close().await;
        }

        for (_, queue) in &self.queues {
            queue.close();
        }
        info!("All queues closed");
    }
}

#[async_trait]
impl RecurringJobRegistrar for QueueRegistry {
    async fn register(&self, definition: &JobDefinition) -> Result<()> {
        let queue = self
            .queue(definition.queue)
            .ok_or_else(|| SchedulerError::registration(definition.queue, "queue not created"))?;
        let pattern = CronPattern::parse(definition.pattern)?;

        queue
            .add_repeatable(
                definition.job_name,
                serde_json::json!({}),
                definition.priority,
                &pattern,
            )
            .await?;
        Ok(())
    }

    async fn worker_count(&self) -> Option<usize> {
        let mut total = 0;
        for (_, queue) in &self.queues {
            match queue.worker_count().await {
                Ok(count) => total += count,
                Err(e) => {
                    debug!(queue = %queue.name(), error = %e, "Worker heartbeat check failed");
                    return None;
                }
            }
        }
        Some(total)
    }

    async fn close(&self) {
        self.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_queue_without_store_is_none() {
        let probe = Arc::new(StoreProbe::disabled("redlead"));
        assert!(create_queue(&probe, "lead-discovery", QueueOptions::default()).is_none());
        assert!(QueueRegistry::connect(&probe, &QueueOptions::default()).is_none());
    }

    #[test]
    fn test_default_options() {
        let options = QueueOptions::default();
        assert_eq!(options.attempts, 3);
        assert_eq!(options.backoff, Duration::from_secs(1));
        assert_eq!(options.remove_on_complete.count, 100);
        assert_eq!(options.remove_on_fail.count, 500);
        assert_eq!(options.remove_on_fail.max_age, None);
    }
}
