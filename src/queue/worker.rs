//! Queue workers
//!
//! A worker polls one queue, runs up to `concurrency` jobs at a time and
//! reports each outcome back to the queue. Job bodies run in their own task,
//! so a panicking processor fails the job instead of killing the worker.
//! A heartbeat key with a TTL advertises the worker while it is alive.
//!
//! Each job taken is locked under the worker id and the lock is renewed
//! while the job runs. When a worker dies, or cannot record an outcome, the
//! lock runs out and the stalled sweep of any live worker puts the job back.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{Job, JobState, Queue, QueueOptions};
use crate::metrics;
use crate::utils::deadline_after;
use crate::store::StoreProbe;

/// Longest job lock the store is asked to hold
const MAX_LOCK_DURATION: Duration = Duration::from_secs(24 * 3600);

/// Processes one job taken from a queue
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> JobProcessor for F
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn process(&self, job: &Job) -> anyhow::Result<()> {
        (self)(job.clone()).await
    }
}

/// Worker tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Jobs processed at once
    pub concurrency: usize,
    /// Sleep between polls of an empty queue
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Expiry of the heartbeat key; a crashed worker disappears after this
    pub heartbeat_ttl: Duration,
    /// Expiry of a job lock, renewed at half this while the job runs
    pub lock_duration: Duration,
    /// Time between sweeps for jobs whose lock expired
    pub stalled_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_ttl: Duration::from_secs(30),
            lock_duration: Duration::from_secs(30),
            stalled_interval: Duration::from_secs(30),
        }
    }
}

/// A running worker attached to one queue
pub struct Worker {
    id: String,
    queue: Arc<Queue>,
    probe: Arc<StoreProbe>,
    concurrency: u32,
    semaphore: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    poll_handle: JoinHandle<()>,
    heartbeat_handle: JoinHandle<()>,
    stalled_handle: JoinHandle<()>,
}

/// Start a worker on queue `name`, `None` when the store is unavailable
pub fn create_worker(
    probe: &Arc<StoreProbe>,
    name: &str,
    processor: Arc<dyn JobProcessor>,
    options: WorkerOptions,
) -> Option<Worker> {
    if !probe.is_available() {
        debug!(queue = %name, "Store unavailable, worker not created");
        return None;
    }

    let queue = Arc::new(Queue::new(Arc::clone(probe), name, QueueOptions::default()));
    let id = uuid::Uuid::new_v4().to_string();
    let concurrency = options.concurrency.clamp(1, u32::MAX as usize) as u32;
    let semaphore = Arc::new(Semaphore::new(concurrency as usize));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let lock = JobLock {
        token: id.clone(),
        ttl: options.lock_duration.clamp(Duration::from_millis(2), MAX_LOCK_DURATION),
    };

    let poll_handle = tokio::spawn(poll_loop(
        Arc::clone(&queue),
        processor,
        Arc::clone(&semaphore),
        lock,
        options.poll_interval,
        shutdown_rx.clone(),
    ));

    let stalled_handle = tokio::spawn(stalled_loop(
        Arc::clone(&queue),
        options.stalled_interval.max(Duration::from_millis(1)),
        shutdown_rx.clone(),
    ));

    let heartbeat_handle = tokio::spawn(heartbeat_loop(
        Arc::clone(probe),
        queue.keys().worker(&id),
        options.heartbeat_interval,
        options.heartbeat_ttl,
        shutdown_rx,
    ));

    info!(queue = %name, worker_id = %id, concurrency, "Worker started");

    Some(Worker {
        id,
        queue,
        probe: Arc::clone(probe),
        concurrency,
        semaphore,
        shutdown_tx,
        poll_handle,
        heartbeat_handle,
        stalled_handle,
    })
}

impl Worker {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    /// Stop polling, wait for in-flight jobs and remove the heartbeat
    pub async fn close(self) {
        let _ = self.shutdown_tx.send(true);

        if let Err(e) = self.poll_handle.await {
            error!(queue = %self.queue.name(), error = %e, "Worker poll loop panicked");
        }

        // Every permit back means every spawned job has reported
        match self.semaphore.acquire_many(self.concurrency).await {
            Ok(permits) => permits.forget(),
            Err(e) => warn!(queue = %self.queue.name(), error = %e, "Worker semaphore closed early"),
        }

        let _ = self.heartbeat_handle.await;
        let _ = self.stalled_handle.await;

        let key = self.queue.keys().worker(&self.id);
        match self.probe.connection().await {
            Ok(mut conn) => {
                let removed: redis::RedisResult<()> = conn.del(&key).await;
                if let Err(e) = removed {
                    debug!(key = %key, error = %e, "Failed to remove worker heartbeat");
                }
            }
            Err(e) => debug!(error = %e, "No connection to remove worker heartbeat"),
        }

        info!(queue = %self.queue.name(), worker_id = %self.id, "Worker closed");
    }
}

/// Lock held on each job this worker runs
#[derive(Debug, Clone)]
struct JobLock {
    token: String,
    ttl: Duration,
}

async fn poll_loop(
    queue: Arc<Queue>,
    processor: Arc<dyn JobProcessor>,
    semaphore: Arc<Semaphore>,
    lock: JobLock,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let permit = tokio::select! {
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };

        let idle = match queue.take_next(&lock.token, lock.ttl).await {
            Ok(Some(job)) => {
                let queue = Arc::clone(&queue);
                let processor = Arc::clone(&processor);
                let lock = lock.clone();
                tokio::spawn(async move {
                    process_job(&queue, processor, &lock, job).await;
                    drop(permit);
                });
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(queue = %queue.name(), error = %e, "Failed to fetch next job");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => break,
            }
        }
    }

    debug!(queue = %queue.name(), "Worker poll loop stopped");
}

async fn process_job(queue: &Queue, processor: Arc<dyn JobProcessor>, lock: &JobLock, job: Job) {
    let _active = metrics::track_active_job(&job.queue);
    let started = Instant::now();

    info!(
        queue = %job.queue,
        job_id = %job.id,
        job_name = %job.name,
        attempt = job.attempts_made,
        "Processing job"
    );

    let task_job = job.clone();
    let mut task = tokio::spawn(async move { processor.process(&task_job).await });

    let mut renew = tokio::time::interval_at(deadline_after(lock.ttl / 2), lock.ttl / 2);
    let outcome = loop {
        tokio::select! {
            outcome = &mut task => break outcome,
            _ = renew.tick() => match queue.extend_lock(&job.id, &lock.token, lock.ttl).await {
                Ok(true) => {}
                Ok(false) => warn!(queue = %job.queue, job_id = %job.id, "Job lock lost while running"),
                Err(e) => debug!(queue = %job.queue, job_id = %job.id, error = %e, "Failed to renew job lock"),
            },
        }
    };
    let result = match outcome {
        Ok(result) => result,
        Err(e) => Err(anyhow::anyhow!("job task aborted: {e}")),
    };

    let elapsed = started.elapsed();
    let duration_ms = elapsed.as_millis() as u64;

    match result {
        Ok(()) => {
            metrics::record_job(&job.queue, "completed", elapsed.as_secs_f64());
            info!(
                queue = %job.queue,
                job_id = %job.id,
                duration_ms,
                "Job completed successfully"
            );
            let id = job.id.clone();
            // On error the lock runs out and the stalled sweep takes the job back
            if let Err(e) = queue.complete(job, &lock.token).await {
                error!(queue = %queue.name(), job_id = %id, error = %e, "Failed to record job completion");
            }
        }
        Err(e) => {
            metrics::record_job(&job.queue, "failed", elapsed.as_secs_f64());
            error!(
                queue = %job.queue,
                job_id = %job.id,
                attempt = job.attempts_made,
                max_attempts = job.opts.attempts,
                duration_ms,
                error = %format!("{e:#}"),
                "Job failed"
            );
            let id = job.id.clone();
            match queue.fail(job, &lock.token, &format!("{e:#}")).await {
                Ok(JobState::Delayed) => debug!(queue = %queue.name(), job_id = %id, "Job scheduled for retry"),
                Ok(_) => warn!(queue = %queue.name(), job_id = %id, "Job exhausted its attempts"),
                Err(e) => error!(queue = %queue.name(), job_id = %id, error = %e, "Failed to record job failure"),
            }
        }
    }
}

async fn stalled_loop(queue: Arc<Queue>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = queue.recover_stalled().await {
                    debug!(queue = %queue.name(), error = %e, "Stalled job sweep failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn heartbeat_loop(
    probe: Arc<StoreProbe>,
    key: String,
    interval: Duration,
    ttl: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    let ttl_secs = ttl.as_secs().max(1);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let beat = async {
                    let mut conn = probe.connection().await?;
                    let _: () = conn.set_ex(&key, chrono::Utc::now().timestamp(), ttl_secs).await?;
                    Ok::<_, crate::error::Error>(())
                };
                if let Err(e) = beat.await {
                    debug!(key = %key, error = %e, "Worker heartbeat failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
