//! Queue and worker behavior against a live Redis
//!
//! Run with `REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`.
//! Every test writes under its own key prefix and removes it afterwards.

use redlead::config::StoreConfig;
use redlead::jobs::{JobKind, JOB_DEFINITIONS};
use redlead::queue::{
    create_queue, create_worker, Job, JobState, KeepJobs, Queue, QueueOptions, QueueRegistry,
    WorkerOptions, STALLED_REASON,
};
use redlead::scheduler::{CronPattern, RecurringJobRegistrar};
use redlead::store::StoreProbe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn probe() -> Arc<StoreProbe> {
    let config = StoreConfig {
        url: Some(std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into())),
        key_prefix: format!("redlead-test-{}", uuid::Uuid::new_v4()),
        ..StoreConfig::default()
    };
    let probe = Arc::new(StoreProbe::initialize(&config).await);
    assert!(probe.is_available(), "Redis is not reachable");
    probe
}

async fn cleanup(probe: &StoreProbe) {
    let mut conn = probe.connection().await.unwrap();
    let keys: Vec<String> = redis::cmd("KEYS")
        .arg(format!("{}:*", probe.key_prefix()))
        .query_async(&mut *conn)
        .await
        .unwrap();
    if !keys.is_empty() {
        let _: () = redis::cmd("DEL").arg(keys).query_async(&mut *conn).await.unwrap();
    }
}

fn fast_worker() -> WorkerOptions {
    WorkerOptions {
        concurrency: 1,
        poll_interval: Duration::from_millis(20),
        ..WorkerOptions::default()
    }
}

/// Poll `queue` until `done` holds or five seconds pass
async fn wait_for(queue: &Queue, done: impl Fn(&redlead::queue::JobCounts) -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let counts = queue.counts().await.unwrap();
        if done(&counts) {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out at {counts:?}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
#[ignore = "Requires running Redis"]
async fn test_jobs_processed_by_priority_then_fifo() {
    let probe = probe().await;
    let queue = create_queue(&probe, "lead-discovery", QueueOptions::default()).unwrap();

    queue.add("low", serde_json::json!({}), 4).await.unwrap();
    queue.add("high", serde_json::json!({}), 1).await.unwrap();
    queue.add("mid-a", serde_json::json!({}), 2).await.unwrap();
    queue.add("mid-b", serde_json::json!({}), 2).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let worker = create_worker(
        &probe,
        "lead-discovery",
        Arc::new(move |job: Job| {
            recorder.lock().unwrap().push(job.name.clone());
            async { Ok::<_, anyhow::Error>(()) }
        }),
        fast_worker(),
    )
    .unwrap();

    wait_for(&queue, |c| c.completed == 4).await;
    worker.close().await;

    assert_eq!(*seen.lock().unwrap(), vec!["high", "mid-a", "mid-b", "low"]);
    let counts = queue.counts().await.unwrap();
    assert_eq!((counts.waiting, counts.active, counts.failed), (0, 0, 0));

    cleanup(&probe).await;
}

#[tokio::test]
#[ignore = "Requires running Redis"]
async fn test_failing_job_retries_then_lands_in_failed_set() {
    let probe = probe().await;
    let options = QueueOptions {
        attempts: 3,
        backoff: Duration::from_millis(50),
        ..QueueOptions::default()
    };
    let queue = create_queue(&probe, "reply-tracking", options).unwrap();
    let job = queue.add("track-pending-replies", serde_json::json!({}), 2).await.unwrap();

    let worker = create_worker(
        &probe,
        "reply-tracking",
        Arc::new(|_job: Job| async { Err::<(), _>(anyhow::anyhow!("reddit unavailable")) }),
        fast_worker(),
    )
    .unwrap();

    wait_for(&queue, |c| c.failed == 1).await;
    worker.close().await;

    let failed = queue.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.attempts_made, 3);
    assert!(failed
        .failed_reason
        .as_deref()
        .unwrap_or_default()
        .contains("reddit unavailable"));

    let listed = queue.failed_jobs(10).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, job.id);

    cleanup(&probe).await;
}

#[tokio::test]
#[ignore = "Requires running Redis"]
async fn test_panicking_processor_fails_the_job_not_the_worker() {
    let probe = probe().await;
    let options = QueueOptions {
        attempts: 1,
        ..QueueOptions::default()
    };
    let queue = create_queue(&probe, "market-insight", options).unwrap();
    queue.add("boom", serde_json::json!({}), 3).await.unwrap();
    queue.add("fine", serde_json::json!({}), 3).await.unwrap();

    let worker = create_worker(
        &probe,
        "market-insight",
        Arc::new(|job: Job| async move {
            if job.name == "boom" {
                panic!("processor crashed");
            }
            Ok::<_, anyhow::Error>(())
        }),
        fast_worker(),
    )
    .unwrap();

    wait_for(&queue, |c| c.failed == 1 && c.completed == 1).await;
    worker.close().await;

    cleanup(&probe).await;
}

#[tokio::test]
#[ignore = "Requires running Redis"]
async fn test_completed_retention_by_count() {
    let probe = probe().await;
    let options = QueueOptions {
        remove_on_complete: KeepJobs {
            count: 2,
            max_age: None,
        },
        ..QueueOptions::default()
    };
    let queue = create_queue(&probe, "performance-tracking", options).unwrap();
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(queue.add(&format!("run-{i}"), serde_json::json!({}), 4).await.unwrap().id);
    }

    let worker = create_worker(
        &probe,
        "performance-tracking",
        Arc::new(|_job: Job| async { Ok::<_, anyhow::Error>(()) }),
        fast_worker(),
    )
    .unwrap();

    wait_for(&queue, |c| c.waiting == 0 && c.active == 0 && c.completed <= 2).await;
    worker.close().await;

    // Oldest completions are pruned along with their job records
    assert!(queue.get_job(&ids[0]).await.unwrap().is_none());
    assert!(queue.get_job(&ids[4]).await.unwrap().is_some());

    cleanup(&probe).await;
}

#[tokio::test]
#[ignore = "Requires running Redis"]
async fn test_add_repeatable_is_idempotent() {
    let probe = probe().await;
    let queue = create_queue(&probe, "trial-expiration", QueueOptions::default()).unwrap();
    let daily = CronPattern::parse("0 3 * * *").unwrap();

    let first = queue
        .add_repeatable("expire-trials", serde_json::json!({}), 4, &daily)
        .await
        .unwrap();
    let again = queue
        .add_repeatable("expire-trials", serde_json::json!({}), 4, &daily)
        .await
        .unwrap();

    assert_eq!(first.id, again.id);
    assert_eq!(first.state, JobState::Delayed);
    assert_eq!(first.opts.repeat.as_deref(), Some("0 3 * * *"));
    assert_eq!(queue.counts().await.unwrap().delayed, 1);

    // A changed pattern replaces the pending occurrence
    let later = CronPattern::parse("30 3 * * *").unwrap();
    let replaced = queue
        .add_repeatable("expire-trials", serde_json::json!({}), 4, &later)
        .await
        .unwrap();
    assert_ne!(replaced.id, first.id);
    assert_eq!(queue.counts().await.unwrap().delayed, 1);

    assert!(queue.remove_repeatable("expire-trials").await.unwrap());
    assert!(!queue.remove_repeatable("expire-trials").await.unwrap());
    assert_eq!(queue.counts().await.unwrap().delayed, 0);

    cleanup(&probe).await;
}

#[tokio::test]
#[ignore = "Requires running Redis"]
async fn test_registry_registers_all_jobs_once() {
    let probe = probe().await;
    let registry = QueueRegistry::connect(&probe, &QueueOptions::default()).unwrap();

    for _ in 0..2 {
        for definition in &JOB_DEFINITIONS {
            registry.register(definition).await.unwrap();
        }
    }

    for (name, counts) in registry.counts().await {
        let counts = counts.unwrap();
        assert_eq!(counts.delayed, 1, "{name}");
        assert_eq!(counts.waiting, 0, "{name}");
    }

    assert_eq!(registry.worker_count().await, Some(0));

    let worker = create_worker(
        &probe,
        JobKind::ReplyTracking.queue_name(),
        Arc::new(|_job: Job| async { Ok::<_, anyhow::Error>(()) }),
        fast_worker(),
    )
    .unwrap();
    registry.attach(worker).await;

    // First heartbeat is written as the worker starts
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(registry.worker_count().await, Some(1));

    registry.close_all().await;
    assert_eq!(registry.worker_count().await, Some(0));
    assert!(registry.queues().all(|queue| queue.is_closed()));

    let closed = registry.queue("reply-tracking").unwrap();
    assert!(closed.add("late", serde_json::json!({}), 2).await.is_err());

    cleanup(&probe).await;
}

#[tokio::test]
#[ignore = "Requires running Redis"]
async fn test_job_of_dead_worker_is_recovered_and_rerun() {
    let probe = probe().await;
    let queue = create_queue(&probe, "lead-discovery", QueueOptions::default()).unwrap();
    let added = queue.add("discover-leads", serde_json::json!({}), 2).await.unwrap();

    // Taken by a worker that never reports back
    let taken = queue
        .take_next("dead-worker", Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(taken.id, added.id);
    assert_eq!(queue.counts().await.unwrap().active, 1);

    // Still locked
    assert!(queue.recover_stalled().await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(200)).await;
    let recovered = queue.recover_stalled().await.unwrap();
    assert_eq!(recovered, vec![(added.id.clone(), JobState::Waiting)]);

    let counts = queue.counts().await.unwrap();
    assert_eq!((counts.waiting, counts.active), (1, 0));
    let record = queue.get_job(&added.id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Waiting);
    assert_eq!(record.failed_reason.as_deref(), Some(STALLED_REASON));

    // A late report from the dead worker changes nothing
    assert!(queue.complete(taken, "dead-worker").await.is_err());
    assert_eq!(queue.counts().await.unwrap().completed, 0);

    let worker = create_worker(
        &probe,
        "lead-discovery",
        Arc::new(|_job: Job| async { Ok::<_, anyhow::Error>(()) }),
        fast_worker(),
    )
    .unwrap();
    wait_for(&queue, |c| c.completed == 1).await;
    worker.close().await;

    let record = queue.get_job(&added.id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Completed);
    assert_eq!(record.attempts_made, 2);

    cleanup(&probe).await;
}

#[tokio::test]
#[ignore = "Requires running Redis"]
async fn test_stalled_job_without_attempts_left_fails() {
    let probe = probe().await;
    let options = QueueOptions {
        attempts: 1,
        ..QueueOptions::default()
    };
    let queue = create_queue(&probe, "market-insight", options).unwrap();
    let added = queue.add("generate-insights", serde_json::json!({}), 3).await.unwrap();

    queue
        .take_next("dead-worker", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let recovered = queue.recover_stalled().await.unwrap();
    assert_eq!(recovered, vec![(added.id.clone(), JobState::Failed)]);

    let counts = queue.counts().await.unwrap();
    assert_eq!((counts.waiting, counts.active, counts.failed), (0, 0, 1));
    let failed = queue.failed_jobs(10).await.unwrap();
    assert_eq!(failed[0].id, added.id);
    assert_eq!(failed[0].failed_reason.as_deref(), Some(STALLED_REASON));

    cleanup(&probe).await;
}

#[tokio::test]
#[ignore = "Requires running Redis"]
async fn test_retry_is_promoted_once_when_due() {
    let probe = probe().await;
    let options = QueueOptions {
        attempts: 3,
        backoff: Duration::from_millis(50),
        ..QueueOptions::default()
    };
    let queue = create_queue(&probe, "reply-tracking", options).unwrap();
    let added = queue.add("track-pending-replies", serde_json::json!({}), 2).await.unwrap();

    let lock = Duration::from_secs(5);
    let job = queue.take_next("worker-a", lock).await.unwrap().unwrap();

    // Only the lock holder may report
    assert!(queue.fail(job.clone(), "worker-b", "not mine").await.is_err());
    assert_eq!(queue.fail(job, "worker-a", "reddit unavailable").await.unwrap(), JobState::Delayed);
    assert_eq!(queue.counts().await.unwrap().delayed, 1);

    // Not due yet
    assert!(queue.take_next("worker-b", lock).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let (first, second) = tokio::join!(queue.take_next("worker-a", lock), queue.take_next("worker-b", lock));
    let taken: Vec<Job> = [first.unwrap(), second.unwrap()].into_iter().flatten().collect();
    assert_eq!(taken.len(), 1);
    assert_eq!(taken[0].id, added.id);
    assert_eq!(taken[0].attempts_made, 2);

    let counts = queue.counts().await.unwrap();
    assert_eq!((counts.waiting, counts.delayed, counts.active), (0, 0, 1));

    cleanup(&probe).await;
}
