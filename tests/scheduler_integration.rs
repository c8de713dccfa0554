//! Integration tests for scheduler mode selection and the cron fallback
//!
//! These tests verify:
//! - Queue and cron modes never run together
//! - All six recurring jobs are armed with their patterns
//! - A failing job keeps firing on schedule
//! - Overlap policy for slow runs

mod common;

use chrono::{Local, TimeZone};
use common::{counting_handlers, CallCounts, RecordingRegistrar};
use redlead::jobs::{JobHandlers, JobKind};
use redlead::scheduler::{
    start_with, Clock, CronScheduler, OverlapPolicy, RecurringJobRegistrar, SchedulerMode,
    TriggerOutcome,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn anchor() -> Clock {
    Clock::anchored(Local.with_ymd_and_hms(2026, 1, 15, 10, 0, 30).single().unwrap())
}

// ============================================================================
// Mode Exclusivity
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_queue_mode_arms_no_timers() {
    let counts = CallCounts::default();
    let registrar = Arc::new(RecordingRegistrar::default());

    let handle = start_with(
        SchedulerMode::Queue,
        Some(registrar.clone() as Arc<dyn RecurringJobRegistrar>),
        &counting_handlers(&counts, &[]),
        OverlapPolicy::Allow,
    )
    .await
    .unwrap();

    assert_eq!(handle.mode(), SchedulerMode::Queue);
    assert!(handle.armed_timers().is_empty());
    assert_eq!(handle.registered_jobs().len(), 6);
    assert_eq!(registrar.attempts(), 6);
    assert_eq!(
        registrar.queues(),
        vec![
            "lead-discovery",
            "subreddit-analysis",
            "reply-tracking",
            "performance-tracking",
            "market-insight",
            "trial-expiration",
        ]
    );

    // Nothing runs in process
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(counts.total(), 0);

    handle.shutdown().await;
    assert!(registrar.closed.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_cron_mode_registers_nothing() {
    let counts = CallCounts::default();
    let registrar = Arc::new(RecordingRegistrar::default());

    let handle = start_with(
        SchedulerMode::Cron,
        Some(registrar.clone() as Arc<dyn RecurringJobRegistrar>),
        &counting_handlers(&counts, &[]),
        OverlapPolicy::Allow,
    )
    .await
    .unwrap();

    assert_eq!(handle.mode(), SchedulerMode::Cron);
    assert_eq!(handle.armed_timers().len(), 6);
    assert!(handle.registered_jobs().is_empty());
    assert_eq!(registrar.attempts(), 0);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_queue_mode_without_queues_falls_back_to_cron() {
    let counts = CallCounts::default();

    let handle = start_with(
        SchedulerMode::Queue,
        None,
        &counting_handlers(&counts, &[]),
        OverlapPolicy::Allow,
    )
    .await
    .unwrap();

    assert_eq!(handle.mode(), SchedulerMode::Cron);
    assert_eq!(handle.armed_timers().len(), 6);
    handle.shutdown().await;
}

// ============================================================================
// Cron Fallback
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_six_timers_with_expected_schedules() {
    let counts = CallCounts::default();
    let scheduler =
        CronScheduler::start_with_clock(&counting_handlers(&counts, &[]), OverlapPolicy::Allow, anchor())
            .unwrap();

    let at = |h, m| Local.with_ymd_and_hms(2026, 1, 15, h, m, 0).single();
    let tomorrow = |h, m| Local.with_ymd_and_hms(2026, 1, 16, h, m, 0).single();

    let timers = scheduler.armed_timers();
    let by_kind = |kind| timers.iter().find(|t| t.kind == kind).unwrap();

    assert_eq!(by_kind(JobKind::LeadDiscovery).pattern, "*/15 * * * *");
    assert_eq!(by_kind(JobKind::LeadDiscovery).next_run, at(10, 15));

    assert_eq!(by_kind(JobKind::SubredditAnalysis).pattern, "0 2 * * *");
    assert_eq!(by_kind(JobKind::SubredditAnalysis).next_run, tomorrow(2, 0));

    assert_eq!(by_kind(JobKind::ReplyTracking).pattern, "* * * * *");
    assert_eq!(by_kind(JobKind::ReplyTracking).next_run, at(10, 1));

    assert_eq!(by_kind(JobKind::PerformanceTracking).pattern, "0 * * * *");
    assert_eq!(by_kind(JobKind::PerformanceTracking).next_run, at(11, 0));

    assert_eq!(by_kind(JobKind::MarketInsight).pattern, "5 * * * *");
    assert_eq!(by_kind(JobKind::MarketInsight).next_run, at(10, 5));

    assert_eq!(by_kind(JobKind::TrialExpiration).pattern, "0 3 * * *");
    assert_eq!(by_kind(JobKind::TrialExpiration).next_run, tomorrow(3, 0));

    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failing_reply_tracker_keeps_firing() {
    let counts = CallCounts::default();
    let scheduler = CronScheduler::start_with_clock(
        &counting_handlers(&counts, &[JobKind::ReplyTracking]),
        OverlapPolicy::Allow,
        anchor(),
    )
    .unwrap();

    // 10:00:30 -> 10:03:50 crosses 10:01, 10:02 and 10:03
    tokio::time::sleep(Duration::from_secs(200)).await;

    assert_eq!(counts.get(JobKind::ReplyTracking), 3);
    assert_eq!(counts.total(), 3);

    // Through 10:15:30, adding market insight at 10:05 and lead discovery at 10:15
    tokio::time::sleep(Duration::from_secs(700)).await;
    assert_eq!(counts.get(JobKind::ReplyTracking), 15);
    assert_eq!(counts.get(JobKind::MarketInsight), 1);
    assert_eq!(counts.get(JobKind::LeadDiscovery), 1);

    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_disarms_timers() {
    let counts = CallCounts::default();
    let scheduler =
        CronScheduler::start_with_clock(&counting_handlers(&counts, &[]), OverlapPolicy::Allow, anchor())
            .unwrap();

    scheduler.shutdown().await;
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(counts.total(), 0);
}

// ============================================================================
// Overlap Policy
// ============================================================================

/// Handlers whose reply-tracking run blocks until released
fn blocking_handlers(release: Arc<Notify>, counts: &CallCounts) -> JobHandlers {
    let mut handlers = counting_handlers(counts, &[]);
    let counts = counts.clone();
    handlers = handlers.with(JobKind::ReplyTracking, move || {
        let release = Arc::clone(&release);
        let counts = counts.clone();
        async move {
            counts.record(JobKind::ReplyTracking);
            release.notified().await;
            Ok::<_, anyhow::Error>(())
        }
    });
    handlers
}

#[tokio::test(start_paused = true)]
async fn test_skip_if_running_drops_overlapping_trigger() {
    let counts = CallCounts::default();
    let release = Arc::new(Notify::new());
    let scheduler = CronScheduler::start_with_clock(
        &blocking_handlers(Arc::clone(&release), &counts),
        OverlapPolicy::SkipIfRunning,
        anchor(),
    )
    .unwrap();

    let slow = scheduler.trigger(JobKind::ReplyTracking);
    let overlapping = async {
        tokio::task::yield_now().await;
        let outcome = scheduler.trigger(JobKind::ReplyTracking).await;
        release.notify_one();
        outcome
    };
    let (first, second) = tokio::join!(slow, overlapping);

    assert_eq!(first, TriggerOutcome::Completed);
    assert_eq!(second, TriggerOutcome::Skipped);
    assert_eq!(counts.get(JobKind::ReplyTracking), 1);
    assert_eq!(scheduler.in_flight(JobKind::ReplyTracking), 0);

    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_allow_runs_overlapping_triggers() {
    let counts = CallCounts::default();
    let release = Arc::new(Notify::new());
    let scheduler = CronScheduler::start_with_clock(
        &blocking_handlers(Arc::clone(&release), &counts),
        OverlapPolicy::Allow,
        anchor(),
    )
    .unwrap();

    let first = scheduler.trigger(JobKind::ReplyTracking);
    let second = async {
        tokio::task::yield_now().await;
        assert_eq!(scheduler.in_flight(JobKind::ReplyTracking), 1);
        let outcome = scheduler.trigger(JobKind::ReplyTracking);
        let release = Arc::clone(&release);
        let releaser = async move {
            tokio::task::yield_now().await;
            release.notify_waiters();
        };
        tokio::join!(outcome, releaser).0
    };
    let (a, b) = tokio::join!(first, second);

    assert_eq!(a, TriggerOutcome::Completed);
    assert_eq!(b, TriggerOutcome::Completed);
    assert_eq!(counts.get(JobKind::ReplyTracking), 2);

    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failing_trigger_reports_failure() {
    let counts = CallCounts::default();
    let scheduler = CronScheduler::start_with_clock(
        &counting_handlers(&counts, &[JobKind::TrialExpiration]),
        OverlapPolicy::Allow,
        anchor(),
    )
    .unwrap();

    assert_eq!(scheduler.trigger(JobKind::TrialExpiration).await, TriggerOutcome::Failed);
    assert_eq!(scheduler.trigger(JobKind::MarketInsight).await, TriggerOutcome::Completed);

    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_panicking_job_does_not_stop_timer() {
    let counts = CallCounts::default();
    let mut handlers = counting_handlers(&counts, &[]);
    let seen = counts.clone();
    handlers = handlers.with(JobKind::ReplyTracking, move || {
        let seen = seen.clone();
        async move {
            seen.record(JobKind::ReplyTracking);
            if seen.get(JobKind::ReplyTracking) > 0 {
                panic!("reply tracker crashed");
            }
            Ok::<_, anyhow::Error>(())
        }
    });

    let scheduler =
        CronScheduler::start_with_clock(&handlers, OverlapPolicy::Allow, anchor()).unwrap();

    tokio::time::sleep(Duration::from_secs(140)).await;
    assert_eq!(counts.get(JobKind::ReplyTracking), 2);

    scheduler.shutdown().await;
}
