//! In-process cron timers
//!
//! Used when the backing store is unavailable or queue mode is disabled. One
//! task per recurring job sleeps until the next matching minute, then runs
//! the job's handler directly. A failing or panicking handler is logged and
//! never stops its timer.

use chrono::{DateTime, Local};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::cron::CronPattern;
use super::error::{SchedulerError, SchedulerResult};
use crate::jobs::{JobDefinition, JobHandler, JobHandlers, JobKind};
use crate::metrics;

// ============================================================================
// Overlap Policy
// ============================================================================

/// What a timer does when its previous run is still in progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverlapPolicy {
    /// Start the new run regardless
    #[default]
    #[serde(rename = "allow")]
    Allow,
    /// Drop the trigger
    #[serde(rename = "skip")]
    SkipIfRunning,
}

impl OverlapPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::SkipIfRunning => "skip",
        }
    }
}

impl fmt::Display for OverlapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverlapPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "skip" | "skip-if-running" => Ok(Self::SkipIfRunning),
            other => Err(format!(
                "invalid overlap policy '{}', expected 'allow' or 'skip'",
                other
            )),
        }
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Wall-clock source for the timers
///
/// `Anchored` derives wall time from tokio's clock, so paused-time tests can
/// drive the timers through whole days.
#[derive(Debug, Clone, Copy)]
pub enum Clock {
    System,
    Anchored { wall: DateTime<Local>, at: Instant },
}

impl Clock {
    /// A clock reading `wall` now and advancing with tokio time
    pub fn anchored(wall: DateTime<Local>) -> Self {
        Self::Anchored {
            wall,
            at: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Local> {
        match self {
            Self::System => Local::now(),
            Self::Anchored { wall, at } => {
                let elapsed = chrono::Duration::from_std(at.elapsed()).unwrap_or(chrono::Duration::MAX);
                wall.checked_add_signed(elapsed).unwrap_or(*wall)
            }
        }
    }

    /// Tokio instant at which this clock reads `target`
    fn instant_at(&self, target: DateTime<Local>) -> Instant {
        let wait = (target - self.now()).to_std().unwrap_or(Duration::ZERO);
        Instant::now() + wait
    }
}

// ============================================================================
// Timers
// ============================================================================

/// Result of one timer trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Completed,
    Failed,
    /// Previous run still in progress under [`OverlapPolicy::SkipIfRunning`]
    Skipped,
}

/// Public view of one armed timer
#[derive(Debug, Clone, Serialize)]
pub struct ArmedTimer {
    pub kind: JobKind,
    pub queue: &'static str,
    pub pattern: String,
    pub next_run: Option<DateTime<Local>>,
    pub runs: u64,
}

struct JobTimer {
    definition: &'static JobDefinition,
    pattern: CronPattern,
    handler: Arc<dyn JobHandler>,
    overlap: OverlapPolicy,
    in_flight: AtomicUsize,
    runs: AtomicU64,
    next_run: Mutex<Option<DateTime<Local>>>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl JobTimer {
    fn set_next_run(&self, next: Option<DateTime<Local>>) {
        if let Ok(mut slot) = self.next_run.lock() {
            *slot = next;
        }
    }

    fn next_run(&self) -> Option<DateTime<Local>> {
        self.next_run.lock().ok().and_then(|slot| *slot)
    }

    fn enter(&self) -> Option<InFlight<'_>> {
        match self.overlap {
            OverlapPolicy::Allow => {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
            }
            OverlapPolicy::SkipIfRunning => {
                self.in_flight
                    .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                    .ok()?;
            }
        }
        Some(InFlight(&self.in_flight))
    }

    async fn fire(&self) -> TriggerOutcome {
        let queue = self.definition.queue;
        let job_name = self.definition.job_name;

        let Some(_in_flight) = self.enter() else {
            warn!(queue, job_name, "Previous run still in progress, skipping trigger");
            return TriggerOutcome::Skipped;
        };

        self.runs.fetch_add(1, Ordering::Relaxed);
        info!(queue, job_name, "Running scheduled job");

        let _active = metrics::track_active_job(queue);
        let started = Instant::now();
        let result = AssertUnwindSafe(self.handler.run()).catch_unwind().await;
        let elapsed = started.elapsed();
        let duration_ms = elapsed.as_millis() as u64;

        match result {
            Ok(Ok(())) => {
                metrics::record_job(queue, "completed", elapsed.as_secs_f64());
                info!(queue, job_name, duration_ms, "Scheduled job completed");
                TriggerOutcome::Completed
            }
            Ok(Err(e)) => {
                metrics::record_job(queue, "failed", elapsed.as_secs_f64());
                error!(queue, job_name, duration_ms, error = %format!("{e:#}"), "Scheduled job failed");
                TriggerOutcome::Failed
            }
            Err(panic) => {
                metrics::record_job(queue, "failed", elapsed.as_secs_f64());
                error!(queue, job_name, duration_ms, panic = %panic_message(panic.as_ref()), "Scheduled job panicked");
                TriggerOutcome::Failed
            }
        }
    }

    fn armed(&self) -> ArmedTimer {
        ArmedTimer {
            kind: self.definition.kind,
            queue: self.definition.queue,
            pattern: self.pattern.to_string(),
            next_run: self.next_run(),
            runs: self.runs.load(Ordering::Relaxed),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The six recurring jobs as in-process timers
pub struct CronScheduler {
    timers: Vec<Arc<JobTimer>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl CronScheduler {
    /// Arm one timer per recurring job on the system clock
    pub fn start(handlers: &JobHandlers, overlap: OverlapPolicy) -> SchedulerResult<Self> {
        Self::start_with_clock(handlers, overlap, Clock::System)
    }

    /// Arm the timers against `clock`
    ///
    /// Fails without arming anything if a handler is missing or a pattern
    /// has no upcoming run.
    pub fn start_with_clock(
        handlers: &JobHandlers,
        overlap: OverlapPolicy,
        clock: Clock,
    ) -> SchedulerResult<Self> {
        let now = clock.now();
        let mut armed = Vec::with_capacity(JobKind::ALL.len());

        for kind in JobKind::ALL {
            let definition = kind.definition();
            let handler = handlers.require(kind)?;
            let pattern = CronPattern::parse(definition.pattern)?;
            let first = pattern
                .next_after(&now)
                .ok_or_else(|| SchedulerError::NoUpcomingRun {
                    pattern: definition.pattern.to_string(),
                })?;

            let timer = Arc::new(JobTimer {
                definition,
                pattern,
                handler,
                overlap,
                in_flight: AtomicUsize::new(0),
                runs: AtomicU64::new(0),
                next_run: Mutex::new(Some(first)),
            });
            armed.push((timer, first));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut timers = Vec::with_capacity(armed.len());
        let mut handles = Vec::with_capacity(armed.len());

        for (timer, first) in armed {
            info!(
                queue = timer.definition.queue,
                pattern = %timer.pattern,
                next_run = %first,
                "Cron timer armed"
            );
            handles.push(tokio::spawn(run_timer(
                Arc::clone(&timer),
                first,
                clock,
                shutdown_rx.clone(),
            )));
            timers.push(timer);
        }

        info!(count = timers.len(), overlap = %overlap, "Cron fallback scheduler started");

        Ok(Self {
            timers,
            shutdown_tx,
            handles,
        })
    }

    pub fn armed_timers(&self) -> Vec<ArmedTimer> {
        self.timers.iter().map(|timer| timer.armed()).collect()
    }

    /// Run one job now, outside its schedule, honoring the overlap policy
    pub async fn trigger(&self, kind: JobKind) -> TriggerOutcome {
        match self.timers.iter().find(|timer| timer.definition.kind == kind) {
            Some(timer) => timer.fire().await,
            None => TriggerOutcome::Skipped,
        }
    }

    /// Runs of `kind` currently executing
    pub fn in_flight(&self, kind: JobKind) -> usize {
        self.timers
            .iter()
            .find(|timer| timer.definition.kind == kind)
            .map(|timer| timer.in_flight.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Disarm every timer; runs already started finish on their own
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Cron timer task panicked");
            }
        }
        info!("Cron fallback scheduler stopped");
    }
}

impl fmt::Debug for CronScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronScheduler")
            .field("timers", &self.timers.len())
            .finish()
    }
}

async fn run_timer(
    timer: Arc<JobTimer>,
    first: DateTime<Local>,
    clock: Clock,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next = first;

    loop {
        timer.set_next_run(Some(next));

        tokio::select! {
            _ = tokio::time::sleep_until(clock.instant_at(next)) => {}
            _ = shutdown.changed() => break,
        }

        let fired = Arc::clone(&timer);
        tokio::spawn(async move {
            fired.fire().await;
        });

        // A slow wakeup must not replay the minute that just fired
        let from = clock.now().max(next);
        match timer.pattern.next_after(&from) {
            Some(following) => next = following,
            None => {
                warn!(queue = timer.definition.queue, "Cron pattern has no further runs");
                break;
            }
        }
    }

    timer.set_next_run(None);
    debug!(queue = timer.definition.queue, "Cron timer disarmed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicU32;

    fn counting_handlers(calls: &Arc<AtomicU32>) -> JobHandlers {
        let mut handlers = JobHandlers::new();
        for kind in JobKind::ALL {
            let calls = Arc::clone(calls);
            handlers = handlers.with(kind, move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(())
                }
            });
        }
        handlers
    }

    #[test]
    fn test_overlap_policy_parse() {
        assert_eq!("allow".parse::<OverlapPolicy>(), Ok(OverlapPolicy::Allow));
        assert_eq!("Skip".parse::<OverlapPolicy>(), Ok(OverlapPolicy::SkipIfRunning));
        assert!("serial".parse::<OverlapPolicy>().is_err());
        assert_eq!(OverlapPolicy::default(), OverlapPolicy::Allow);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_handler_arms_nothing() {
        let handlers = JobHandlers::new().with(JobKind::ReplyTracking, || async {
            Ok::<_, anyhow::Error>(())
        });
        let err = CronScheduler::start(&handlers, OverlapPolicy::Allow).err().unwrap();
        assert!(matches!(err, SchedulerError::MissingHandler { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_anchored_clock_advances_with_tokio_time() {
        let wall = Local.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).single().unwrap();
        let clock = Clock::anchored(wall);
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(clock.now(), wall + chrono::Duration::seconds(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_fire_on_schedule() {
        let calls = Arc::new(AtomicU32::new(0));
        let wall = Local.with_ymd_and_hms(2026, 1, 15, 10, 0, 30).single().unwrap();
        let scheduler = CronScheduler::start_with_clock(
            &counting_handlers(&calls),
            OverlapPolicy::Allow,
            Clock::anchored(wall),
        )
        .unwrap();

        // 10:01 and 10:02 for reply tracking only
        tokio::time::sleep(Duration::from_secs(140)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let reply = scheduler
            .armed_timers()
            .into_iter()
            .find(|t| t.kind == JobKind::ReplyTracking)
            .unwrap();
        assert_eq!(reply.runs, 2);
        assert_eq!(
            reply.next_run,
            Local.with_ymd_and_hms(2026, 1, 15, 10, 3, 0).single()
        );

        scheduler.shutdown().await;
    }
}
