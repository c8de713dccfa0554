//! Dual-mode recurring job scheduler
//!
//! At startup the scheduler picks one of two mutually exclusive modes:
//!
//! - **Queue**: the backing store is reachable and `USE_QUEUE` is not
//!   `false`. The six recurring jobs are registered as repeatable jobs on
//!   their queues; a separate `redlead-worker` process executes them.
//! - **Cron**: anything else. Six in-process timers call the job handlers
//!   directly on the same patterns.
//!
//! The mode never changes for the lifetime of the process. Exactly one of
//! {queue registrations, cron timers} is ever active, so no job runs twice.
//!
//! # Modules
//!
//! - [`cron`] - Five-field cron pattern parsing and next-run computation
//! - [`fallback`] - In-process timers and overlap policy
//! - [`error`] - Scheduler errors

pub mod cron;
pub mod error;
pub mod fallback;

pub use cron::CronPattern;
pub use error::{SchedulerError, SchedulerResult};
pub use fallback::{ArmedTimer, Clock, CronScheduler, OverlapPolicy, TriggerOutcome};

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::error::Result;
use crate::jobs::{JobDefinition, JobHandlers, JobKind};
use crate::queue::QueueRegistry;

/// Delay before the first worker-presence check, one heartbeat TTL
const WATCHDOG_GRACE: Duration = Duration::from_secs(30);

/// Interval between worker-presence checks
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Mode Selection
// ============================================================================

/// How recurring jobs are executed for the lifetime of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerMode {
    Queue,
    Cron,
}

impl SchedulerMode {
    /// Queue mode iff the store is available and not disabled
    pub fn select(store_available: bool, use_queue: bool) -> Self {
        if store_available && use_queue {
            Self::Queue
        } else {
            Self::Cron
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Cron => "cron",
        }
    }
}

impl fmt::Display for SchedulerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Registrar
// ============================================================================

/// Destination of recurring-job definitions in queue mode
#[async_trait]
pub trait RecurringJobRegistrar: Send + Sync {
    /// Install one recurring job; must be idempotent
    async fn register(&self, definition: &JobDefinition) -> Result<()>;

    /// Live workers across the queues, `None` when unknown
    async fn worker_count(&self) -> Option<usize> {
        None
    }

    async fn close(&self) {}
}

// ============================================================================
// Handle
// ============================================================================

/// Running scheduler in queue mode
pub struct QueueScheduler {
    registrar: Arc<dyn RecurringJobRegistrar>,
    registered: Vec<JobKind>,
    shutdown_tx: watch::Sender<bool>,
    watchdog: JoinHandle<()>,
}

/// The started scheduler, in whichever mode was selected
pub enum SchedulerHandle {
    Queue(QueueScheduler),
    Cron(CronScheduler),
}

impl SchedulerHandle {
    pub fn mode(&self) -> SchedulerMode {
        match self {
            Self::Queue(_) => SchedulerMode::Queue,
            Self::Cron(_) => SchedulerMode::Cron,
        }
    }

    /// Cron timers; always empty in queue mode
    pub fn armed_timers(&self) -> Vec<ArmedTimer> {
        match self {
            Self::Queue(_) => Vec::new(),
            Self::Cron(cron) => cron.armed_timers(),
        }
    }

    /// Jobs registered with queues; always empty in cron mode
    pub fn registered_jobs(&self) -> &[JobKind] {
        match self {
            Self::Queue(queue) => &queue.registered,
            Self::Cron(_) => &[],
        }
    }

    pub fn as_cron(&self) -> Option<&CronScheduler> {
        match self {
            Self::Cron(cron) => Some(cron),
            Self::Queue(_) => None,
        }
    }

    /// Stop timers or close queues
    pub async fn shutdown(self) {
        match self {
            Self::Queue(queue) => {
                let _ = queue.shutdown_tx.send(true);
                let _ = queue.watchdog.await;
                queue.registrar.close().await;
                info!("Queue scheduler stopped");
            }
            Self::Cron(cron) => cron.shutdown().await,
        }
    }
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue(queue) => f
                .debug_struct("SchedulerHandle::Queue")
                .field("registered", &queue.registered)
                .finish(),
            Self::Cron(cron) => f.debug_tuple("SchedulerHandle::Cron").field(cron).finish(),
        }
    }
}

// ============================================================================
// Startup
// ============================================================================

/// Start the scheduler for this process
///
/// Must be called once; a second call fails with
/// [`SchedulerError::AlreadyInitialized`] and starts nothing.
pub async fn initialize_scheduler(ctx: &AppContext, handlers: &JobHandlers) -> Result<SchedulerHandle> {
    if ctx.scheduler_started.swap(true, Ordering::SeqCst) {
        return Err(SchedulerError::AlreadyInitialized.into());
    }

    let store_available = ctx.probe.is_available();
    let use_queue = ctx.config.scheduler.use_queue;
    let mode = SchedulerMode::select(store_available, use_queue);

    info!(%mode, store_available, use_queue, "Initializing scheduler");

    let registrar = match mode {
        SchedulerMode::Queue => QueueRegistry::connect(&ctx.probe, &ctx.config.queue.queue_options())
            .map(|registry| Arc::new(registry) as Arc<dyn RecurringJobRegistrar>),
        SchedulerMode::Cron => None,
    };

    start_with(mode, registrar, handlers, ctx.config.scheduler.overlap).await
}

/// Start the scheduler in `mode`
///
/// Cron mode never touches `registrar`. Queue mode without a registrar
/// falls back to cron before anything is registered.
pub async fn start_with(
    mode: SchedulerMode,
    registrar: Option<Arc<dyn RecurringJobRegistrar>>,
    handlers: &JobHandlers,
    overlap: OverlapPolicy,
) -> Result<SchedulerHandle> {
    match (mode, registrar) {
        (SchedulerMode::Queue, Some(registrar)) => start_queue_mode(registrar).await,
        (SchedulerMode::Queue, None) => {
            warn!("Queues could not be created, falling back to cron timers");
            Ok(SchedulerHandle::Cron(CronScheduler::start(handlers, overlap)?))
        }
        (SchedulerMode::Cron, _) => {
            info!("Using in-process cron timers for recurring jobs");
            Ok(SchedulerHandle::Cron(CronScheduler::start(handlers, overlap)?))
        }
    }
}

async fn start_queue_mode(registrar: Arc<dyn RecurringJobRegistrar>) -> Result<SchedulerHandle> {
    let mut registered = Vec::with_capacity(JobKind::ALL.len());

    for kind in JobKind::ALL {
        let definition = kind.definition();
        match registrar.register(definition).await {
            Ok(()) => {
                debug!(queue = definition.queue, pattern = definition.pattern, "Recurring job registered");
                registered.push(kind);
            }
            Err(e) => {
                // No cron timer replaces it: the other jobs already live in
                // the store and switching modes would run them twice
                error!(queue = definition.queue, error = %e, "Failed to register recurring job");
            }
        }
    }

    info!(
        registered = registered.len(),
        total = JobKind::ALL.len(),
        "Recurring jobs registered with queues"
    );
    warn!("Queue mode: recurring jobs only run while a redlead-worker process is attached");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watchdog = tokio::spawn(worker_watchdog(Arc::clone(&registrar), shutdown_rx));

    Ok(SchedulerHandle::Queue(QueueScheduler {
        registrar,
        registered,
        shutdown_tx,
        watchdog,
    }))
}

/// Warn while no worker heartbeat is visible
async fn worker_watchdog(registrar: Arc<dyn RecurringJobRegistrar>, mut shutdown: watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(WATCHDOG_GRACE) => {}
        _ = shutdown.changed() => return,
    }

    let mut interval = tokio::time::interval(WATCHDOG_INTERVAL);
    let mut warned = false;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match registrar.worker_count().await {
                    Some(0) => {
                        if !warned {
                            warn!("No worker process attached; queued jobs will accumulate until redlead-worker starts");
                        }
                        warned = true;
                    }
                    Some(count) => {
                        if warned {
                            info!(workers = count, "Worker process attached");
                        }
                        warned = false;
                    }
                    None => {}
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_selection() {
        assert_eq!(SchedulerMode::select(true, true), SchedulerMode::Queue);
        assert_eq!(SchedulerMode::select(true, false), SchedulerMode::Cron);
        assert_eq!(SchedulerMode::select(false, true), SchedulerMode::Cron);
        assert_eq!(SchedulerMode::select(false, false), SchedulerMode::Cron);
    }

    #[tokio::test]
    async fn test_initialize_twice_fails() {
        let ctx = AppContext::with_probe(
            crate::config::Config::default(),
            Arc::new(crate::store::StoreProbe::disabled("redlead")),
        );
        let handlers = crate::jobs::JobHandlers::new();

        // First call claims the slot even though it fails on missing handlers
        assert!(initialize_scheduler(&ctx, &handlers).await.is_err());
        let err = initialize_scheduler(&ctx, &handlers).await.err().unwrap();
        assert!(matches!(
            err,
            crate::error::Error::Scheduler(SchedulerError::AlreadyInitialized)
        ));
    }
}
