//! Process-scoped application context
//!
//! Built once at startup and passed by reference. Owns the store probe, the
//! cache, the breaker registry and the background tasks that keep them
//! current, so tests can build isolated instances side by side.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::Cache;
use crate::config::Config;
use crate::store::StoreProbe;
use crate::utils::circuit_breaker::BreakerRegistry;

/// Shared state for one process
pub struct AppContext {
    pub config: Config,
    pub probe: Arc<StoreProbe>,
    pub cache: Arc<Cache>,
    pub breakers: Arc<BreakerRegistry>,
    /// Set by the first scheduler initialization
    pub(crate) scheduler_started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl AppContext {
    /// Probe the store and build the context
    pub async fn initialize(config: Config) -> Self {
        let probe = Arc::new(StoreProbe::initialize(&config.store).await);
        Self::with_probe(config, probe)
    }

    /// Build the context around an existing probe
    pub fn with_probe(config: Config, probe: Arc<StoreProbe>) -> Self {
        let cache = Arc::new(Cache::from_probe(Arc::clone(&probe), &config.cache));
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.to_breaker_config()));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            probe,
            cache,
            breakers,
            scheduler_started: AtomicBool::new(false),
            shutdown_tx,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Receiver that flips to `true` on [`AppContext::shutdown`]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Start the store monitor and the cache sweeper
    pub async fn start_background(&self) {
        let mut tasks = self.background.lock().await;

        if let Some(monitor) = self.probe.spawn_monitor(self.shutdown_signal()) {
            tasks.push(monitor);
        }

        let sweep = Duration::from_secs(self.config.cache.sweep_interval_secs.max(1));
        tasks.push(self.cache.spawn_sweeper(sweep, self.shutdown_signal()));

        debug!(tasks = tasks.len(), "Background tasks started");
    }

    /// Stop background tasks and wait for them
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = self.background.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        info!("Background tasks stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_degraded_context() {
        let ctx = AppContext::initialize(Config::default()).await;
        assert!(!ctx.probe.is_available());

        ctx.start_background().await;
        ctx.cache.set("k", &1u32, None).await;
        assert_eq!(ctx.cache.get::<u32>("k").await, Some(1));
        assert_eq!(ctx.cache.stats().await.backend, "memory");

        ctx.shutdown().await;
    }
}
