//! Backing-store probe
//!
//! Owns the Redis connection pool and a last-known availability flag. The
//! flag starts from an initial PING at startup and is then kept current by a
//! background monitor that pings on a fixed interval.
//!
//! A missing `REDIS_URL`, a bad URL, a refused connection or a failed PING all
//! leave the probe unavailable. None of these is an error: callers check
//! [`StoreProbe::client`] and fall back to their in-process variant.

use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{Error, Result};

/// Upper bound on a single PING, so a black-holed host cannot stall startup
const PING_TIMEOUT: Duration = Duration::from_secs(3);

/// Connection pool plus availability flag
#[derive(Debug)]
pub struct StoreProbe {
    pool: Option<Pool>,
    available: AtomicBool,
    display_url: Option<String>,
    key_prefix: String,
    probe_interval: Duration,
}

impl StoreProbe {
    /// Build the pool and run the initial availability check
    ///
    /// Never fails; an unusable configuration yields an unavailable probe.
    pub async fn initialize(config: &StoreConfig) -> Self {
        let mut probe = Self::disabled(&config.key_prefix);
        probe.probe_interval = Duration::from_secs(config.probe_interval_secs.max(1));

        let Some(url) = config.url.as_deref() else {
            info!("REDIS_URL not set, running without backing store");
            return probe;
        };
        probe.display_url = Some(redact_url(url));

        let pool = match build_pool(url, config.pool_size) {
            Ok(pool) => pool,
            Err(e) => {
                warn!(url = ?probe.display_url, error = %e, "Invalid Redis configuration, running without backing store");
                return probe;
            }
        };
        probe.pool = Some(pool);

        match probe.ping().await {
            Ok(latency) => {
                probe.available.store(true, Ordering::SeqCst);
                info!(
                    url = ?probe.display_url,
                    latency_ms = latency.as_millis() as u64,
                    "Connected to Redis"
                );
            }
            Err(e) => {
                warn!(
                    url = ?probe.display_url,
                    error = %e,
                    "Redis unreachable at startup, running in degraded mode"
                );
            }
        }

        probe
    }

    /// Probe with no store configured
    pub fn disabled(key_prefix: &str) -> Self {
        Self {
            pool: None,
            available: AtomicBool::new(false),
            display_url: None,
            key_prefix: key_prefix.to_string(),
            probe_interval: Duration::from_secs(5),
        }
    }

    /// Last-known availability
    pub fn is_available(&self) -> bool {
        self.pool.is_some() && self.available.load(Ordering::SeqCst)
    }

    /// Whether a store URL was configured at all
    pub fn is_configured(&self) -> bool {
        self.pool.is_some()
    }

    /// Live pool handle, `None` while unavailable
    pub fn client(&self) -> Option<Pool> {
        if self.is_available() {
            self.pool.clone()
        } else {
            None
        }
    }

    /// Check out a connection
    pub async fn connection(&self) -> Result<Connection> {
        let pool = self.client().ok_or(Error::StoreUnavailable)?;
        Ok(pool.get().await?)
    }

    /// Prefix applied to every key this crate writes
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Redacted store URL for logs and reports
    pub fn display_url(&self) -> Option<&str> {
        self.display_url.as_deref()
    }

    /// PING the store and return the round-trip latency
    ///
    /// Ignores the availability flag so the monitor can detect recovery.
    pub async fn ping(&self) -> Result<Duration> {
        let pool = self.pool.as_ref().ok_or(Error::StoreUnavailable)?;
        let started = Instant::now();

        let round_trip = async {
            let mut conn = pool.get().await?;
            let pong: String = redis::cmd("PING").query_async(&mut *conn).await?;
            Ok::<_, Error>(pong)
        };

        match tokio::time::timeout(PING_TIMEOUT, round_trip).await {
            Ok(Ok(_)) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::other(format!(
                "PING timed out after {}s",
                PING_TIMEOUT.as_secs()
            ))),
        }
    }

    /// Ping once and update the availability flag, logging transitions
    pub async fn refresh(&self) -> bool {
        if self.pool.is_none() {
            return false;
        }

        let now_available = match self.ping().await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Redis probe failed");
                false
            }
        };

        let was_available = self.available.swap(now_available, Ordering::SeqCst);
        match (was_available, now_available) {
            (false, true) => info!("Redis connection ready"),
            (true, false) => warn!("Redis connection lost, falling back to in-process store"),
            _ => {}
        }

        now_available
    }

    /// Spawn the availability monitor
    ///
    /// Returns `None` when no store is configured.
    pub fn spawn_monitor(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        self.pool.as_ref()?;

        let probe = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(probe.probe_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        probe.refresh().await;
                    }
                    _ = shutdown.changed() => {
                        debug!("Store monitor stopping");
                        break;
                    }
                }
            }
        }))
    }
}

fn build_pool(url: &str, pool_size: usize) -> Result<Pool> {
    PoolConfig::from_url(url)
        .builder()
        .map_err(|e| Error::config(format!("Failed to create pool builder: {e}")))?
        .max_size(pool_size.max(1))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| Error::config(format!("Failed to create Redis connection pool: {e}")))
}

/// Hide credentials before a URL reaches logs
fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => String::from("<invalid url>"),
    }
}
