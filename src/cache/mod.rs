//! Cache with automatic fallback to an in-process store
//!
//! Memoizes expensive results (AI responses, computed stats). Each operation
//! goes to the shared Redis backend while the store probe reports it
//! available, and to a bounded in-process map otherwise. A shared-backend
//! error is logged and the operation is redone in process, so callers never
//! see a cache error.
//!
//! # Example
//!
//! ```rust,ignore
//! use redlead::cache::Cache;
//!
//! let cache = Cache::from_probe(probe.clone(), &config.cache);
//! cache.set("insights:42", &insights, None).await;
//! let cached: Option<Insights> = cache.get("insights:42").await;
//! ```
//!
//! Entries written to one backend are not copied to the other when the
//! store comes or goes. Deletes and clears are applied to both.

mod memory;
mod shared;

pub use memory::{MemoryStore, SweepReport};
pub use shared::RedisStore;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::store::StoreProbe;

/// Longest key stored verbatim
const MAX_KEY_LEN: usize = 200;

/// Key-value backend holding serialized values
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Label used in stats and metrics
    fn name(&self) -> &'static str;

    /// Whether operations should currently be routed here
    fn is_available(&self) -> bool;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn clear(&self) -> Result<()>;

    /// Entry count, when the backend can report it
    async fn size(&self) -> Result<Option<u64>>;
}

/// Cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    /// Backend currently serving requests (`redis` or `memory`)
    pub backend: &'static str,
    /// Whether the shared backend is reachable
    pub available: bool,
    /// Entries in the active backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
}

impl CacheStats {
    /// Calculate hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Cache routing between a shared backend and the in-process store
pub struct Cache {
    shared: Option<Arc<dyn CacheBackend>>,
    memory: Arc<MemoryStore>,
    default_ttl: Duration,
    op_timeout: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Cache {
    /// Build a cache over an explicit shared backend
    pub fn new(shared: Option<Arc<dyn CacheBackend>>, config: &CacheConfig) -> Self {
        Self {
            shared,
            memory: Arc::new(MemoryStore::new(config.max_entries)),
            default_ttl: Duration::from_secs(config.default_ttl_secs),
            op_timeout: Duration::from_millis(config.op_timeout_ms.max(1)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Build a cache backed by Redis when the probe has a store configured
    pub fn from_probe(probe: Arc<StoreProbe>, config: &CacheConfig) -> Self {
        let shared: Option<Arc<dyn CacheBackend>> = if probe.is_configured() {
            Some(Arc::new(RedisStore::new(probe)))
        } else {
            None
        };
        Self::new(shared, config)
    }

    /// In-process only cache
    pub fn in_memory(config: &CacheConfig) -> Self {
        Self::new(None, config)
    }

    fn active_shared(&self) -> Option<&Arc<dyn CacheBackend>> {
        self.shared.as_ref().filter(|backend| backend.is_available())
    }

    /// Bound one shared-backend call; a stalled store counts as failed
    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.op_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::StoreTimeout {
                operation,
                after: self.op_timeout,
            }),
        }
    }

    /// Key as stored; oversized keys are replaced by their digest
    fn storage_key(key: &str) -> Cow<'_, str> {
        if key.len() > MAX_KEY_LEN {
            Cow::Owned(format!("sha256:{}", Self::hash_key(key)))
        } else {
            Cow::Borrowed(key)
        }
    }

    fn backend_name(&self) -> &'static str {
        self.active_shared()
            .map(|backend| backend.name())
            .unwrap_or("memory")
    }

    /// Store `value` under `key` for `ttl` (default TTL when `None`)
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let text = match serde_json::to_string(value) {
            Ok(text) => text,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to serialize cache value");
                return;
            }
        };

        let stored = Self::storage_key(key);

        if let Some(shared) = self.active_shared() {
            match self
                .bounded("cache set", shared.set(&stored, text.clone(), ttl))
                .await
            {
                Ok(()) => return,
                Err(e) => {
                    warn!(key = %key, error = %e, "Shared cache set failed, using in-process store");
                }
            }
        }

        self.memory.set(&stored, text, ttl);
    }

    /// Fetch and decode the value under `key`
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut cache_type = "memory";
        let mut raw = None;
        let mut served = false;
        let stored = Self::storage_key(key);

        if let Some(shared) = self.active_shared() {
            match self.bounded("cache get", shared.get(&stored)).await {
                Ok(value) => {
                    cache_type = shared.name();
                    raw = value;
                    served = true;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Shared cache get failed, using in-process store");
                }
            }
        }

        if !served {
            raw = self.memory.get(&stored);
        }

        let decoded = raw.and_then(|text| match serde_json::from_str::<T>(&text) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to decode cached value");
                None
            }
        });

        if decoded.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_cache_hit(cache_type);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_cache_miss(cache_type);
        }

        decoded
    }

    /// Remove `key` from both backends
    pub async fn delete(&self, key: &str) {
        let stored = Self::storage_key(key);
        if let Some(shared) = self.active_shared() {
            if let Err(e) = self.bounded("cache delete", shared.delete(&stored)).await {
                warn!(key = %key, error = %e, "Shared cache delete failed");
            }
        }
        self.memory.delete(&stored);
    }

    /// Remove every entry from both backends
    pub async fn clear(&self) {
        if let Some(shared) = self.active_shared() {
            if let Err(e) = self.bounded("cache clear", shared.clear()).await {
                warn!(error = %e, "Shared cache clear failed");
            }
        }
        self.memory.clear();
    }

    /// Current backend, availability, size and hit counters
    pub async fn stats(&self) -> CacheStats {
        let available = self.active_shared().is_some();

        let size = match self.active_shared() {
            Some(shared) => self.bounded("cache size", shared.size()).await.unwrap_or_else(|e| {
                debug!(error = %e, "Shared cache size unavailable");
                None
            }),
            None => Some(self.memory.len() as u64),
        };

        CacheStats {
            backend: self.backend_name(),
            available,
            size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Return the cached value or compute, store and return it
    ///
    /// Storing is best-effort; errors from `compute` propagate unchanged and
    /// nothing is cached for them.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(cached) = self.get::<T>(key).await {
            debug!(key = %key, "Cache hit");
            return Ok(cached);
        }

        debug!(key = %key, "Cache miss");
        let value = compute().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }

    /// In-process store, exposed for sweeping and inspection
    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    /// Spawn the periodic in-process sweep
    pub fn spawn_sweeper(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let memory = Arc::clone(&self.memory);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        memory.sweep();
                    }
                    _ = shutdown.changed() => {
                        debug!("Cache sweeper stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Hash arbitrary content into a fixed-size cache key component
    pub fn hash_key(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
