//! In-process cache backend
//!
//! A plain map of serialized values with per-entry expiry. Reads expire
//! lazily; [`MemoryStore::sweep`] removes expired entries and clears the
//! whole map once it grows past its ceiling.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::CacheBackend;
use crate::error::Result;
use crate::utils::deadline_after;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Outcome of one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired entries removed
    pub expired: usize,
    /// Whether the size ceiling forced a full clear
    pub cleared: bool,
}

/// Bounded in-process key-value map with TTL
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    max_entries: usize,
}

impl MemoryStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.lock();
        let now = Instant::now();

        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    pub fn set(&self, key: &str, value: String, ttl: Duration) {
        let expires_at = deadline_after(ttl);
        self.lock()
            .insert(key.to_string(), Entry { value, expires_at });
    }

    pub fn delete(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of stored entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove expired entries, then clear everything if still over the ceiling
    pub fn sweep(&self) -> SweepReport {
        let mut entries = self.lock();
        let now = Instant::now();

        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let expired = before - entries.len();

        let cleared = entries.len() > self.max_entries;
        if cleared {
            warn!(
                entries = entries.len(),
                max_entries = self.max_entries,
                "In-process cache over capacity, clearing"
            );
            entries.clear();
        }

        if expired > 0 {
            debug!(expired = expired, "Swept expired cache entries");
        }

        SweepReport { expired, cleared }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CacheBackend for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(MemoryStore::get(self, key))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        MemoryStore::set(self, key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        MemoryStore::delete(self, key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        MemoryStore::clear(self);
        Ok(())
    }

    async fn size(&self) -> Result<Option<u64>> {
        Ok(Some(self.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_lazy_expiry_on_read() {
        let store = MemoryStore::new(10);
        store.set("k", "\"v\"".into(), Duration::from_secs(5));

        tokio::time::advance(Duration::from_millis(4999)).await;
        assert_eq!(store.get("k").as_deref(), Some("\"v\""));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(store.get("k"), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired() {
        let store = MemoryStore::new(10);
        store.set("short", "1".into(), Duration::from_secs(1));
        store.set("long", "2".into(), Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(2)).await;
        let report = store.sweep();

        assert_eq!(report, SweepReport { expired: 1, cleared: false });
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_clears_over_capacity() {
        let store = MemoryStore::new(3);
        for i in 0..4 {
            store.set(&format!("k{i}"), "x".into(), Duration::from_secs(60));
        }

        // Growth itself is not blocked; the sweep enforces the ceiling
        assert_eq!(store.len(), 4);
        assert!(store.sweep().cleared);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_ttl_is_clamped() {
        let store = MemoryStore::new(10);
        store.set("forever", "1".into(), Duration::MAX);

        tokio::time::advance(Duration::from_secs(86_400 * 365)).await;
        assert_eq!(store.get("forever").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_at_capacity_is_kept() {
        let store = MemoryStore::new(3);
        for i in 0..3 {
            store.set(&format!("k{i}"), "x".into(), Duration::from_secs(60));
        }
        assert!(!store.sweep().cleared);
        assert_eq!(store.len(), 3);
    }
}
