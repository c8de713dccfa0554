//! Redis-backed cache backend

use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

use super::CacheBackend;
use crate::error::Result;
use crate::store::StoreProbe;

/// Keys deleted or counted per SCAN round trip
const SCAN_BATCH: usize = 500;

/// Cache entries stored as `{prefix}:cache:{key}` with a millisecond TTL
#[derive(Debug, Clone)]
pub struct RedisStore {
    probe: Arc<StoreProbe>,
    namespace: String,
}

impl RedisStore {
    pub fn new(probe: Arc<StoreProbe>) -> Self {
        let namespace = format!("{}:cache", probe.key_prefix());
        Self { probe, namespace }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    /// Every key under this cache's namespace
    async fn scan_keys(&self) -> Result<Vec<String>> {
        let mut conn = self.probe.connection().await?;
        let pattern = format!("{}:*", self.namespace);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut *conn)
                .await?;
            keys.extend(batch);

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }
}

#[async_trait]
impl CacheBackend for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_available(&self) -> bool {
        self.probe.is_available()
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.probe.connection().await?;
        let value: Option<String> = conn.get(self.key(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut conn = self.probe.connection().await?;
        let millis = ttl.as_millis().min(u64::MAX as u128) as u64;

        if millis == 0 {
            let _: () = conn.del(self.key(key)).await?;
            return Ok(());
        }

        let _: () = conn.pset_ex(self.key(key), value, millis).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.probe.connection().await?;
        let _: () = conn.del(self.key(key)).await?;
        Ok(())
    }

    /// Delete this cache's keys only; queue keys share the database
    async fn clear(&self) -> Result<()> {
        let keys = self.scan_keys().await?;
        if keys.is_empty() {
            return Ok(());
        }

        let mut conn = self.probe.connection().await?;
        for chunk in keys.chunks(SCAN_BATCH) {
            let _: () = conn.del(chunk).await?;
        }

        tracing::info!(count = keys.len(), "Cleared shared cache entries");
        Ok(())
    }

    async fn size(&self) -> Result<Option<u64>> {
        Ok(Some(self.scan_keys().await?.len() as u64))
    }
}
