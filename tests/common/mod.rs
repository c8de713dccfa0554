//! Common test utilities

#![allow(dead_code)]

use async_trait::async_trait;
use redlead::cache::CacheBackend;
use redlead::error::{Error, Result};
use redlead::jobs::{JobDefinition, JobHandlers, JobKind};
use redlead::scheduler::RecurringJobRegistrar;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Per-job invocation counters
#[derive(Clone, Default)]
pub struct CallCounts {
    counts: Arc<Mutex<HashMap<JobKind, u32>>>,
}

impl CallCounts {
    pub fn record(&self, kind: JobKind) {
        *self.counts.lock().unwrap().entry(kind).or_insert(0) += 1;
    }

    pub fn get(&self, kind: JobKind) -> u32 {
        self.counts.lock().unwrap().get(&kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.counts.lock().unwrap().values().sum()
    }
}

/// Handlers for all six jobs that count calls; `failing` ones return an error
pub fn counting_handlers(counts: &CallCounts, failing: &[JobKind]) -> JobHandlers {
    let mut handlers = JobHandlers::new();
    for kind in JobKind::ALL {
        let counts = counts.clone();
        let fail = failing.contains(&kind);
        handlers = handlers.with(kind, move || {
            let counts = counts.clone();
            async move {
                counts.record(kind);
                if fail {
                    anyhow::bail!("{kind} worker rejected");
                }
                Ok(())
            }
        });
    }
    handlers
}

/// Registrar that records every registration attempt
#[derive(Default)]
pub struct RecordingRegistrar {
    pub registered: Mutex<Vec<&'static str>>,
    pub attempts: AtomicU32,
    pub closed: AtomicBool,
}

impl RecordingRegistrar {
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn queues(&self) -> Vec<&'static str> {
        self.registered.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecurringJobRegistrar for RecordingRegistrar {
    async fn register(&self, definition: &JobDefinition) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.registered.lock().unwrap().push(definition.queue);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Shared cache backend whose availability and failures are switchable
#[derive(Default)]
pub struct FlakyBackend {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    pub available: AtomicBool,
    pub failing: AtomicBool,
    /// Calls hang forever, like a store that accepted the connection but stopped answering
    pub stalled: AtomicBool,
}

impl FlakyBackend {
    pub fn new() -> Self {
        let backend = Self::default();
        backend.available.store(true, Ordering::SeqCst);
        backend
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).map(|(v, _)| v.clone())
    }

    async fn check(&self) -> Result<()> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::other("simulated store failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for FlakyBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check().await?;
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((_, expires_at)) if Instant::now() >= *expires_at => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.check().await?;
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check().await?;
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.check().await?;
        self.entries.lock().unwrap().clear();
        Ok(())
    }

    async fn size(&self) -> Result<Option<u64>> {
        self.check().await?;
        Ok(Some(self.entries.lock().unwrap().len() as u64))
    }
}
