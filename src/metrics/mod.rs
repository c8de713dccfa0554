//! Prometheus metrics for jobs, cache and outbound-call resilience
//!
//! This module provides metrics tracking for:
//! - Jobs: processed count by queue and outcome, duration, in-flight gauge
//! - Cache: hits and misses by cache type
//! - Resilience: circuit breaker state per service, retry attempts
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge_vec, register_histogram_vec, Counter,
    CounterVec, Encoder, GaugeVec, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

use crate::utils::circuit_breaker::CircuitState;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for job processing metrics
struct JobMetrics {
    processed: CounterVec,
    duration: HistogramVec,
    active: GaugeVec,
}

/// Container for cache and resilience metrics
struct ServiceMetrics {
    cache_hits: CounterVec,
    cache_misses: CounterVec,
    circuit_state: GaugeVec,
    retry_attempts: Counter,
}

static JOB_METRICS: OnceLock<JobMetrics> = OnceLock::new();

static SERVICE_METRICS: OnceLock<ServiceMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// This function should be called once at application startup.
/// If metric registration fails, errors are logged and subsequent
/// metric operations become no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = redlead::metrics::init_metrics() {
///     tracing::warn!("Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let jobs = JobMetrics {
        processed: register_counter_vec!(
            "redlead_jobs_processed_total",
            "Total jobs processed by queue and outcome",
            &["queue", "status"]
        )?,
        duration: register_histogram_vec!(
            "redlead_job_duration_seconds",
            "Job processing duration in seconds",
            &["queue"],
            vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
        )?,
        active: register_gauge_vec!(
            "redlead_active_jobs",
            "Jobs currently being processed",
            &["queue"]
        )?,
    };

    let service = ServiceMetrics {
        cache_hits: register_counter_vec!(
            "redlead_cache_hits_total",
            "Total cache hits by cache type",
            &["cache_type"]
        )?,
        cache_misses: register_counter_vec!(
            "redlead_cache_misses_total",
            "Total cache misses by cache type",
            &["cache_type"]
        )?,
        circuit_state: register_gauge_vec!(
            "redlead_circuit_state",
            "Circuit breaker state (0 = closed, 1 = open, 2 = half-open)",
            &["service"]
        )?,
        retry_attempts: register_counter!(
            "redlead_retry_attempts_total",
            "Total retry attempts across all outbound calls"
        )?,
    };

    JOB_METRICS
        .set(jobs)
        .map_err(|_| "Job metrics already initialized")?;
    SERVICE_METRICS
        .set(service)
        .map_err(|_| "Service metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    JOB_METRICS.get().is_some() && SERVICE_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Render all registered metrics in the Prometheus text format
pub fn gather_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a finished job, `status` is `"completed"` or `"failed"`
pub fn record_job(queue: &str, status: &str, duration_secs: f64) {
    let Some(m) = JOB_METRICS.get() else {
        return;
    };

    m.processed.with_label_values(&[queue, status]).inc();
    m.duration.with_label_values(&[queue]).observe(duration_secs);
}

/// Gauge guard that counts a job as active until dropped
pub struct ActiveJobGuard {
    queue: Option<String>,
}

impl Drop for ActiveJobGuard {
    fn drop(&mut self) {
        if let (Some(queue), Some(m)) = (self.queue.take(), JOB_METRICS.get()) {
            m.active.with_label_values(&[queue.as_str()]).dec();
        }
    }
}

/// Mark a job as active on `queue`
pub fn track_active_job(queue: &str) -> ActiveJobGuard {
    match JOB_METRICS.get() {
        Some(m) => {
            m.active.with_label_values(&[queue]).inc();
            ActiveJobGuard {
                queue: Some(queue.to_string()),
            }
        }
        None => ActiveJobGuard { queue: None },
    }
}

pub fn record_cache_hit(cache_type: &str) {
    if let Some(m) = SERVICE_METRICS.get() {
        m.cache_hits.with_label_values(&[cache_type]).inc();
    }
}

pub fn record_cache_miss(cache_type: &str) {
    if let Some(m) = SERVICE_METRICS.get() {
        m.cache_misses.with_label_values(&[cache_type]).inc();
    }
}

/// Publish a breaker's state
pub fn set_circuit_state(service: &str, state: CircuitState) {
    if let Some(m) = SERVICE_METRICS.get() {
        m.circuit_state
            .with_label_values(&[service])
            .set(state.as_gauge());
    }
}

pub fn record_retry() {
    if let Some(m) = SERVICE_METRICS.get() {
        m.retry_attempts.inc();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ensure_metrics_initialized() {
        let _ = init_metrics();
    }

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(metrics_initialized());
    }

    #[test]
    fn test_gather_metrics_exposes_series() {
        ensure_metrics_initialized();
        record_job("lead-discovery", "completed", 1.5);
        record_cache_hit("memory");
        set_circuit_state("reddit", CircuitState::Open);
        record_retry();

        let text = gather_metrics().unwrap();
        assert!(text.contains("redlead_jobs_processed_total"));
        assert!(text.contains("redlead_cache_hits_total"));
        assert!(text.contains("redlead_circuit_state{service=\"reddit\"} 1"));
        assert!(text.contains("redlead_retry_attempts_total"));
    }

    #[test]
    fn test_active_job_guard() {
        ensure_metrics_initialized();
        let gauge = || {
            JOB_METRICS
                .get()
                .map(|m| m.active.with_label_values(&["guard-test"]).get())
                .unwrap_or_default()
        };

        {
            let _guard = track_active_job("guard-test");
            assert_eq!(gauge(), 1.0);
        }
        assert_eq!(gauge(), 0.0);
    }

    #[test]
    fn test_helpers_do_not_panic() {
        record_job("reply-tracking", "failed", 0.2);
        record_cache_miss("redis");
        set_circuit_state("openai", CircuitState::HalfOpen);
        let _guard = track_active_job("market-insight");
    }
}
