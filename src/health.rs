//! Readiness report
//!
//! Summarizes whether caching and persistence are operational: store
//! reachability with PING latency, cache backend and counters, breaker
//! states and, in queue mode, per-queue job counts. Running without the
//! store is reported as degraded, never unhealthy.

use serde::Serialize;
use std::fmt::Write as _;

use crate::cache::CacheStats;
use crate::context::AppContext;
use crate::queue::{JobCounts, QueueRegistry};
use crate::utils::circuit_breaker::{CircuitSnapshot, CircuitState};

// ============================================================================
// Health Status Types
// ============================================================================

/// Overall health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Component health check result
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

/// Job counts of one queue
#[derive(Debug, Clone, Serialize)]
pub struct QueueReport {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts: Option<JobCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Readiness report
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub status: HealthStatus,
    pub timestamp: String,
    pub checks: Vec<ComponentHealth>,
    pub cache: CacheStats,
    pub breakers: Vec<CircuitSnapshot>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub queues: Vec<QueueReport>,
}

// ============================================================================
// Checks
// ============================================================================

/// Build the readiness report; queue counts only when `queues` is given
pub async fn check_readiness(ctx: &AppContext, queues: Option<&QueueRegistry>) -> ReadinessReport {
    let mut checks = Vec::new();

    let store = if !ctx.probe.is_configured() {
        ComponentHealth {
            name: "store".to_string(),
            status: HealthStatus::Degraded,
            message: Some("not configured, running in degraded mode".to_string()),
            latency_ms: None,
        }
    } else {
        match ctx.probe.ping().await {
            Ok(latency) => ComponentHealth {
                name: "store".to_string(),
                status: HealthStatus::Healthy,
                message: ctx.probe.display_url().map(str::to_string),
                latency_ms: Some(latency.as_millis() as u64),
            },
            Err(e) => ComponentHealth {
                name: "store".to_string(),
                status: HealthStatus::Degraded,
                message: Some(format!("unreachable: {e}")),
                latency_ms: None,
            },
        }
    };
    checks.push(store);

    let cache = ctx.cache.stats().await;
    checks.push(ComponentHealth {
        name: "cache".to_string(),
        status: if cache.backend == "memory" {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        },
        message: Some(format!(
            "{} backend, hit rate {:.1}%",
            cache.backend,
            cache.hit_rate() * 100.0
        )),
        latency_ms: None,
    });

    let breakers = ctx.breakers.snapshots();
    let open: Vec<&str> = breakers
        .iter()
        .filter(|b| b.state == CircuitState::Open)
        .map(|b| b.name.as_str())
        .collect();
    checks.push(ComponentHealth {
        name: "circuit_breakers".to_string(),
        status: if open.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        },
        message: Some(if open.is_empty() {
            format!("{} tracked, none open", breakers.len())
        } else {
            format!("open: {}", open.join(", "))
        }),
        latency_ms: None,
    });

    let mut queue_reports = Vec::new();
    if let Some(registry) = queues {
        let mut failed = 0;
        for (name, counts) in registry.counts().await {
            match counts {
                Ok(counts) => queue_reports.push(QueueReport {
                    name,
                    counts: Some(counts),
                    error: None,
                }),
                Err(e) => {
                    failed += 1;
                    queue_reports.push(QueueReport {
                        name,
                        counts: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        checks.push(ComponentHealth {
            name: "queues".to_string(),
            status: if failed == 0 {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            message: Some(format!("{} queues, {} unreadable", queue_reports.len(), failed)),
            latency_ms: None,
        });
    }

    ReadinessReport {
        status: overall_status(&checks),
        timestamp: chrono::Utc::now().to_rfc3339(),
        checks,
        cache,
        breakers,
        queues: queue_reports,
    }
}

/// Worst status among the checks
pub fn overall_status(checks: &[ComponentHealth]) -> HealthStatus {
    checks
        .iter()
        .map(|check| check.status)
        .max()
        .unwrap_or(HealthStatus::Healthy)
}

/// Human-readable rendering of a report
pub fn render_text(report: &ReadinessReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "status: {}", report.status.as_str());

    for check in &report.checks {
        let _ = write!(out, "  {:<18} {:<10}", check.name, check.status.as_str());
        if let Some(latency) = check.latency_ms {
            let _ = write!(out, " {latency}ms");
        }
        if let Some(message) = &check.message {
            let _ = write!(out, " {message}");
        }
        out.push('\n');
    }

    for breaker in &report.breakers {
        let _ = writeln!(
            out,
            "  breaker {:<10} {} (failures {})",
            breaker.name, breaker.state, breaker.failure_count
        );
    }

    for queue in &report.queues {
        match (&queue.counts, &queue.error) {
            (Some(c), _) => {
                let _ = writeln!(
                    out,
                    "  queue {:<22} waiting {} delayed {} active {} completed {} failed {}",
                    queue.name, c.waiting, c.delayed, c.active, c.completed, c.failed
                );
            }
            (None, Some(e)) => {
                let _ = writeln!(out, "  queue {:<22} error: {}", queue.name, e);
            }
            (None, None) => {}
        }
    }

    out
}

// ============================================================================
// Tests
// ============================================================================
