//! Circuit breaker for calls to external services
//!
//! Each named service (`"openai"`, `"reddit"`, `"jobs-api"`, ...) gets one
//! breaker, created lazily by [`BreakerRegistry`] and shared by every call
//! site using that name for the life of the process.
//!
//! ```text
//!            failures >= failure_threshold
//!   CLOSED ─────────────────────────────────▶ OPEN
//!     ▲                                        │ timeout elapsed,
//!     │ successes >= success_threshold         │ next call probes
//!     │                                        ▼
//!     └──────────────────────────────────── HALF_OPEN
//!                   any failure ──▶ OPEN
//! ```
//!
//! While HALF_OPEN only one call is in flight at a time; concurrent callers
//! are rejected as if the circuit were still open.

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::deadline_after;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - calls pass through
    Closed,
    /// Too many failures - calls are rejected
    Open,
    /// Testing whether the service recovered
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }

    /// Numeric encoding used by the state gauge
    pub fn as_gauge(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by [`CircuitBreaker::execute`]
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The circuit is open and the operation was not invoked
    #[error("Circuit breaker is OPEN for {service}")]
    Open { service: String },

    /// The operation ran and failed
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Whether the call was short-circuited
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// The operation's own error, if it ran
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Open { .. } => None,
        }
    }
}

/// Breaker thresholds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Successes in HALF_OPEN before closing
    pub success_threshold: u32,
    /// Time spent OPEN before a probe is allowed
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    next_attempt_at: Instant,
    probe_in_flight: bool,
    /// Bumped on every state change; outcomes of calls admitted under an
    /// older generation are ignored
    generation: u64,
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Milliseconds until a probe is allowed, when OPEN
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in_ms: Option<u64>,
}

/// Per-service failure tracker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a breaker in the CLOSED state
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        debug!(
            service = %name,
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            timeout_ms = config.timeout.as_millis() as u64,
            "Circuit breaker created"
        );

        Self {
            name,
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                next_attempt_at: Instant::now(),
                probe_in_flight: false,
                generation: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state (an expired OPEN circuit reports OPEN until the next call)
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Snapshot for health reporting
    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        let retry_in_ms = (inner.state == CircuitState::Open).then(|| {
            inner
                .next_attempt_at
                .saturating_duration_since(Instant::now())
                .as_millis() as u64
        });

        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            retry_in_ms,
        }
    }

    /// Run `operation` under breaker protection
    ///
    /// Returns [`BreakerError::Open`] without invoking `operation` while the
    /// circuit is open, otherwise the operation's result with its error
    /// wrapped in [`BreakerError::Inner`].
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut guard = self.acquire()?;

        let result = operation().await;
        guard.completed = true;

        match &result {
            Ok(_) => self.on_success(guard.generation),
            Err(_) => self.on_failure(guard.generation),
        }

        result.map_err(BreakerError::Inner)
    }

    fn acquire<E>(&self) -> Result<CallGuard<'_>, BreakerError<E>> {
        let mut inner = self.lock();
        let now = Instant::now();

        let is_probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                if now < inner.next_attempt_at {
                    warn!(service = %self.name, state = %inner.state, "Circuit breaker rejecting call");
                    return Err(self.open_error());
                }
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
                inner.generation += 1;
                self.publish(CircuitState::HalfOpen);
                info!(service = %self.name, "Circuit breaker transitioning to HALF_OPEN");
                true
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    debug!(service = %self.name, "Probe already in flight, rejecting call");
                    return Err(self.open_error());
                }
                true
            }
        };

        if is_probe {
            inner.probe_in_flight = true;
        }

        Ok(CallGuard {
            breaker: self,
            is_probe,
            generation: inner.generation,
            completed: false,
        })
    }

    fn on_success(&self, generation: u64) {
        let mut inner = self.lock();
        if self.is_stale(&inner, generation) {
            return;
        }
        inner.failure_count = 0;

        if inner.state == CircuitState::HalfOpen {
            inner.success_count += 1;
            if inner.success_count >= self.config.success_threshold {
                inner.state = CircuitState::Closed;
                inner.success_count = 0;
                inner.generation += 1;
                self.publish(CircuitState::Closed);
                info!(service = %self.name, "Circuit breaker CLOSED");
            }
        }
    }

    fn on_failure(&self, generation: u64) {
        let mut inner = self.lock();
        if self.is_stale(&inner, generation) {
            return;
        }
        inner.success_count = 0;

        match inner.state {
            CircuitState::HalfOpen => {
                self.trip(&mut inner, "probe failed");
            }
            _ => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.trip(&mut inner, "failure threshold reached");
                }
            }
        }
    }

    fn trip(&self, inner: &mut BreakerState, reason: &str) {
        error!(
            service = %self.name,
            failure_count = inner.failure_count,
            reason = reason,
            "Circuit breaker OPENED"
        );
        inner.state = CircuitState::Open;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.next_attempt_at = deadline_after(self.config.timeout);
        inner.generation += 1;
        self.publish(CircuitState::Open);
    }

    fn is_stale(&self, inner: &BreakerState, generation: u64) -> bool {
        let stale = inner.generation != generation;
        if stale {
            debug!(service = %self.name, state = %inner.state, "Ignoring outcome of a call admitted before the last transition");
        }
        stale
    }

    fn open_error<E>(&self) -> BreakerError<E> {
        BreakerError::Open {
            service: self.name.clone(),
        }
    }

    fn publish(&self, state: CircuitState) {
        crate::metrics::set_circuit_state(&self.name, state);
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // State is plain counters, still consistent after a panic elsewhere
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Releases the half-open probe slot, including when the caller's future is dropped
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    is_probe: bool,
    generation: u64,
    completed: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.is_probe {
            self.breaker.lock().probe_in_flight = false;
            if !self.completed {
                debug!(service = %self.breaker.name, "Probe cancelled before completion");
            }
        }
    }
}

/// Lazily-populated set of breakers keyed by service name
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the breaker for a service
    pub fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, self.config.clone())))
            .clone()
    }

    /// Run `operation` through the named service's breaker
    pub async fn execute<T, E, F, Fut>(
        &self,
        service: &str,
        operation: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.breaker(service);
        breaker.execute(operation).await
    }

    /// Snapshots of every breaker created so far, sorted by name
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        let mut snapshots: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
