//! Shared resilience utilities
//!
//! - [`circuit_breaker`] - Per-service breakers and their registry
//! - [`retry`] - Exponential-backoff retry wrappers
//! - [`error`] - Transient-failure classification for outbound calls

pub mod circuit_breaker;
pub mod error;
pub mod retry;

use std::time::Duration;
use tokio::time::Instant;

/// Roughly thirty years; the clamp for deadlines that would overflow
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + after`, clamped instead of panicking on overflow
pub fn deadline_after(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}
