//! Retry utilities for resilient operations
//!
//! This module provides a common retry mechanism with exponential backoff
//! for calls to the AI provider, Reddit and the collaborator API.
//!
//! The looping and the classification are kept apart: [`retry`] retries every
//! failure and [`retry_if`] takes a predicate, typically
//! [`is_retryable_error`]. The backoff schedule is the same for all of them.
//! The final error is returned unmodified so callers can still match on its
//! kind.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::error::{is_retryable_error, Transient};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of calls, including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub initial_delay: Duration,

    /// Maximum delay (caps exponential growth)
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with custom max attempts
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Create a retry configuration with custom delays
    pub fn with_delays(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier: 2.0,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    ///
    /// `min(initial_delay * multiplier^(attempt - 1), max_delay)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let delay_ms = self.initial_delay.as_millis() as f64 * factor;
        let max_ms = self.max_delay.as_millis() as f64;

        Duration::from_millis(delay_ms.min(max_ms) as u64)
    }

    /// Sum of every delay a fully failing run would wait
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_attempts.max(1))
            .map(|attempt| self.delay_for_attempt(attempt))
            .sum()
    }
}

/// Execute an operation with retry logic and exponential backoff
///
/// Calls `operation` up to `config.max_attempts` times. Returns the first
/// success, or the error produced by the last call.
///
/// # Example
///
/// ```no_run
/// use redlead::utils::retry::{retry, RetryConfig};
///
/// async fn fetch_subreddit() -> anyhow::Result<String> {
///     Ok("r/rust".to_string())
/// }
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = RetryConfig::default();
///     let name = retry(&config, fetch_subreddit).await?;
///     Ok(())
/// }
/// ```
pub async fn retry<T, E, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    run(config, operation, |_: &E| true, |_: u32, _: &E| {}).await
}

/// Like [`retry`], invoking `on_retry(attempt, &error)` before each backoff sleep
pub async fn retry_notify<T, E, F, Fut, N>(
    config: &RetryConfig,
    operation: F,
    on_retry: N,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    N: FnMut(u32, &E),
{
    run(config, operation, |_: &E| true, on_retry).await
}

/// Execute an operation with retry logic, using a custom retry predicate
///
/// An error for which `should_retry` returns `false` is returned immediately.
pub async fn retry_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    run(config, operation, should_retry, |_: u32, _: &E| {}).await
}

/// Retry wrapper for HTTP call sites
///
/// Looping and backoff are identical to [`retry`]. Each failure is logged
/// with its [`is_retryable_error`] classification; call sites that must stop
/// on a permanent error pass that predicate to [`retry_if`] instead.
pub async fn retry_http<T, E, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display + Transient,
{
    run(config, operation, |_: &E| true, |attempt: u32, e: &E| {
        debug!(
            attempt = attempt,
            retryable = is_retryable_error(e),
            status = ?e.http_status(),
            "HTTP call failed"
        );
    })
    .await
}

async fn run<T, E, F, Fut, P, N>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
    mut on_retry: N,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
    N: FnMut(u32, &E),
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(attempt = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => {
                if !should_retry(&e) {
                    warn!(attempt = attempt, error = %e, "Non-retryable error encountered");
                    return Err(e);
                }

                if attempt >= max_attempts {
                    error!(
                        attempts = max_attempts,
                        error = %e,
                        "Retry failed after all attempts"
                    );
                    return Err(e);
                }

                let delay = config.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt,
                    max_attempts = max_attempts,
                    next_retry_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retry attempt"
                );
                crate::metrics::record_retry();
                on_retry(attempt, &e);

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
