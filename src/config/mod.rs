//! Configuration management for redlead
//!
//! This module handles loading and validating configuration from environment
//! variables and TOML files. Every section has defaults, so an empty
//! environment yields a working degraded-mode setup (no backing store).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::queue::{KeepJobs, QueueOptions, WorkerOptions};
use crate::scheduler::OverlapPolicy;
use crate::utils::circuit_breaker::CircuitBreakerConfig;
use crate::utils::retry::RetryConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backing store (Redis) configuration
    pub store: StoreConfig,

    /// Cache configuration
    pub cache: CacheConfig,

    /// Circuit breaker thresholds
    pub breaker: BreakerConfig,

    /// Retry policy for outbound calls
    pub retry: RetrySettings,

    /// Job queue defaults
    pub queue: QueueConfig,

    /// Scheduler configuration
    pub scheduler: SchedulerConfig,

    /// Job dispatch endpoint
    pub jobs: JobsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Backing store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis connection URL; absent means degraded mode
    pub url: Option<String>,

    /// Maximum pool size
    pub pool_size: usize,

    /// Seconds between availability probes
    pub probe_interval_secs: u64,

    /// Prefix for every key this crate writes
    pub key_prefix: String,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL applied when the caller does not pass one
    pub default_ttl_secs: u64,

    /// Interval of the in-process expiry sweep
    pub sweep_interval_secs: u64,

    /// In-process entry ceiling; exceeding it clears the map
    pub max_entries: usize,

    /// Deadline of one shared-store cache call before falling back
    pub op_timeout_ms: u64,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_secs: u64,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

/// Job queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Attempts per job, including the first
    pub attempts: u32,

    /// Base delay of the exponential job backoff
    pub backoff_ms: u64,

    /// Completed jobs retained per queue
    pub keep_completed: usize,

    /// Maximum age of retained completed jobs
    pub completed_max_age_secs: u64,

    /// Failed jobs retained per queue
    pub keep_failed: usize,

    /// Jobs processed concurrently by one worker
    pub concurrency: usize,

    /// Idle poll interval of a worker
    pub poll_interval_ms: u64,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Use the queue backend when the store is available
    pub use_queue: bool,

    /// Whether cron-mode runs of one job may overlap
    pub overlap: OverlapPolicy,
}

/// Job dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Base URL of the collaborator API that runs the job bodies
    pub base_url: String,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

/// Upper bound on attempts per job, including the first
pub const MAX_JOB_ATTEMPTS: u32 = 3;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let url = std::env::var("REDIS_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let overlap = match std::env::var("SCHEDULER_OVERLAP") {
            Ok(v) => v.parse::<OverlapPolicy>().map_err(anyhow::Error::msg)?,
            Err(_) => defaults.scheduler.overlap,
        };

        Ok(Self {
            store: StoreConfig {
                url,
                pool_size: env_or("REDIS_POOL_SIZE", defaults.store.pool_size),
                probe_interval_secs: env_or(
                    "REDIS_PROBE_INTERVAL",
                    defaults.store.probe_interval_secs,
                ),
                key_prefix: std::env::var("REDLEAD_KEY_PREFIX")
                    .unwrap_or(defaults.store.key_prefix),
            },
            cache: CacheConfig {
                default_ttl_secs: env_or("CACHE_DEFAULT_TTL", defaults.cache.default_ttl_secs),
                sweep_interval_secs: env_or(
                    "CACHE_SWEEP_INTERVAL",
                    defaults.cache.sweep_interval_secs,
                ),
                max_entries: env_or("CACHE_MAX_ENTRIES", defaults.cache.max_entries),
                op_timeout_ms: env_or("CACHE_OP_TIMEOUT_MS", defaults.cache.op_timeout_ms),
            },
            breaker: BreakerConfig {
                failure_threshold: env_or(
                    "BREAKER_FAILURE_THRESHOLD",
                    defaults.breaker.failure_threshold,
                ),
                success_threshold: env_or(
                    "BREAKER_SUCCESS_THRESHOLD",
                    defaults.breaker.success_threshold,
                ),
                timeout_secs: env_or("BREAKER_TIMEOUT", defaults.breaker.timeout_secs),
            },
            retry: RetrySettings {
                max_attempts: env_or("RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts),
                initial_delay_ms: env_or("RETRY_INITIAL_DELAY_MS", defaults.retry.initial_delay_ms),
                max_delay_ms: env_or("RETRY_MAX_DELAY_MS", defaults.retry.max_delay_ms),
                backoff_multiplier: env_or(
                    "RETRY_BACKOFF_MULTIPLIER",
                    defaults.retry.backoff_multiplier,
                ),
            },
            queue: QueueConfig {
                attempts: env_or("QUEUE_ATTEMPTS", defaults.queue.attempts),
                backoff_ms: env_or("QUEUE_BACKOFF_MS", defaults.queue.backoff_ms),
                keep_completed: env_or("QUEUE_KEEP_COMPLETED", defaults.queue.keep_completed),
                completed_max_age_secs: env_or(
                    "QUEUE_COMPLETED_MAX_AGE",
                    defaults.queue.completed_max_age_secs,
                ),
                keep_failed: env_or("QUEUE_KEEP_FAILED", defaults.queue.keep_failed),
                concurrency: env_or("QUEUE_CONCURRENCY", defaults.queue.concurrency),
                poll_interval_ms: env_or("QUEUE_POLL_INTERVAL_MS", defaults.queue.poll_interval_ms),
            },
            scheduler: SchedulerConfig {
                // Only an explicit "false" disables the queue backend
                use_queue: std::env::var("USE_QUEUE")
                    .map(|v| !v.trim().eq_ignore_ascii_case("false"))
                    .unwrap_or(true),
                overlap,
            },
            jobs: JobsConfig {
                base_url: std::env::var("REDLEAD_JOBS_URL").unwrap_or(defaults.jobs.base_url),
                request_timeout_secs: env_or(
                    "REDLEAD_JOBS_TIMEOUT",
                    defaults.jobs.request_timeout_secs,
                ),
            },
            logging: LoggingConfig {
                level: std::env::var("REDLEAD_LOG_LEVEL").unwrap_or(defaults.logging.level),
                format: std::env::var("REDLEAD_LOG_FORMAT").unwrap_or(defaults.logging.format),
            },
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.store.pool_size == 0 {
            anyhow::bail!("store.pool_size must be greater than 0");
        }

        if self.store.probe_interval_secs == 0 {
            anyhow::bail!("store.probe_interval_secs must be greater than 0");
        }

        if let Some(url) = &self.store.url {
            url::Url::parse(url).with_context(|| format!("Invalid store URL: {url}"))?;
        }

        if self.cache.sweep_interval_secs == 0 {
            anyhow::bail!("cache.sweep_interval_secs must be greater than 0");
        }

        if self.cache.op_timeout_ms == 0 {
            anyhow::bail!("cache.op_timeout_ms must be greater than 0");
        }

        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            anyhow::bail!("breaker thresholds must be greater than 0");
        }

        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be greater than 0");
        }

        if self.retry.backoff_multiplier.is_nan() || self.retry.backoff_multiplier < 1.0 {
            anyhow::bail!("retry.backoff_multiplier must be at least 1.0");
        }

        if self.queue.attempts == 0 || self.queue.attempts > MAX_JOB_ATTEMPTS {
            anyhow::bail!("queue.attempts must be between 1 and {MAX_JOB_ATTEMPTS}");
        }

        if self.queue.concurrency == 0 {
            anyhow::bail!("queue.concurrency must be greater than 0");
        }

        url::Url::parse(&self.jobs.base_url)
            .with_context(|| format!("Invalid jobs URL: {}", self.jobs.base_url))?;

        Ok(())
    }

    /// Get the store probe interval as Duration
    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.store.probe_interval_secs)
    }

    /// Get the job request timeout as Duration
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.jobs.request_timeout_secs)
    }
}

impl BreakerConfig {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

impl QueueConfig {
    /// Default options applied to jobs added to a queue
    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            attempts: self.attempts,
            backoff: Duration::from_millis(self.backoff_ms),
            remove_on_complete: KeepJobs {
                count: self.keep_completed,
                max_age: Some(Duration::from_secs(self.completed_max_age_secs)),
            },
            remove_on_fail: KeepJobs {
                count: self.keep_failed,
                max_age: None,
            },
        }
    }

    /// Options for workers attached to a queue
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            concurrency: self.concurrency,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ..WorkerOptions::default()
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            pool_size: 10,
            probe_interval_secs: 5,
            key_prefix: String::from("redlead"),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3600,
            sweep_interval_secs: 60,
            max_entries: 1000,
            op_timeout_ms: 500,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_secs: 30,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 1000,
            keep_completed: 100,
            completed_max_age_secs: 24 * 3600,
            keep_failed: 500,
            concurrency: 5,
            poll_interval_ms: 500,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            use_queue: true,
            overlap: OverlapPolicy::Allow,
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            base_url: String::from("http://localhost:5000/internal/jobs"),
            request_timeout_secs: 300,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.store.url.is_none());
        assert!(config.scheduler.use_queue);
    }

    #[test]
    fn test_invalid_concurrency() {
        let mut config = Config::default();
        config.queue.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_thresholds_and_multiplier() {
        let mut config = Config::default();
        config.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.backoff_multiplier = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_attempts_bounds() {
        let mut config = Config::default();
        config.queue.attempts = MAX_JOB_ATTEMPTS;
        assert!(config.validate().is_ok());

        config.queue.attempts = MAX_JOB_ATTEMPTS + 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("between 1 and 3"));

        config.queue.attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_cache_timeout_rejected() {
        let mut config = Config::default();
        config.cache.op_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_jobs_url() {
        let mut config = Config::default();
        config.jobs.base_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_conversions() {
        let config = Config::default();
        assert_eq!(config.retry.to_retry_config(), RetryConfig::default());
        assert_eq!(
            config.breaker.to_breaker_config(),
            CircuitBreakerConfig::default()
        );

        let options = config.queue.queue_options();
        assert_eq!(options.attempts, 3);
        assert_eq!(options.remove_on_complete.count, 100);
        assert_eq!(
            options.remove_on_complete.max_age,
            Some(Duration::from_secs(86_400))
        );
        assert_eq!(options.remove_on_fail.count, 500);
        assert_eq!(config.queue.worker_options().concurrency, 5);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [store]
            url = "redis://127.0.0.1:6379"

            [scheduler]
            overlap = "skip"
            "#,
        )
        .unwrap();

        assert_eq!(config.store.url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(config.store.pool_size, 10);
        assert_eq!(config.scheduler.overlap, OverlapPolicy::SkipIfRunning);
        assert_eq!(config.cache.max_entries, 1000);
    }
}
