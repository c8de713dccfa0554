//! Unified error handling for the redlead crate
//!
//! This module provides a unified error type that consolidates all domain-specific
//! errors into a single `Error` enum, while maintaining the ability to use
//! domain-specific errors when needed.
//!
//! Store absence is not represented here: an unavailable backing store is a
//! normal operating state reported through `Option` and availability flags.
//! [`Error::StoreUnavailable`] only appears where a caller explicitly asked for
//! the store (the worker process, queue operations).

use thiserror::Error;

// Re-export domain-specific errors for convenience
pub use crate::scheduler::error::SchedulerError;
pub use crate::utils::circuit_breaker::BreakerError;
pub use crate::utils::error::ExternalError;

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Backing store errors
    Store,
    /// Calls to external services
    Network,
    /// Serialization errors
    Parsing,
    /// Configuration and validation errors
    Config,
    /// Scheduler and job errors
    Scheduler,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Network => "network",
            Self::Parsing => "parsing",
            Self::Config => "config",
            Self::Scheduler => "scheduler",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the redlead crate
#[derive(Error, Debug)]
pub enum Error {
    /// Redis command errors
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Connection pool errors
    #[error("Store pool error: {0}")]
    Pool(String),

    /// The backing store is not available
    #[error("Backing store is not available")]
    StoreUnavailable,

    /// A store call did not answer in time
    #[error("Store {operation} timed out after {}ms", .after.as_millis())]
    StoreTimeout {
        operation: &'static str,
        after: std::time::Duration,
    },

    /// Queue was closed and accepts no more jobs
    #[error("Queue '{queue}' is closed")]
    QueueClosed { queue: String },

    /// The worker no longer holds the lock on a job it ran
    #[error("Lock on job '{job_id}' in queue '{queue}' was lost")]
    JobLockLost { queue: String, job_id: String },

    /// Scheduler and timing errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Calls to external services
    #[error("External service error: {0}")]
    External(#[from] ExternalError),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a queue closed error
    pub fn queue_closed(queue: impl Into<String>) -> Self {
        Self::QueueClosed {
            queue: queue.into(),
        }
    }

    /// Create a lost job lock error
    pub fn lock_lost(queue: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self::JobLockLost {
            queue: queue.into(),
            job_id: job_id.into(),
        }
    }

    /// Check if this error is recoverable (can be retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            Self::Pool(_) => true,
            Self::StoreUnavailable => true,
            Self::StoreTimeout { .. } => true,
            Self::QueueClosed { .. } | Self::JobLockLost { .. } => false,
            Self::Scheduler(e) => e.is_recoverable(),
            Self::External(e) => crate::utils::error::is_retryable_error(e),
            Self::Json(_) => false,
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Store(_)
            | Self::Pool(_)
            | Self::StoreUnavailable
            | Self::StoreTimeout { .. }
            | Self::QueueClosed { .. }
            | Self::JobLockLost { .. } => ErrorCategory::Store,
            Self::Scheduler(_) => ErrorCategory::Scheduler,
            Self::External(_) => ErrorCategory::Network,
            Self::Json(_) => ErrorCategory::Parsing,
            Self::Config(_) => ErrorCategory::Config,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl From<deadpool_redis::PoolError> for Error {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Pool(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::External(ExternalError::Http(err))
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        let err = Error::External(ExternalError::status("reddit", 503));
        assert_eq!(err.category(), ErrorCategory::Network);

        assert_eq!(Error::StoreUnavailable.category(), ErrorCategory::Store);
        assert_eq!(
            Error::from(SchedulerError::missing_handler("x")).category(),
            ErrorCategory::Scheduler
        );
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::External(ExternalError::status("reddit", 503)).is_recoverable());
        assert!(!Error::External(ExternalError::status("reddit", 400)).is_recoverable());
        assert!(!Error::queue_closed("lead-discovery").is_recoverable());
        assert!(!Error::lock_lost("lead-discovery", "42").is_recoverable());

        let timeout = Error::StoreTimeout {
            operation: "cache get",
            after: std::time::Duration::from_millis(250),
        };
        assert!(timeout.is_recoverable());
        assert_eq!(timeout.category(), ErrorCategory::Store);
        assert_eq!(timeout.to_string(), "Store cache get timed out after 250ms");
    }

    #[test]
    fn test_config_error() {
        let err = Error::config("concurrency must be greater than 0");
        assert_eq!(err.category(), ErrorCategory::Config);
        assert!(!err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "Config error: concurrency must be greater than 0"
        );
    }

    #[test]
    fn test_other_error() {
        let err = Error::other("Something went wrong");
        assert_eq!(err.category(), ErrorCategory::Other);

        let err: Error = anyhow::anyhow!("handler exploded").into();
        assert_eq!(err.to_string(), "handler exploded");
    }

    #[test]
    fn test_with_source_keeps_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        let err = Error::with_source("write failed", io);
        assert!(std::error::Error::source(&err).is_some());
    }
}
