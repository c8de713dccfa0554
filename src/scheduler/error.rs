//! Error types for the scheduler module

use std::fmt;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler-specific errors
#[derive(Debug)]
pub enum SchedulerError {
    /// Cron pattern could not be parsed
    InvalidPattern {
        pattern: String,
        reason: String,
    },

    /// Pattern never matches a future instant
    NoUpcomingRun {
        pattern: String,
    },

    /// No handler bound for a recurring job
    MissingHandler {
        job: String,
    },

    /// Recurring job could not be registered with its queue
    RegistrationFailed {
        queue: String,
        reason: String,
    },

    /// Scheduler was already started in this process
    AlreadyInitialized,

    /// Serialization/deserialization error
    SerializationError {
        reason: String,
    },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPattern { pattern, reason } => {
                write!(f, "Invalid cron pattern '{}': {}", pattern, reason)
            }
            Self::NoUpcomingRun { pattern } => {
                write!(f, "Cron pattern '{}' has no upcoming run", pattern)
            }
            Self::MissingHandler { job } => {
                write!(f, "No handler registered for job '{}'", job)
            }
            Self::RegistrationFailed { queue, reason } => {
                write!(f, "Failed to register recurring job on '{}': {}", queue, reason)
            }
            Self::AlreadyInitialized => {
                write!(f, "Scheduler already initialized")
            }
            Self::SerializationError { reason } => {
                write!(f, "Serialization error: {}", reason)
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError {
            reason: err.to_string(),
        }
    }
}

impl SchedulerError {
    /// Create an invalid pattern error
    pub fn invalid_pattern(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    /// Create a missing handler error
    pub fn missing_handler(job: impl Into<String>) -> Self {
        Self::MissingHandler { job: job.into() }
    }

    /// Create a registration error
    pub fn registration(queue: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RegistrationFailed {
            queue: queue.into(),
            reason: reason.into(),
        }
    }

    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::RegistrationFailed { .. })
    }
}
