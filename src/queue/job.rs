//! Job records stored in a queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

/// Retention policy for finished jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepJobs {
    /// Most recent jobs kept
    pub count: usize,
    /// Jobs older than this are dropped regardless of count
    #[serde(default, with = "opt_duration_secs")]
    pub max_age: Option<Duration>,
}

/// Options applied to one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Lower number is served first
    pub priority: u32,
    /// Attempts including the first
    pub attempts: u32,
    /// Base delay of the exponential retry backoff
    #[serde(with = "duration_ms")]
    pub backoff: Duration,
    /// Cron pattern for recurring jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<String>,
    pub remove_on_complete: KeepJobs,
    pub remove_on_fail: KeepJobs,
}

/// A unit of queued work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub data: serde_json::Value,
    pub opts: JobOptions,
    pub state: JobState,
    /// Attempts started so far
    pub attempts_made: u32,
    /// Insertion sequence, FIFO tiebreak within a priority
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    /// When a delayed job becomes ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
}

impl Job {
    /// Whether another attempt is allowed after the current one fails
    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.opts.attempts
    }

    /// Delay before retrying after the current attempt failed
    ///
    /// `backoff * 2^(attempts_made - 1)`
    pub fn retry_delay(&self) -> Duration {
        let exponent = self.attempts_made.saturating_sub(1).min(20);
        self.opts.backoff.saturating_mul(1u32 << exponent)
    }

    /// Score in the waiting set: priority first, then insertion order
    pub fn wait_score(&self) -> f64 {
        const SEQ_BITS: u32 = 40;
        let seq = self.seq & ((1u64 << SEQ_BITS) - 1);
        (u64::from(self.opts.priority.min(1 << 12)) << SEQ_BITS | seq) as f64
    }

    /// Whether this is an occurrence of a recurring job
    pub fn is_repeat(&self) -> bool {
        self.opts.repeat.is_some()
    }
}

/// Job counts by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod opt_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
