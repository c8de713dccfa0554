//! Five-field cron patterns
//!
//! `minute hour day-of-month month day-of-week`, evaluated by the `cron`
//! crate with a fixed seconds field of `0`. Day-of-week follows that crate:
//! names (`MON-FRI`) or `1-7` with 1 meaning Sunday.

use chrono::{DateTime, TimeZone};
use cron::Schedule;
use std::fmt;
use std::str::FromStr;

use super::error::{SchedulerError, SchedulerResult};

/// Parsed cron pattern
#[derive(Debug, Clone)]
pub struct CronPattern {
    source: String,
    schedule: Schedule,
}

impl CronPattern {
    /// Parse a five-field pattern
    pub fn parse(pattern: &str) -> SchedulerResult<Self> {
        let fields: Vec<&str> = pattern.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(SchedulerError::invalid_pattern(
                pattern,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }

        let source = fields.join(" ");
        let schedule = Schedule::from_str(&format!("0 {source}"))
            .map_err(|e| SchedulerError::invalid_pattern(pattern, e.to_string()))?;

        Ok(Self { source, schedule })
    }

    /// The normalized pattern text
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the minute containing `at` matches
    pub fn matches<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        let minute = at.timestamp() - at.timestamp().rem_euclid(60);
        match at.timezone().timestamp_opt(minute, 0).single() {
            Some(start) => self.schedule.includes(start),
            None => false,
        }
    }

    /// First matching minute strictly after `after`, in `after`'s time zone
    ///
    /// Returns `None` for patterns that cannot match (e.g. February 30th).
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.after(after).next()
    }
}

impl PartialEq for CronPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for CronPattern {}

impl FromStr for CronPattern {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
