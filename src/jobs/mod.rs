//! Recurring job catalogue and handler bindings
//!
//! The six recurring jobs are fixed: each has a queue, a job name, a cron
//! pattern and a priority (lower is served first). The job bodies themselves
//! live outside this crate; a [`JobHandler`] is the opaque unit of work the
//! scheduler or a worker invokes, and only its success and duration matter.

pub mod http;

pub use http::HttpJobHandler;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::queue::{Job, JobProcessor};
use crate::scheduler::error::{SchedulerError, SchedulerResult};

/// The recurring jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    LeadDiscovery,
    SubredditAnalysis,
    ReplyTracking,
    PerformanceTracking,
    MarketInsight,
    TrialExpiration,
}

/// Static description of one recurring job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobDefinition {
    pub kind: JobKind,
    /// Queue the job is enqueued on
    pub queue: &'static str,
    /// Job name within the queue
    pub job_name: &'static str,
    /// Five-field cron pattern
    pub pattern: &'static str,
    /// Lower number is served first
    pub priority: u32,
}

/// All recurring jobs, in declaration order
pub const JOB_DEFINITIONS: [JobDefinition; 6] = [
    JobDefinition {
        kind: JobKind::LeadDiscovery,
        queue: "lead-discovery",
        job_name: "discover-leads",
        pattern: "*/15 * * * *",
        priority: 1,
    },
    JobDefinition {
        kind: JobKind::SubredditAnalysis,
        queue: "subreddit-analysis",
        job_name: "analyze-subreddits",
        pattern: "0 2 * * *",
        priority: 3,
    },
    JobDefinition {
        kind: JobKind::ReplyTracking,
        queue: "reply-tracking",
        job_name: "track-pending-replies",
        pattern: "* * * * *",
        priority: 2,
    },
    JobDefinition {
        kind: JobKind::PerformanceTracking,
        queue: "performance-tracking",
        job_name: "track-performance",
        pattern: "0 * * * *",
        priority: 4,
    },
    JobDefinition {
        kind: JobKind::MarketInsight,
        queue: "market-insight",
        job_name: "discover-insights",
        pattern: "5 * * * *",
        priority: 3,
    },
    JobDefinition {
        kind: JobKind::TrialExpiration,
        queue: "trial-expiration",
        job_name: "expire-trials",
        pattern: "0 3 * * *",
        priority: 4,
    },
];

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        JobKind::LeadDiscovery,
        JobKind::SubredditAnalysis,
        JobKind::ReplyTracking,
        JobKind::PerformanceTracking,
        JobKind::MarketInsight,
        JobKind::TrialExpiration,
    ];

    pub fn definition(&self) -> &'static JobDefinition {
        // JOB_DEFINITIONS is declared in the same order as the variants
        &JOB_DEFINITIONS[*self as usize]
    }

    pub fn queue_name(&self) -> &'static str {
        self.definition().queue
    }

    pub fn from_queue(queue: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.queue_name() == queue)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.queue_name())
    }
}

/// Opaque unit of work behind a recurring job
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self) -> anyhow::Result<()> {
        (self)().await
    }
}

/// Handlers keyed by job
#[derive(Clone, Default)]
pub struct JobHandlers {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl JobHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler, replacing any previous one for `kind`
    pub fn with(mut self, kind: JobKind, handler: impl JobHandler + 'static) -> Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn insert(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Handler for `kind`, or a missing-handler error
    pub fn require(&self, kind: JobKind) -> SchedulerResult<Arc<dyn JobHandler>> {
        self.get(kind)
            .ok_or_else(|| SchedulerError::missing_handler(kind.definition().job_name))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for JobHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().map(|k| k.queue_name()).collect();
        kinds.sort_unstable();
        f.debug_struct("JobHandlers").field("kinds", &kinds).finish()
    }
}

/// Adapts a [`JobHandler`] to a queue worker; job data is ignored
pub struct HandlerProcessor {
    handler: Arc<dyn JobHandler>,
}

impl HandlerProcessor {
    pub fn new(handler: Arc<dyn JobHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl JobProcessor for HandlerProcessor {
    async fn process(&self, _job: &Job) -> anyhow::Result<()> {
        self.handler.run().await
    }
}
