//! redlead - job scheduling, caching and resilience layer
//!
//! Keeps recurring lead-discovery work running whether or not the shared
//! Redis store is reachable.
//!
//! # Architecture
//!
//! - [`store`] - Redis pool and availability probe
//! - [`cache`] - Cache over Redis with transparent in-process fallback
//! - [`utils`] - Circuit breaker and retry utilities
//! - [`queue`] - Durable, prioritized, retrying job queues and workers
//! - [`jobs`] - The six recurring jobs and their handlers
//! - [`scheduler`] - Queue-or-cron mode selection and the cron fallback
//! - [`context`] - Process-scoped state built once at startup
//! - [`health`] - Readiness report
//! - [`config`] - Configuration from environment or TOML
//!
//! # Example
//!
//! ```no_run
//! use redlead::config::Config;
//! use redlead::context::AppContext;
//! use redlead::jobs::http::http_handlers;
//! use redlead::scheduler::initialize_scheduler;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let ctx = AppContext::initialize(config).await;
//!     let handlers = http_handlers(&ctx.config, ctx.breakers.clone())?;
//!     let scheduler = initialize_scheduler(&ctx, &handlers).await?;
//!     scheduler.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::Cache;
    pub use crate::config::Config;
    pub use crate::context::AppContext;
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::jobs::{JobHandler, JobHandlers, JobKind};
    pub use crate::scheduler::{initialize_scheduler, SchedulerHandle, SchedulerMode};
    pub use crate::utils::circuit_breaker::{BreakerError, BreakerRegistry};
    pub use crate::utils::retry::{retry, retry_http, RetryConfig};
}
