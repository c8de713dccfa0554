//! Job handlers that dispatch to the collaborator API over HTTP
//!
//! Each recurring job becomes a `POST {base_url}/{queue}`. Calls go through
//! the `jobs-api` circuit breaker and are retried on transient failures only.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use super::{JobHandler, JobHandlers, JobKind};
use crate::config::Config;
use crate::utils::circuit_breaker::BreakerRegistry;
use crate::utils::error::{is_retryable_error, ExternalError};
use crate::utils::retry::{retry_if, RetryConfig};

/// Breaker name shared by every job dispatch
pub const JOBS_API_SERVICE: &str = "jobs-api";

/// POSTs one recurring job to the collaborator API
pub struct HttpJobHandler {
    kind: JobKind,
    url: String,
    client: reqwest::Client,
    breakers: Arc<BreakerRegistry>,
    retry: RetryConfig,
    timeout: Duration,
}

impl HttpJobHandler {
    pub fn new(
        kind: JobKind,
        base_url: &str,
        client: reqwest::Client,
        breakers: Arc<BreakerRegistry>,
        retry: RetryConfig,
        timeout: Duration,
    ) -> Self {
        let url = format!("{}/{}", base_url.trim_end_matches('/'), kind.queue_name());
        Self {
            kind,
            url,
            client,
            breakers,
            retry,
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post_once(&self) -> Result<(), ExternalError> {
        let definition = self.kind.definition();
        let body = serde_json::json!({
            "job": definition.job_name,
            "queue": definition.queue,
            "triggered_at": chrono::Utc::now().to_rfc3339(),
        });

        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExternalError::status(JOBS_API_SERVICE, status.as_u16()));
        }

        debug!(status = status.as_u16(), "Job dispatch accepted");
        Ok(())
    }
}

#[async_trait]
impl JobHandler for HttpJobHandler {
    #[instrument(skip(self), fields(queue = %self.kind))]
    async fn run(&self) -> anyhow::Result<()> {
        let result = self
            .breakers
            .execute(JOBS_API_SERVICE, || {
                retry_if(&self.retry, || self.post_once(), is_retryable_error::<ExternalError>)
            })
            .await;

        result.map_err(|e| anyhow::Error::new(e).context(format!("{} dispatch failed", self.kind)))
    }
}

/// HTTP handlers for all six jobs sharing one client
pub fn http_handlers(config: &Config, breakers: Arc<BreakerRegistry>) -> anyhow::Result<JobHandlers> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("redlead/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let retry = config.retry.to_retry_config();
    let timeout = config.request_timeout();

    let mut handlers = JobHandlers::new();
    for kind in JobKind::ALL {
        handlers.insert(
            kind,
            Arc::new(HttpJobHandler::new(
                kind,
                &config.jobs.base_url,
                client.clone(),
                Arc::clone(&breakers),
                retry.clone(),
                timeout,
            )),
        );
    }

    Ok(handlers)
}
