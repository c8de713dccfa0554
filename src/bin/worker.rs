use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use redlead::config::Config;
use redlead::jobs::http::http_handlers;
use redlead::jobs::{HandlerProcessor, JobKind};
use redlead::logging::{setup_tracing, shutdown_signal};
use redlead::queue::{create_worker, QueueRegistry};
use redlead::store::StoreProbe;
use redlead::utils::circuit_breaker::BreakerRegistry;

#[derive(Parser)]
#[command(
    name = "redlead-worker",
    version,
    about = "Processes recurring jobs from the Redis-backed queues",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long)]
    log_format: Option<String>,

    /// TOML configuration file; environment variables are used when absent
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::from_env()?,
    };
    config.validate()?;

    let log_format = cli.log_format.unwrap_or_else(|| config.logging.format.clone());
    setup_tracing(&log_format, &config.logging.level, cli.verbose)?;

    if let Err(e) = redlead::metrics::init_metrics() {
        tracing::warn!("Metrics initialization failed: {}", e);
    }

    let probe = Arc::new(StoreProbe::initialize(&config.store).await);
    if !probe.is_available() {
        tracing::error!("Redis is not available; the worker has no degraded mode, exiting");
        std::process::exit(1);
    }

    let breakers = Arc::new(BreakerRegistry::new(config.breaker.to_breaker_config()));
    let handlers = http_handlers(&config, breakers)?;

    let Some(registry) = QueueRegistry::connect(&probe, &config.queue.queue_options()) else {
        tracing::error!("Redis became unavailable while creating queues, exiting");
        std::process::exit(1);
    };

    let options = config.queue.worker_options();
    for kind in JobKind::ALL {
        let processor = Arc::new(HandlerProcessor::new(handlers.require(kind)?));
        match create_worker(&probe, kind.queue_name(), processor, options.clone()) {
            Some(worker) => registry.attach(worker).await,
            None => {
                tracing::error!(queue = kind.queue_name(), "Failed to start worker, exiting");
                registry.close_all().await;
                std::process::exit(1);
            }
        }
    }

    tracing::info!(
        workers = registry.worker_handles().await,
        concurrency = options.concurrency,
        "redlead-worker running"
    );

    shutdown_signal().await;

    // Workers drain before their queues close
    registry.close_all().await;

    tracing::info!("redlead-worker stopped");
    Ok(())
}
