use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use redlead::config::Config;
use redlead::context::AppContext;
use redlead::health::{check_readiness, render_text};
use redlead::jobs::http::http_handlers;
use redlead::logging::{setup_tracing, shutdown_signal};
use redlead::queue::QueueRegistry;
use redlead::scheduler::initialize_scheduler;

#[derive(Parser)]
#[command(
    name = "redlead",
    version,
    about = "Recurring job scheduler with queue and cron fallback modes",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// TOML configuration file; environment variables are used when absent
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler and run until interrupted
    Serve,

    /// Print a one-shot readiness report
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = load_config(cli.config.as_ref())?;
    let log_format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());
    setup_tracing(&log_format, &config.logging.level, cli.verbose)?;

    if let Err(e) = redlead::metrics::init_metrics() {
        tracing::warn!("Metrics initialization failed: {}", e);
    }

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Status { format } => status(config, &format).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "redlead starting");

    let ctx = AppContext::initialize(config).await;
    ctx.start_background().await;

    let handlers = http_handlers(&ctx.config, ctx.breakers.clone())?;
    let scheduler = initialize_scheduler(&ctx, &handlers).await?;

    tracing::info!(
        mode = %scheduler.mode(),
        timers = scheduler.armed_timers().len(),
        registered = scheduler.registered_jobs().len(),
        "Scheduler running"
    );

    shutdown_signal().await;

    scheduler.shutdown().await;
    ctx.shutdown().await;

    tracing::info!("redlead stopped");
    Ok(())
}

async fn status(config: Config, format: &str) -> Result<()> {
    let ctx = AppContext::initialize(config).await;
    let registry = QueueRegistry::connect(&ctx.probe, &ctx.config.queue.queue_options());

    let report = check_readiness(&ctx, registry.as_ref()).await;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print!("{}", render_text(&report)),
    }

    Ok(())
}
