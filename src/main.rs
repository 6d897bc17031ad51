//! Sheet Import Worker - streaming spreadsheet import service
//!
//! Accepts uploaded .xlsx/.csv files over NATS, validates every row and
//! persists valid rows to PostgreSQL in batches while tracking job state
//! in Redis.

mod cli;
mod config;
mod db;
mod defaults;
mod error;
mod handlers;
mod services;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command};
use crate::config::Config;
use crate::services::job_store::{JobStore, MemoryStateStore, StateStore};
use crate::services::orchestrator::{ImportOrchestrator, OrchestratorSettings};
use crate::services::parser::{ParserSettings, StreamingParser};
use crate::services::redis_store::RedisStateStore;
use crate::services::sink::{NatsRowNotifier, NoopNotifier, PgRowSink, RowNotifier};
use crate::services::validation::RowValidator;
use crate::types::{FileMeta, JobStatus};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs directory - use LOGS_DIR env var or default to ../logs (relative to worker)
    let logs_dir = std::env::var("LOGS_DIR")
        .unwrap_or_else(|_| "../logs".to_string());
    std::fs::create_dir_all(&logs_dir).ok();

    // File appender for persistent logs (daily rotation)
    let file_appender = RollingFileAppender::new(
        Rotation::DAILY,
        &logs_dir,
        "import-worker.log",
    );
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Initialize logging - both stdout and file
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,sheet_import_worker=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())  // stdout
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))  // file
        .init();

    info!("Starting Sheet Import Worker...");

    // Load configuration
    let config = Config::from_env()?;
    info!("Configuration loaded");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Migrate => {
            let pool = db::create_pool(&config.database_url).await?;
            db::run_migrations(&pool).await
        }
        Command::Import { file } => import_file(config, file).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    // Connect to database
    let pool = db::create_pool(&config.database_url).await?;
    info!("Connected to PostgreSQL");
    db::run_migrations(&pool).await?;

    let store = connect_store(&config).await?;

    // Connect to NATS (supports optional NATS_USER/NATS_PASSWORD auth).
    let nats_client = match (std::env::var("NATS_USER"), std::env::var("NATS_PASSWORD")) {
        (Ok(user), Ok(password)) if !user.is_empty() => {
            async_nats::ConnectOptions::new()
                .user_and_password(user, password)
                .connect(&config.nats_url)
                .await?
        }
        _ => async_nats::connect(&config.nats_url).await?,
    };
    info!("Connected to NATS at {}", config.nats_url);

    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .with_context(|| format!("cannot create upload directory {}", config.upload_dir.display()))?;

    let notifier: Arc<dyn RowNotifier> = Arc::new(NatsRowNotifier::new(nats_client.clone()));
    let orchestrator = build_orchestrator(&config, store, PgRowSink::new(pool.clone(), notifier));

    handlers::start_handlers(nats_client, orchestrator.clone(), pool, &config).await?;

    orchestrator.shutdown().await;
    info!("All import jobs finished, exiting");
    Ok(())
}

/// One-shot import of a local file through the regular pipeline
async fn import_file(config: Config, file: PathBuf) -> Result<()> {
    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;

    let store = connect_store(&config).await?;
    let orchestrator = build_orchestrator(&config, store, PgRowSink::new(pool, Arc::new(NoopNotifier)));

    let metadata = tokio::fs::metadata(&file)
        .await
        .with_context(|| format!("cannot read {}", file.display()))?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let submitted = orchestrator
        .submit(FileMeta {
            name,
            size: metadata.len(),
            path: file,
        })
        .await?;
    info!("Import job {} started", submitted.job_id);

    let job = submitted.handle.wait().await?;
    println!("{}", serde_json::to_string_pretty(&job)?);

    if job.status == JobStatus::Failed {
        anyhow::bail!("import job {} failed", job.id);
    }
    Ok(())
}

async fn connect_store(config: &Config) -> Result<JobStore> {
    let backend: Arc<dyn StateStore> = if config.uses_memory_store() {
        warn!("Using in-process job store; job state is lost on exit");
        Arc::new(MemoryStateStore::new())
    } else {
        Arc::new(RedisStateStore::connect(&config.redis_url).await?)
    };
    let store = JobStore::new(backend, config.job_retention);
    info!("Job state store ready ({})", store.backend_name());
    Ok(store)
}

fn build_orchestrator(config: &Config, store: JobStore, sink: PgRowSink) -> ImportOrchestrator {
    let parser = StreamingParser::new(
        store.clone(),
        RowValidator::new(config.validation.clone()),
        Arc::new(sink),
        ParserSettings {
            batch_size: config.batch_size,
            progress_interval: config.progress_interval,
            results_dir: config.results_dir.clone(),
        },
    );
    ImportOrchestrator::new(
        store,
        parser,
        OrchestratorSettings {
            max_concurrent_jobs: config.max_concurrent_jobs,
            csv_delimiter: config.csv_delimiter,
            expose_error_detail: config.development,
        },
    )
}
