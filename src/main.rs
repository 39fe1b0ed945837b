//! Clearwell - Water Treatment Decision Support
//!
//! Backfills Pre-Lime, Post-Lime, Classification and Regression decisions
//! for every raw-water sensor reading and serves them over HTTP.
//!
//! # Usage
//!
//! ```bash
//! # Scheduler + HTTP API (default)
//! cargo run --release
//!
//! # Load readings, one JSON object per line
//! ./clearwell ingest --file readings.jsonl
//! cat readings.jsonl | ./clearwell ingest
//!
//! # Single backfill cycle, report printed as JSON
//! ./clearwell backfill-once
//! ```
//!
//! # Environment Variables
//!
//! - `CLEARWELL_CONFIG`: Path to a `clearwell.toml` (default: `./clearwell.toml`)
//! - `CLEARWELL_INTERVAL_SECS`: Scheduler interval override
//! - `CLEARWELL_CORS_ORIGINS`: Comma-separated allowed origins for the API
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use clearwell::api::create_app;
use clearwell::config::ClearwellConfig;
use clearwell::ingest::ingest_lines;
use clearwell::{
    BackfillScheduler, InMemoryStore, ModelRegistry, PersistentStore, PipelineContext,
    PipelineSettings, SledStore,
};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "clearwell")]
#[command(about = "Clearwell water treatment decision support and sensor backfill")]
#[command(version)]
struct CliArgs {
    /// Override the server address (default: "0.0.0.0:8080")
    #[arg(short, long, value_name = "HOST:PORT")]
    addr: Option<String>,

    /// Directory holding the JSON model artifacts
    #[arg(long, value_name = "DIR")]
    models: Option<PathBuf>,

    /// Sled database directory
    #[arg(long, value_name = "DIR")]
    data: Option<PathBuf>,

    /// Keep everything in memory. Nothing survives a restart.
    #[arg(long)]
    in_memory: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<SubCommand>,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Run the backfill scheduler and HTTP API until Ctrl+C (default)
    Serve,

    /// Insert sensor readings from a JSON-lines file, or stdin
    Ingest {
        /// Path to the readings file; omit to read stdin
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Run a single backfill cycle and print the cycle report
    BackfillOnce,
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    HttpServer,
    BackfillScheduler,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HttpServer => write!(f, "HttpServer"),
            Self::BackfillScheduler => write!(f, "BackfillScheduler"),
        }
    }
}

// ============================================================================
// Initialization
// ============================================================================

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

/// Config file/env, then CLI flags on top.
fn resolve_config(args: &CliArgs) -> ClearwellConfig {
    let mut config = ClearwellConfig::load();
    if let Some(addr) = &args.addr {
        config.server.addr.clone_from(addr);
    }
    if let Some(models) = &args.models {
        config.models.dir.clone_from(models);
    }
    if let Some(data) = &args.data {
        config.storage.path.clone_from(data);
    }
    config
}

fn open_store(config: &ClearwellConfig, in_memory: bool) -> Result<Arc<dyn PersistentStore>> {
    if in_memory {
        warn!("Using in-memory store: readings and predictions are lost on exit");
        return Ok(Arc::new(InMemoryStore::new()));
    }
    if let Some(parent) = config.storage.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create data directory {}", parent.display())
            })?;
        }
    }
    let store = SledStore::open(&config.storage.path).with_context(|| {
        format!("Failed to open store at {}", config.storage.path.display())
    })?;
    Ok(Arc::new(store))
}

/// Store, models and settings. Model loading is fail-fast.
fn init_context(config: &ClearwellConfig, in_memory: bool) -> Result<PipelineContext> {
    let store = open_store(config, in_memory)?;
    let models = ModelRegistry::load(&config.models.dir).with_context(|| {
        format!("Failed to load model artifacts from {}", config.models.dir.display())
    })?;
    Ok(PipelineContext::new(
        store,
        Arc::new(models),
        PipelineSettings::from(config),
    ))
}

// ============================================================================
// Subcommands
// ============================================================================

async fn run_ingest(ctx: &PipelineContext, file: Option<PathBuf>) -> Result<()> {
    let guard = ctx.guard();
    let summary = match file {
        Some(path) => {
            info!(path = %path.display(), "Ingesting readings from file");
            let f = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            ingest_lines(BufReader::new(f), &guard).await?
        }
        None => {
            info!("Ingesting readings from stdin");
            ingest_lines(BufReader::new(tokio::io::stdin()), &guard).await?
        }
    };
    info!(
        inserted = summary.inserted,
        rejected = summary.rejected,
        "Ingest complete"
    );
    Ok(())
}

async fn run_backfill_once(ctx: PipelineContext) -> Result<()> {
    let scheduler = BackfillScheduler::new(ctx);
    let report = scheduler.run_once().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ============================================================================
// Serve: supervised scheduler + HTTP server
// ============================================================================

/// Spawn the HTTP server task into the JoinSet.
fn spawn_http_server(
    task_set: &mut JoinSet<Result<TaskName>>,
    listener: tokio::net::TcpListener,
    app: axum::Router,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        info!("[HttpServer] Task starting");

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                info!("[HttpServer] Received shutdown signal");
            })
            .await;

        match result {
            Ok(()) => {
                info!("[HttpServer] Graceful shutdown complete");
                Ok(TaskName::HttpServer)
            }
            Err(e) => {
                error!("[HttpServer] Server error: {}", e);
                Err(anyhow::anyhow!("HTTP server error: {}", e))
            }
        }
    });
}

fn spawn_scheduler(
    task_set: &mut JoinSet<Result<TaskName>>,
    ctx: PipelineContext,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        BackfillScheduler::new(ctx).run(cancel_token).await;
        Ok(TaskName::BackfillScheduler)
    });
}

/// Run the supervisor loop: monitor tasks, cancel on failure.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("🔒 Supervisor: All tasks spawned, monitoring...");

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("🛑 Supervisor: Shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!("🔒 Supervisor: Task {} completed normally", task_name);
                    }
                    Some(Ok(Err(e))) => {
                        error!("🔒 Supervisor: Task failed with error: {}", e);
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!("🔒 Supervisor: Task panicked: {}", e);
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {}", e));
                    }
                    None => {
                        info!("🔒 Supervisor: All tasks completed");
                        break;
                    }
                }
            }
        }
    }

    // Let in-flight cycles and requests finish.
    while let Some(result) = task_set.join_next().await {
        if let Ok(Ok(task_name)) = result {
            info!("🔒 Supervisor: Task {} stopped", task_name);
        }
    }

    Ok(())
}

async fn run_serve(ctx: PipelineContext, config: &ClearwellConfig, cancel_token: CancellationToken) -> Result<()> {
    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    if config.server.enabled {
        let listener = tokio::net::TcpListener::bind(&config.server.addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.server.addr))?;
        info!(addr = %config.server.addr, "🌐 HTTP API listening");
        spawn_http_server(&mut task_set, listener, create_app(ctx.clone()), cancel_token.clone());
    } else {
        info!("HTTP API disabled ([server] enabled = false)");
    }

    spawn_scheduler(&mut task_set, ctx, cancel_token.clone());

    run_supervisor(&mut task_set, cancel_token).await
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_json);

    let config = resolve_config(&args);
    config.validate().context("Invalid configuration")?;
    info!(
        interval_secs = config.scheduler.interval_secs,
        window_limit = config.scanner.window_limit,
        max_concurrent_records = config.pipeline.max_concurrent_records,
        post_lime_input = %config.pipeline.post_lime_input,
        use_watermark = config.pipeline.use_watermark,
        "Configuration resolved"
    );

    let ctx = init_context(&config, args.in_memory)?;
    info!(store = ctx.store.backend_name(), "📦 Pipeline context ready");

    let result = match args.command.unwrap_or(SubCommand::Serve) {
        SubCommand::Ingest { file } => run_ingest(&ctx, file).await,
        SubCommand::BackfillOnce => run_backfill_once(ctx.clone()).await,
        SubCommand::Serve => {
            // Graceful shutdown via Ctrl+C
            let cancel_token = CancellationToken::new();
            let shutdown_token = cancel_token.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("🛑 Received Ctrl+C, initiating shutdown...");
                shutdown_token.cancel();
            });
            run_serve(ctx.clone(), &config, cancel_token).await
        }
    };

    if let Err(e) = ctx.store.flush() {
        warn!(error = %e, "Store flush on exit failed");
    }

    if result.is_ok() {
        info!("✓ Clearwell shutdown complete");
    }
    result
}
