//! ctp-ingest - Scan ingestion service
//!
//! Mirrors hourly scan buckets from the public archive into the local inbox,
//! resuming from the download ledger after a restart. Serves `/health` and
//! `/status` while running.

use anyhow::{Context, Result};
use clap::Parser;
use ctp_common::config::{Config, CONFIG_ENV_VAR};
use ctp_common::logging::init_tracing;
use ctp_ingest::clock::TokioClock;
use ctp_ingest::fetch_pool::clean_partials;
use ctp_ingest::s3::S3HttpStore;
use ctp_ingest::{AppState, IngestScheduler, Ledger, LedgerLoad};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "ctp-ingest", version, about = "Resumable scan ingestion")]
struct Args {
    /// Configuration file
    #[arg(short, long, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Status server bind address (overrides server.ingest_bind)
    #[arg(long)]
    bind: Option<String>,

    /// Do not start the status server
    #[arg(long)]
    no_server: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;

    init_tracing(&config.logging).context("failed to initialize logging")?;

    info!(
        "Starting ctp-ingest v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    match Config::locate(args.config.as_deref()) {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => warn!("No configuration file found, running on compiled defaults"),
    }

    let inbox = config.inbox_dir();
    let temp = config.temp_dir();
    let ledger_path = config.ledger_path();
    for dir in [&inbox, &temp] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    info!(inbox = %inbox.display(), temp = %temp.display(), ledger = %ledger_path.display(), "Directories ready");

    clean_partials(&temp).await.context("failed to clean temp directory")?;

    let (ledger, load) = Ledger::open_shared(&ledger_path)
        .await
        .context("failed to open download ledger")?;
    if let LedgerLoad::Reset { reason } = &load {
        warn!(reason = %reason, "Ledger was reset; ingestion restarts from the configured start");
    }

    let store = Arc::new(S3HttpStore::new(&config.remote).context("failed to build remote client")?);
    info!(
        remote = %config.remote.base_url,
        product = %config.remote.product,
        bands = ?config.download.bands,
        workers = config.download.max_workers,
        "Remote store configured"
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    let mut scheduler = IngestScheduler::new(
        &config,
        store,
        ledger,
        Arc::new(TokioClock),
        cancel.clone(),
    )
    .await
    .context("failed to initialize scheduler")?;

    let server = if args.no_server {
        None
    } else {
        let bind = args.bind.unwrap_or_else(|| config.server.ingest_bind.clone());
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .with_context(|| format!("failed to bind {bind}"))?;
        info!("Status: http://{}/status", bind);

        let app = ctp_ingest::build_router(AppState::new(scheduler.subscribe()));
        let shutdown = cancel.clone();
        Some(tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "Status server failed");
            }
        }))
    };

    scheduler.run().await;
    info!(bucket = %scheduler.current_bucket(), "Ingestion finished");

    cancel.cancel();
    if let Some(server) = server {
        let _ = server.await;
    }

    Ok(())
}
