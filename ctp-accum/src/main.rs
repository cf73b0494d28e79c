//! ctp-accum - Cloud-top persistence accumulator
//!
//! Waits for the first frames to land in the inbox, bootstraps the window
//! from them, then folds in every new scan as it arrives. The running sum
//! is exported to `<workdir>/persistence.json` and served at `/snapshot`.

use anyhow::{Context, Result};
use clap::Parser;
use ctp_accum::inbox::{start_trigger, wait_for_initial_frames};
use ctp_accum::snapshot::SnapshotExporter;
use ctp_accum::{
    AccumulationService, AccumulationWindow, AppState, CommandDecoder, PreprocessSettings,
    Preprocessor, ReferenceGrid,
};
use ctp_common::config::{Config, CONFIG_ENV_VAR};
use ctp_common::logging::init_tracing;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "ctp-accum", version, about = "Sliding-window cloud-top persistence")]
struct Args {
    /// Configuration file
    #[arg(short, long, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Snapshot server bind address (overrides server.accum_bind)
    #[arg(long)]
    bind: Option<String>,

    /// Do not start the snapshot server
    #[arg(long)]
    no_server: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;

    init_tracing(&config.logging).context("failed to initialize logging")?;

    info!(
        "Starting ctp-accum v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    match Config::locate(args.config.as_deref()) {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => warn!("No configuration file found, running on compiled defaults"),
    }

    let accum = &config.accumulation;
    let inbox = config.inbox_dir();
    let workdir = config.workdir();
    for dir in [&inbox, &workdir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let grid = ReferenceGrid::load(
        &config.resolve(&accum.reference_lons),
        &config.resolve(&accum.reference_lats),
        accum.reference_resolution_km,
    )
    .context("failed to load reference grid")?;
    let settings = PreprocessSettings::from_config(accum).context("invalid accumulation region")?;
    info!(
        region = ?accum.region,
        bounds = ?settings.bounds,
        threshold_celsius = settings.threshold_celsius,
        window = accum.window_size,
        grid = ?grid.shape(),
        "Accumulation configured"
    );

    let decoder = Arc::new(CommandDecoder::new(
        accum.decoder_command.clone(),
        accum.decoder_args.clone(),
        workdir.join("scratch"),
    ));
    let preprocessor = Preprocessor::new(grid, decoder, settings);
    let window = AccumulationWindow::new(accum.window_size, accum.hours_per_frame()).shared();
    let mut service = AccumulationService::new(preprocessor, window.clone(), SnapshotExporter::new(&workdir));

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

    let server = if args.no_server {
        None
    } else {
        let bind = args.bind.unwrap_or_else(|| config.server.accum_bind.clone());
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .with_context(|| format!("failed to bind {bind}"))?;
        info!("Snapshot: http://{}/snapshot", bind);

        let state = AppState::new(window, service.subscribe(), accum.threshold_celsius);
        let app = ctp_accum::build_router(state);
        let shutdown = cancel.clone();
        Some(tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "Snapshot server failed");
            }
        }))
    };

    // Start listening before the bootstrap so nothing landing meanwhile is missed
    let (rx, _trigger) = start_trigger(
        accum.trigger,
        &inbox,
        Duration::from_secs(accum.inbox_poll_secs.max(1)),
        cancel.clone(),
    )
    .context("failed to start inbox trigger")?;

    let initial = wait_for_initial_frames(
        &inbox,
        accum.initial_frames,
        Duration::from_secs(accum.startup_poll_secs.max(1)),
        &cancel,
    )
    .await
    .context("failed to scan inbox")?;

    let outcome = match initial {
        Some(paths) => run_service(&mut service, &paths, &inbox, rx, &cancel).await,
        None => Ok(()),
    };

    cancel.cancel();
    if let Some(server) = server {
        let _ = server.await;
    }

    outcome
}

async fn run_service(
    service: &mut AccumulationService,
    initial: &[PathBuf],
    inbox: &std::path::Path,
    rx: tokio::sync::mpsc::Receiver<PathBuf>,
    cancel: &CancellationToken,
) -> Result<()> {
    service
        .bootstrap(initial)
        .await
        .context("bootstrap failed")?;
    service.catch_up(inbox).await.context("inbox catch-up failed")?;
    service.run(rx, cancel).await.context("accumulation stopped")?;
    info!("Accumulation finished");
    Ok(())
}
