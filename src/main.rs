//! diskio-aware: disk I/O bandwidth admission service.
//!
//! Keeps an in-memory ledger of per-device bandwidth for every node,
//! answers filter/score/reserve calls from the scheduler, and reconciles
//! reservations into per-node records in the background.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use diskio_aware::config::{Cli, Config};
use diskio_aware::engine::AdmissionEngine;
use diskio_aware::server::api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "diskio_aware=debug,tower_http=debug"
    } else {
        "diskio_aware=info,tower_http=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());

    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("diskio-aware v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;

    info!(
        strategy = %config.scoring.strategy,
        max_score = config.scoring.max_score,
        workers = config.reconcile.workers,
        max_attempts = config.reconcile.max_attempts,
        qps = config.reconcile.qps,
        burst = config.reconcile.burst,
        "Configuration loaded"
    );

    // Build the engine and start reconciling.
    let engine = Arc::new(AdmissionEngine::from_config(&config)?);
    engine.start();

    let state = Arc::new(AppState {
        engine: engine.clone(),
        start_time: Instant::now(),
    });
    let app = build_router(state);

    // Start the server.
    let listen_addr = cli.listen.unwrap_or(config.server.listen);
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let queued reconciles finish before exiting.
    engine.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
