//! Serve command - run the collector service

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::api::{self, ApiState};
use crate::config::Settings;
use crate::engine::{CollectorEngine, StartConfig, StartOutcome};
use crate::storage::{MarketDataRepository, TimescaleOperations};
use crate::symbol::SymbolRegistry;
use crate::telemetry::TelemetryBus;
use crate::validation::DataValidator;
use crate::venue::RestSnapshotSource;

/// Arguments for the serve command
#[derive(Args)]
pub struct ServeArgs {
    /// Symbols to subscribe to (comma-separated); overrides configuration
    #[arg(long, short)]
    pub symbols: Option<String>,

    /// Control plane port; overrides configuration
    #[arg(long)]
    pub port: Option<u16>,

    /// Do not start ingesting until Start is called on the control plane
    #[arg(long)]
    pub no_autostart: bool,
}

/// Execute the serve command
pub async fn execute(args: ServeArgs) -> Result<()> {
    let mut settings = Settings::load().context("configuration error")?;
    if let Some(port) = args.port {
        settings.monitoring.port = port;
    }
    if let Some(ref symbols) = args.symbols {
        settings.symbols.default_symbols = symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    info!("Starting data collector");
    info!("  Venue WS: {}", settings.venue.ws_base);
    info!("  Symbols: {}", settings.symbols.default_symbols.len());
    info!(
        "  Control plane: {}:{}",
        settings.monitoring.bind, settings.monitoring.port
    );

    // Connect eagerly so a broken store fails the process, not the first
    // batch.
    let repo = Arc::new(
        MarketDataRepository::from_settings(&settings.database)
            .await
            .context("store connection failed")?,
    );
    let timescale = TimescaleOperations::new(repo.pool().clone());
    timescale
        .run_migrations()
        .await
        .context("store migration failed")?;
    if let Err(e) = timescale.enable_compression().await {
        // Compression is an optimization; a store without the tooling
        // still ingests correctly.
        warn!("Could not enable compression: {}", e);
    }
    info!("Store connected and migrations applied");

    let registry = Arc::new(
        SymbolRegistry::new(repo.pool().clone(), settings.symbols.venue.clone())
            .await
            .context("symbol registry warm-up failed")?,
    );

    let telemetry = TelemetryBus::default();
    let snapshot_source = Arc::new(
        RestSnapshotSource::new(
            settings.venue.rest_base.clone(),
            settings.venue.depth_snapshot_limit,
            Duration::from_secs(settings.venue.connect_timeout_secs),
        )
        .context("snapshot client construction failed")?,
    );

    let engine = CollectorEngine::new(
        settings.clone(),
        repo.clone(),
        registry,
        telemetry.clone(),
        snapshot_source,
    );
    let validator = Arc::new(DataValidator::new(repo, &settings.validation, telemetry));

    // Control plane.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let addr: SocketAddr = format!("{}:{}", settings.monitoring.bind, settings.monitoring.port)
        .parse()
        .context("invalid control plane bind address")?;
    let api_state = Arc::new(ApiState {
        engine: engine.clone(),
        validator,
        push_interval_secs: settings.monitoring.push_interval_secs,
    });
    let api_task = tokio::spawn(api::serve(api_state, addr, shutdown_rx));

    // Autostart unless the operator wants to drive Start by hand.
    if !args.no_autostart {
        match engine.start(StartConfig::from_settings(&settings)).await {
            StartOutcome::Accepted => info!("Ingestion pipeline started"),
            StartOutcome::AlreadyRunning => {}
            StartOutcome::Invalid(reason) => {
                let _ = shutdown_tx.send(true);
                return Err(::config::ConfigError::Message(reason))
                    .context("start rejected");
            }
        }
    } else {
        info!("Waiting for Start on the control plane");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    info!("Received shutdown signal");

    let outcome = engine.stop().await;
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), api_task).await;

    if !outcome.clean {
        error!("Shutdown was not clean; reporting failure to the supervisor");
        anyhow::bail!("drain deadline exceeded during shutdown");
    }

    info!("Data collector stopped");
    Ok(())
}
