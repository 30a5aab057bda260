//! Database management commands

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tracing::info;

use crate::config::Settings;
use crate::storage::{MarketDataRepository, RetentionManager, TimescaleOperations};
use crate::telemetry::TelemetryBus;

/// Database subcommands
#[derive(Subcommand)]
pub enum DbCommands {
    /// Run database migrations
    Migrate(MigrateArgs),
    /// Show database statistics
    Stats(StatsArgs),
    /// Apply retention and compression policies once
    Retention(RetentionArgs),
}

/// Arguments for migrate command
#[derive(Args)]
pub struct MigrateArgs {
    /// Enable compression after migration
    #[arg(long)]
    pub enable_compression: bool,
}

/// Arguments for stats command
#[derive(Args)]
pub struct StatsArgs {
    /// Show per-symbol activity over the last hour
    #[arg(long, short)]
    pub verbose: bool,
}

/// Arguments for the retention command
#[derive(Args)]
pub struct RetentionArgs {}

/// Execute a database subcommand
pub async fn execute(cmd: DbCommands) -> Result<()> {
    let settings = Settings::load().context("configuration error")?;
    let repo = MarketDataRepository::from_settings(&settings.database)
        .await
        .context("store connection failed")?;
    let timescale = TimescaleOperations::new(repo.pool().clone());

    match cmd {
        DbCommands::Migrate(args) => {
            timescale.run_migrations().await?;
            if args.enable_compression {
                timescale.enable_compression().await?;
            }
            info!("Migrations applied");
        }
        DbCommands::Stats(args) => {
            for table in [
                "book_ticker",
                "trades",
                "depth_events",
                "mark_price",
                "force_orders",
                "bt_1s",
                "trade_1s",
            ] {
                let (count, earliest, latest) = repo.table_overview(table).await?;
                println!(
                    "{:<14} {:>12} rows   {} .. {}",
                    table,
                    count,
                    earliest.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
                    latest.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
                );
            }

            let compression = timescale.compression_stats().await?;
            println!(
                "chunks: {} compressed, {} uncompressed",
                compression.compressed_chunks, compression.uncompressed_chunks
            );

            if args.verbose {
                let stats = repo.database_stats().await?;
                for (symbol, tables) in &stats.per_symbol {
                    for t in tables {
                        println!(
                            "{:<12} {:<14} 1h: {:>9}  1m: {:>7}  last: {}",
                            symbol,
                            t.table,
                            t.count_last_hour,
                            t.count_last_minute,
                            t.last_seen
                                .map(|ts| ts.to_rfc3339())
                                .unwrap_or_else(|| "-".into()),
                        );
                    }
                }
            }
        }
        DbCommands::Retention(_) => {
            let manager = RetentionManager::new(
                Arc::new(timescale),
                &settings.retention,
                TelemetryBus::default(),
            );
            manager.apply_all().await;
            info!("Retention policies applied");
        }
    }

    Ok(())
}
