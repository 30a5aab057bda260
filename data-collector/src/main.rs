//! Data Collector CLI
//!
//! Provides commands for:
//! - `serve`: Run the collector service and control plane
//! - `db`: Database operations (migrate, stats, retention)
//! - `validate`: One-shot validator run
//!
//! # Logging Configuration
//!
//! Configure via environment variables:
//! - `RUST_LOG`: Log filter (e.g., "data_collector=debug,sqlx=info")
//! - `LOG_FORMAT`: Output format ("pretty", "compact", "json")
//! - `LOG_TIMESTAMPS`: Timestamp format ("local", "utc", "none")
//!
//! # Exit codes
//!
//! 0 on a normal stop, 2 on configuration errors, 3 on fatal store
//! errors, 1 otherwise.

use anyhow::Result;
use clap::Parser;
use market_common::logging::{init_logging, LogConfig};

use data_collector::cli::{Cli, Commands};
use data_collector::storage::RepositoryError;

#[tokio::main]
async fn main() {
    // Initialize logging with standardized configuration
    let log_config = LogConfig::from_env()
        .with_app_name("data-collector")
        .with_default_level("data_collector=info,sqlx=warn");

    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        tracing::error!("{:#}", e);
        std::process::exit(exit_code_for(&e));
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve(args) => data_collector::cli::serve::execute(args).await,
        Commands::Db(cmd) => data_collector::cli::db::execute(cmd).await,
        Commands::Validate(args) => data_collector::cli::validate::execute(args).await,
    }
}

/// Map error kinds onto the exit codes the process supervisor watches.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.downcast_ref::<config::ConfigError>().is_some() {
            return 2;
        }
        if cause.downcast_ref::<RepositoryError>().is_some()
            || cause.downcast_ref::<sqlx::Error>().is_some()
        {
            return 3;
        }
    }
    1
}
