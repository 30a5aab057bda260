//! Command-line interface
//!
//! Provides CLI commands for the collector.

pub mod db;
pub mod serve;
pub mod validate;

use clap::{Parser, Subcommand};

/// Data Collector CLI
#[derive(Parser)]
#[command(name = "data-collector")]
#[command(about = "Market data ingestion engine for Binance USDT-M futures")]
#[command(version)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the collector service and control plane
    Serve(serve::ServeArgs),
    /// Database operations
    #[command(subcommand)]
    Db(db::DbCommands),
    /// Run the data validator once and print the report
    Validate(validate::ValidateArgs),
}
