//! Validate command - one-shot validator run

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use crate::config::Settings;
use crate::storage::MarketDataRepository;
use crate::telemetry::TelemetryBus;
use crate::validation::DataValidator;

/// Arguments for the validate command
#[derive(Args)]
pub struct ValidateArgs {
    /// Print the full per-symbol report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Execute the validate command
pub async fn execute(args: ValidateArgs) -> Result<()> {
    let settings = Settings::load().context("configuration error")?;
    let repo = Arc::new(
        MarketDataRepository::from_settings(&settings.database)
            .await
            .context("store connection failed")?,
    );
    let validator = DataValidator::new(repo, &settings.validation, TelemetryBus::default());

    let report = validator.validate().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "structure: {}",
            if report.structure.passed() { "ok" } else { "FAIL" }
        );
        for verdict in &report.symbols {
            println!(
                "{:<12} freshness: {:<4} quality: {:<4} frequency: {:<4}",
                verdict.symbol,
                if verdict.freshness.passed() { "ok" } else { "FAIL" },
                if verdict.quality.passed() { "ok" } else { "FAIL" },
                if verdict.frequency.passed() { "ok" } else { "FAIL" },
            );
        }
        println!("overall: {}", if report.passed { "PASS" } else { "FAIL" });
    }

    if !report.passed {
        std::process::exit(1);
    }
    Ok(())
}
