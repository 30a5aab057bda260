//! Symbol-level data validator.
//!
//! The SQL fetch and the verdict logic are separate: `evaluate` is a pure
//! function over the fetched health rows, so the thresholds can be tested
//! without a store.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::config::ValidationSettings;
use crate::storage::{MarketDataRepository, RepositoryResult, SymbolHealthRow};
use crate::telemetry::{TelemetryBus, TelemetryEvent};

/// Outcome of one check for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum CheckOutcome {
    Pass,
    Fail(String),
}

impl CheckOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, CheckOutcome::Pass)
    }
}

/// Verdict for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolVerdict {
    pub symbol_id: i64,
    pub symbol: String,
    pub freshness: CheckOutcome,
    pub quality: CheckOutcome,
    pub frequency: CheckOutcome,
    pub passed: bool,
}

/// Full validation report.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub generated_at: DateTime<Utc>,
    pub structure: CheckOutcome,
    pub symbols: Vec<SymbolVerdict>,
    pub passed: bool,
}

/// Thresholds, derived from settings.
#[derive(Debug, Clone)]
pub struct ValidationThresholds {
    pub freshness: ChronoDuration,
    pub frequency_window: ChronoDuration,
    pub min_events_per_minute: u64,
    pub quality_window: ChronoDuration,
}

impl From<&ValidationSettings> for ValidationThresholds {
    fn from(s: &ValidationSettings) -> Self {
        Self {
            freshness: ChronoDuration::seconds(s.freshness_secs as i64),
            frequency_window: ChronoDuration::seconds(s.frequency_window_secs as i64),
            min_events_per_minute: s.min_events_per_minute,
            quality_window: ChronoDuration::seconds(s.quality_window_secs as i64),
        }
    }
}

/// Evaluate one symbol's health rows against the thresholds.
pub fn evaluate(
    health: &SymbolHealthRow,
    thresholds: &ValidationThresholds,
    now: DateTime<Utc>,
) -> SymbolVerdict {
    let freshness = match health.last_event {
        Some(last) if now - last <= thresholds.freshness => CheckOutcome::Pass,
        Some(last) => CheckOutcome::Fail(format!(
            "last event {}s ago (limit {}s)",
            (now - last).num_seconds(),
            thresholds.freshness.num_seconds()
        )),
        None => CheckOutcome::Fail("no events observed".to_string()),
    };

    let quality = {
        let mut problems = Vec::new();
        if health.inverted_books > 0 {
            problems.push(format!("{} inverted books", health.inverted_books));
        }
        if health.nonpositive_rows > 0 {
            problems.push(format!(
                "{} non-positive prices or quantities",
                health.nonpositive_rows
            ));
        }
        if health.null_rows > 0 {
            problems.push(format!("{} null mandatory columns", health.null_rows));
        }
        if problems.is_empty() {
            CheckOutcome::Pass
        } else {
            CheckOutcome::Fail(problems.join(", "))
        }
    };

    let minutes = thresholds.frequency_window.num_minutes().max(1) as u64;
    let required = thresholds.min_events_per_minute * minutes;
    let frequency = if health.events_in_frequency_window >= required {
        CheckOutcome::Pass
    } else {
        CheckOutcome::Fail(format!(
            "{} events in last {} minutes (need {})",
            health.events_in_frequency_window, minutes, required
        ))
    };

    let passed = freshness.passed() && quality.passed() && frequency.passed();
    SymbolVerdict {
        symbol_id: health.symbol_id,
        symbol: health.symbol.clone(),
        freshness,
        quality,
        frequency,
        passed,
    }
}

/// Validator wired to the store.
pub struct DataValidator {
    repo: Arc<MarketDataRepository>,
    thresholds: ValidationThresholds,
    telemetry: TelemetryBus,
}

impl DataValidator {
    pub fn new(
        repo: Arc<MarketDataRepository>,
        settings: &ValidationSettings,
        telemetry: TelemetryBus,
    ) -> Self {
        Self {
            repo,
            thresholds: ValidationThresholds::from(settings),
            telemetry,
        }
    }

    /// Run all checks and produce a report.
    pub async fn validate(&self) -> RepositoryResult<ValidationReport> {
        let missing = self.repo.check_structure().await?;
        let structure = if missing.is_empty() {
            CheckOutcome::Pass
        } else {
            CheckOutcome::Fail(format!("missing tables: {}", missing.join(", ")))
        };

        let health = self
            .repo
            .fetch_symbol_health(self.thresholds.frequency_window, self.thresholds.quality_window)
            .await?;

        let now = Utc::now();
        let symbols: Vec<SymbolVerdict> = health
            .iter()
            .map(|h| evaluate(h, &self.thresholds, now))
            .collect();

        let failed = symbols.iter().filter(|s| !s.passed).count();
        let passed = structure.passed() && failed == 0;

        info!(
            symbols = symbols.len(),
            failed, passed, "Validation completed"
        );
        self.telemetry.publish(TelemetryEvent::ValidationCompleted {
            passed,
            failed_symbols: failed,
        });

        Ok(ValidationReport {
            generated_at: now,
            structure,
            symbols,
            passed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> ValidationThresholds {
        ValidationThresholds::from(&ValidationSettings::default())
    }

    fn healthy(now: DateTime<Utc>) -> SymbolHealthRow {
        SymbolHealthRow {
            symbol_id: 1,
            symbol: "BTCUSDT".to_string(),
            last_event: Some(now - ChronoDuration::seconds(2)),
            events_in_frequency_window: 600,
            inverted_books: 0,
            nonpositive_rows: 0,
            null_rows: 0,
        }
    }

    #[test]
    fn test_healthy_symbol_passes() {
        let now = Utc::now();
        let verdict = evaluate(&healthy(now), &thresholds(), now);
        assert!(verdict.passed);
        assert!(verdict.freshness.passed());
        assert!(verdict.quality.passed());
        assert!(verdict.frequency.passed());
    }

    #[test]
    fn test_six_minute_idle_symbol_fails_freshness_only() {
        let now = Utc::now();
        let mut health = healthy(now);
        health.last_event = Some(now - ChronoDuration::minutes(6));
        let verdict = evaluate(&health, &thresholds(), now);
        assert!(!verdict.passed);
        assert!(!verdict.freshness.passed());
        // Quality still passes; the symbol is stale, not corrupt.
        assert!(verdict.quality.passed());
    }

    #[test]
    fn test_never_seen_symbol_fails_freshness() {
        let now = Utc::now();
        let mut health = healthy(now);
        health.last_event = None;
        let verdict = evaluate(&health, &thresholds(), now);
        assert!(!verdict.freshness.passed());
    }

    #[test]
    fn test_inverted_book_fails_quality() {
        let now = Utc::now();
        let mut health = healthy(now);
        health.inverted_books = 3;
        let verdict = evaluate(&health, &thresholds(), now);
        assert!(!verdict.passed);
        assert!(!verdict.quality.passed());
    }

    #[test]
    fn test_low_rate_fails_frequency() {
        let now = Utc::now();
        let mut health = healthy(now);
        // Default threshold is 1/min over a 10 minute window.
        health.events_in_frequency_window = 9;
        let verdict = evaluate(&health, &thresholds(), now);
        assert!(!verdict.frequency.passed());
    }

    #[test]
    fn test_boundary_rate_passes_frequency() {
        let now = Utc::now();
        let mut health = healthy(now);
        health.events_in_frequency_window = 10;
        let verdict = evaluate(&health, &thresholds(), now);
        assert!(verdict.frequency.passed());
    }
}
