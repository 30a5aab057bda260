//! Flat grid refresher
//!
//! Keeps `core_1s_24h` materialized over the rolling window: every
//! refresh upserts gap-filled rows for [now-24h, now) and trims rows that
//! slid out. Coverage inside the window must be 1.00; a shortfall is
//! logged and surfaced through telemetry as a degraded signal.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DurationRound, TimeDelta, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::AggregateSettings;
use crate::storage::MarketDataRepository;
use crate::telemetry::{TelemetryBus, TelemetryEvent};

pub struct GridRefresher {
    repo: Arc<MarketDataRepository>,
    telemetry: TelemetryBus,
    interval: Duration,
    window: chrono::Duration,
}

impl GridRefresher {
    pub fn new(
        repo: Arc<MarketDataRepository>,
        settings: &AggregateSettings,
        telemetry: TelemetryBus,
    ) -> Self {
        Self {
            repo,
            telemetry,
            interval: Duration::from_secs(settings.grid_refresh_secs),
            window: chrono::Duration::hours(settings.grid_window_hours as i64),
        }
    }

    /// Refresh until shutdown. Refreshing an unchanged window is
    /// idempotent, so the first tick firing immediately is harmless.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "Grid refresher started");
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Grid refresher stopping");
                        break;
                    }
                }
            }
        }
    }

    /// One refresh pass over the sliding window, aligned to whole seconds.
    pub async fn refresh_once(&self) {
        let end = match Utc::now().duration_trunc(TimeDelta::seconds(1)) {
            Ok(end) => end,
            Err(e) => {
                warn!("Clock truncation failed: {}", e);
                return;
            }
        };
        let start = end - self.window;

        match self.repo.refresh_grid(start, end).await {
            Ok((filled, zero_filled, trimmed)) => {
                debug!(filled, zero_filled, trimmed, "Grid refreshed");
            }
            Err(e) => {
                warn!(error = %e, "Grid refresh failed");
                return;
            }
        }

        match self.repo.grid_coverage(start, end).await {
            Ok(coverage) if coverage < 1.0 => {
                warn!(coverage, "Grid coverage below 1.00");
                self.telemetry.publish(TelemetryEvent::Degraded {
                    on: true,
                    reason: format!("grid coverage {:.4}", coverage),
                });
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Grid coverage check failed"),
        }
    }
}
