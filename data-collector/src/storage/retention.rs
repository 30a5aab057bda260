//! Retention and compression manager
//!
//! Applies age-based compress-after and drop-after policies per table on a
//! schedule. Policies for one table never run concurrently: the worker is
//! a single task that walks the policy list sequentially.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::TimescaleOperations;
use crate::config::RetentionSettings;
use crate::telemetry::{TelemetryBus, TelemetryEvent};

/// Retention policy for one table.
#[derive(Debug, Clone)]
pub struct TablePolicy {
    pub table: &'static str,
    /// Compress chunks older than this many days
    pub compress_after_days: Option<u32>,
    /// Drop chunks older than this many days
    pub drop_after_days: Option<u32>,
}

/// Scheduled retention worker.
pub struct RetentionManager {
    ops: Arc<TimescaleOperations>,
    policies: Vec<TablePolicy>,
    interval: Duration,
    telemetry: TelemetryBus,
}

impl RetentionManager {
    /// Build the policy set from settings.
    pub fn new(
        ops: Arc<TimescaleOperations>,
        settings: &RetentionSettings,
        telemetry: TelemetryBus,
    ) -> Self {
        let policies = vec![
            TablePolicy {
                table: "book_ticker",
                compress_after_days: Some(settings.raw_compress_after_days),
                drop_after_days: Some(settings.raw_drop_after_days),
            },
            TablePolicy {
                table: "trades",
                compress_after_days: Some(settings.raw_compress_after_days),
                drop_after_days: Some(settings.raw_drop_after_days),
            },
            TablePolicy {
                table: "depth_events",
                compress_after_days: Some(settings.depth_compress_after_days),
                drop_after_days: Some(settings.depth_drop_after_days),
            },
            TablePolicy {
                table: "mark_price",
                compress_after_days: Some(settings.raw_compress_after_days),
                drop_after_days: Some(settings.raw_drop_after_days),
            },
            TablePolicy {
                table: "force_orders",
                compress_after_days: Some(settings.raw_compress_after_days),
                drop_after_days: Some(settings.raw_drop_after_days),
            },
            TablePolicy {
                table: "bt_1s",
                compress_after_days: Some(settings.aggregate_compress_after_days),
                drop_after_days: Some(settings.aggregate_drop_after_days),
            },
            TablePolicy {
                table: "trade_1s",
                compress_after_days: Some(settings.aggregate_compress_after_days),
                drop_after_days: Some(settings.aggregate_drop_after_days),
            },
        ];

        Self {
            ops,
            policies,
            interval: Duration::from_secs(settings.interval_secs),
            telemetry,
        }
    }

    /// Policies this manager applies (for status and tests).
    pub fn policies(&self) -> &[TablePolicy] {
        &self.policies
    }

    /// Run until the shutdown signal flips. One pass runs immediately on
    /// start so a long interval cannot postpone overdue maintenance.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Retention manager started ({} policies, every {:?})",
            self.policies.len(),
            self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.apply_all().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Retention manager stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Apply every policy once, sequentially.
    pub async fn apply_all(&self) {
        for policy in &self.policies {
            self.apply_one(policy).await;
        }
    }

    async fn apply_one(&self, policy: &TablePolicy) {
        if let Some(days) = policy.compress_after_days {
            match self.ops.compress_chunks_older_than(policy.table, days).await {
                Ok(chunks) => {
                    debug!("Compression pass on {}: {} chunks", policy.table, chunks);
                    self.telemetry.publish(TelemetryEvent::RetentionApplied {
                        table: policy.table.to_string(),
                        policy: "compress",
                        chunks,
                    });
                }
                Err(e) => {
                    warn!("Compression on {} failed: {}", policy.table, e);
                    self.telemetry.publish(TelemetryEvent::RetentionFailed {
                        table: policy.table.to_string(),
                        policy: "compress",
                        error: e.to_string(),
                    });
                }
            }
        }

        if let Some(days) = policy.drop_after_days {
            match self.ops.drop_chunks_older_than(policy.table, days).await {
                Ok(chunks) => {
                    debug!("Drop pass on {}: {} chunks", policy.table, chunks);
                    self.telemetry.publish(TelemetryEvent::RetentionApplied {
                        table: policy.table.to_string(),
                        policy: "drop",
                        chunks,
                    });
                }
                Err(e) => {
                    warn!("Drop on {} failed: {}", policy.table, e);
                    self.telemetry.publish(TelemetryEvent::RetentionFailed {
                        table: policy.table.to_string(),
                        policy: "drop",
                        error: e.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetentionSettings;
    use sqlx::postgres::PgPoolOptions;

    fn test_manager() -> RetentionManager {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgresql://localhost/test")
            .unwrap();
        RetentionManager::new(
            Arc::new(TimescaleOperations::new(pool)),
            &RetentionSettings::default(),
            TelemetryBus::default(),
        )
    }

    #[tokio::test]
    async fn test_default_policy_set() {
        let manager = test_manager();
        let depth = manager
            .policies()
            .iter()
            .find(|p| p.table == "depth_events")
            .unwrap();
        assert_eq!(depth.drop_after_days, Some(7));
        assert_eq!(depth.compress_after_days, Some(1));

        let trades = manager
            .policies()
            .iter()
            .find(|p| p.table == "trades")
            .unwrap();
        assert_eq!(trades.drop_after_days, Some(30));

        let bt_1s = manager
            .policies()
            .iter()
            .find(|p| p.table == "bt_1s")
            .unwrap();
        assert_eq!(bt_1s.drop_after_days, Some(180));
        assert_eq!(bt_1s.compress_after_days, Some(7));
    }

    #[tokio::test]
    async fn test_every_policy_names_a_distinct_table() {
        let manager = test_manager();
        let mut tables: Vec<&str> = manager.policies().iter().map(|p| p.table).collect();
        tables.sort();
        tables.dedup();
        assert_eq!(tables.len(), manager.policies().len());
    }
}
