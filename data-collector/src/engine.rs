//! Collector engine
//!
//! Owns the lifecycle of one running ingestion pipeline: stream client
//! shards, batch writers, the rollup engine, the grid refresher, and the
//! retention worker. All control operations (Start, Stop, Restart,
//! Status) are serialized on a single control mutex; Start and Stop are
//! idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::ingest::{BatchWriter, ChannelCounterSnapshot, ChannelCounters};
use crate::schema::ChannelKind;
use crate::shard::{ShardPlan, ShardStatus, ShardSupervisor, SupervisorCommand};
use crate::storage::{MarketDataRepository, RetentionManager, TimescaleOperations};
use crate::symbol::SymbolRegistry;
use crate::telemetry::{TelemetryBus, TelemetryEvent};
use crate::venue::{DepthSnapshotSource, EventNormalizer};
use crate::aggregates::{GridRefresher, RollupEngine};

/// Configuration accepted by Start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartConfig {
    /// Symbols to ingest
    pub symbols: Vec<String>,
    /// Channels to subscribe; must be non-empty
    pub channels: Vec<ChannelKind>,
    /// Log filter to apply for this run (recorded in status)
    #[serde(default)]
    pub log_level: Option<String>,
    /// Shard plan overrides
    #[serde(default)]
    pub shard_plan_overrides: Option<ShardPlanOverrides>,
}

/// Optional shard plan tuning on Start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardPlanOverrides {
    pub max_connections: Option<usize>,
    pub high_tier_symbols_per_connection: Option<usize>,
    pub low_tier_symbols_per_connection: Option<usize>,
}

impl StartConfig {
    /// The default run configuration from process settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            symbols: settings.symbols.default_symbols.clone(),
            channels: settings.channels.enabled(),
            log_level: None,
            shard_plan_overrides: None,
        }
    }

    /// Reject configurations the pipeline cannot run with.
    fn validate(&self) -> Result<(), String> {
        if self.symbols.is_empty() {
            return Err("symbols must not be empty".to_string());
        }
        if self.channels.is_empty() {
            return Err("channels must not be empty".to_string());
        }
        for symbol in &self.symbols {
            if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(format!("invalid symbol '{}'", symbol));
            }
        }
        if let Some(ref overrides) = self.shard_plan_overrides {
            if overrides.max_connections == Some(0) {
                return Err("shard_plan_overrides.max_connections must be at least 1".to_string());
            }
        }
        Ok(())
    }
}

/// Result of a Start call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum StartOutcome {
    Accepted,
    AlreadyRunning,
    Invalid(String),
}

/// Result of a Stop call. Stop always succeeds; `clean` is false when the
/// drain deadline was exceeded and tasks had to be aborted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    pub accepted: bool,
    pub clean: bool,
}

/// Compact status snapshot for the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub config: Option<StartConfig>,
    pub shards: Vec<ShardStatus>,
    pub totals: ChannelCounterSnapshot,
    /// Events per second per channel since the previous status call.
    pub rates: ChannelRates,
    pub degraded: bool,
    pub events_rejected: u64,
    pub lagged_consumers: u64,
    pub last_error: Option<String>,
}

/// Per-channel event rates.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ChannelRates {
    pub book_ticker: f64,
    pub agg_trade: f64,
    pub depth: f64,
    pub mark_price: f64,
    pub force_order: f64,
}

/// One running pipeline and its tasks.
struct RunningPipeline {
    started_at: DateTime<Utc>,
    config: StartConfig,
    shutdown_tx: watch::Sender<bool>,
    supervisor_cmd: mpsc::Sender<SupervisorCommand>,
    counters: Arc<ChannelCounters>,
    normalizer: Arc<EventNormalizer>,
    tasks: Vec<JoinHandle<()>>,
}

/// Serialized control state.
struct ControlState {
    running: Option<RunningPipeline>,
    last_config: Option<StartConfig>,
    last_error: Option<String>,
    rate_basis: Option<(Instant, ChannelCounterSnapshot)>,
}

/// The collector engine.
pub struct CollectorEngine {
    settings: Settings,
    repo: Arc<MarketDataRepository>,
    registry: Arc<SymbolRegistry>,
    telemetry: TelemetryBus,
    snapshot_source: Arc<dyn DepthSnapshotSource>,
    degraded: Arc<AtomicBool>,
    control: Mutex<ControlState>,
}

impl CollectorEngine {
    /// Create the engine and its telemetry-driven degraded flag watcher.
    pub fn new(
        settings: Settings,
        repo: Arc<MarketDataRepository>,
        registry: Arc<SymbolRegistry>,
        telemetry: TelemetryBus,
        snapshot_source: Arc<dyn DepthSnapshotSource>,
    ) -> Arc<Self> {
        let degraded = Arc::new(AtomicBool::new(false));

        // Keep the degraded flag current from telemetry so Status answers
        // without polling every component.
        let mut events = telemetry.subscribe();
        let flag = degraded.clone();
        let bus = telemetry.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TelemetryEvent::Degraded { on, .. }) => {
                        flag.store(on, Ordering::Relaxed);
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        bus.record_lagged_consumer();
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Arc::new(Self {
            settings,
            repo,
            registry,
            telemetry,
            snapshot_source,
            degraded,
            control: Mutex::new(ControlState {
                running: None,
                last_config: None,
                last_error: None,
                rate_basis: None,
            }),
        })
    }

    pub fn telemetry(&self) -> &TelemetryBus {
        &self.telemetry
    }

    pub fn repository(&self) -> &Arc<MarketDataRepository> {
        &self.repo
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Start the pipeline. Idempotent: a second Start while running
    /// returns `AlreadyRunning` without touching the live pipeline; an
    /// invalid configuration leaves prior state intact.
    pub async fn start(&self, config: StartConfig) -> StartOutcome {
        let mut control = self.control.lock().await;

        if control.running.is_some() {
            return StartOutcome::AlreadyRunning;
        }
        if let Err(reason) = config.validate() {
            warn!(reason, "Start rejected");
            return StartOutcome::Invalid(reason);
        }

        let mut settings = self.settings.clone();
        if let Some(ref overrides) = config.shard_plan_overrides {
            if let Some(n) = overrides.max_connections {
                settings.shards.max_connections = n;
            }
            if let Some(n) = overrides.high_tier_symbols_per_connection {
                settings.shards.high_tier_symbols_per_connection = n;
            }
            if let Some(n) = overrides.low_tier_symbols_per_connection {
                settings.shards.low_tier_symbols_per_connection = n;
            }
        }
        if let Some(ref level) = config.log_level {
            // The filter was installed at process startup; the requested
            // level is recorded with the run and applied on restart.
            info!(log_level = level, "Run requested log level");
        }

        let plan = ShardPlan::build(
            &config.symbols,
            &config.channels,
            &settings.symbols,
            &settings.shards,
        );
        info!(
            symbols = config.symbols.len(),
            channels = ?config.channels,
            connections = plan.connection_count(),
            "Starting ingestion pipeline"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Batch writers, one task per raw table.
        let (writers, writer_tasks) = BatchWriter::spawn(
            self.repo.clone(),
            &settings.ingest,
            self.telemetry.clone(),
            shutdown_rx.clone(),
        );
        tasks.extend(writer_tasks);

        // Rollup engine consumes a tap of the normalized stream.
        let (aggregator_tx, aggregator_rx) = mpsc::channel(settings.ingest.queue_capacity);
        let rollup = RollupEngine::new(&settings.aggregates);
        tasks.push(tokio::spawn(rollup.run(
            self.repo.clone(),
            self.telemetry.clone(),
            aggregator_rx,
            shutdown_rx.clone(),
        )));

        // Grid refresher and retention worker.
        let grid = GridRefresher::new(
            self.repo.clone(),
            &settings.aggregates,
            self.telemetry.clone(),
        );
        tasks.push(tokio::spawn(grid.run(shutdown_rx.clone())));

        let retention = RetentionManager::new(
            Arc::new(TimescaleOperations::new(self.repo.pool().clone())),
            &settings.retention,
            self.telemetry.clone(),
        );
        tasks.push(tokio::spawn(retention.run(shutdown_rx.clone())));

        // Stream clients behind the shard supervisor.
        let counters = Arc::new(ChannelCounters::default());
        let normalizer = Arc::new(EventNormalizer::new(self.registry.clone()));
        let supervisor = ShardSupervisor::new(
            settings,
            normalizer.clone(),
            self.snapshot_source.clone(),
            writers,
            aggregator_tx,
            counters.clone(),
            self.telemetry.clone(),
        );
        let (supervisor_cmd, supervisor_task) = supervisor.spawn(plan, shutdown_rx);
        tasks.push(supervisor_task);

        control.running = Some(RunningPipeline {
            started_at: Utc::now(),
            config: config.clone(),
            shutdown_tx,
            supervisor_cmd,
            counters,
            normalizer,
            tasks,
        });
        control.last_config = Some(config);
        control.last_error = None;
        control.rate_basis = None;

        StartOutcome::Accepted
    }

    /// Stop the pipeline. Idempotent: stopping a stopped engine is
    /// accepted. In-flight events are drained within the configured
    /// deadline; a hard timeout aborts the stragglers and is reported.
    pub async fn stop(&self) -> StopOutcome {
        let mut control = self.control.lock().await;

        let pipeline = match control.running.take() {
            Some(pipeline) => pipeline,
            None => {
                return StopOutcome {
                    accepted: true,
                    clean: true,
                }
            }
        };

        info!("Stopping ingestion pipeline");
        let _ = pipeline.shutdown_tx.send(true);

        let deadline = Duration::from_secs(self.settings.monitoring.drain_deadline_secs);
        let mut clean = true;
        for mut task in pipeline.tasks {
            if tokio::time::timeout(deadline, &mut task).await.is_err() {
                task.abort();
                clean = false;
            }
        }

        if clean {
            info!("Pipeline stopped cleanly");
        } else {
            error!("Pipeline stop exceeded the drain deadline");
            control.last_error = Some("stop exceeded drain deadline".to_string());
            self.telemetry.publish(TelemetryEvent::TaskAborted {
                task: "pipeline".to_string(),
                error: "stop exceeded drain deadline".to_string(),
            });
        }

        StopOutcome {
            accepted: true,
            clean,
        }
    }

    /// Restart with the previous configuration (or the settings default
    /// when the engine never ran).
    pub async fn restart(&self) -> StartOutcome {
        let previous = {
            let control = self.control.lock().await;
            control
                .last_config
                .clone()
                .unwrap_or_else(|| StartConfig::from_settings(&self.settings))
        };
        self.stop().await;
        self.start(previous).await
    }

    /// Compact status snapshot. Always answers, running or not.
    pub async fn status(&self) -> StatusSnapshot {
        let mut control = self.control.lock().await;

        let (running, started_at, config, shards, totals, rejected) = match control.running {
            Some(ref pipeline) => {
                let shards = query_shards(&pipeline.supervisor_cmd).await;
                (
                    true,
                    Some(pipeline.started_at),
                    Some(pipeline.config.clone()),
                    shards,
                    pipeline.counters.snapshot(),
                    pipeline.normalizer.rejected_count(),
                )
            }
            None => (
                false,
                None,
                None,
                Vec::new(),
                ChannelCounterSnapshot::default(),
                0,
            ),
        };

        let now = Instant::now();
        let rates = match control.rate_basis {
            Some((then, prev)) => {
                let elapsed = now.duration_since(then).as_secs_f64().max(0.001);
                ChannelRates {
                    book_ticker: (totals.book_ticker.saturating_sub(prev.book_ticker)) as f64
                        / elapsed,
                    agg_trade: (totals.agg_trade.saturating_sub(prev.agg_trade)) as f64 / elapsed,
                    depth: (totals.depth.saturating_sub(prev.depth)) as f64 / elapsed,
                    mark_price: (totals.mark_price.saturating_sub(prev.mark_price)) as f64
                        / elapsed,
                    force_order: (totals.force_order.saturating_sub(prev.force_order)) as f64
                        / elapsed,
                }
            }
            None => ChannelRates::default(),
        };
        control.rate_basis = Some((now, totals));

        StatusSnapshot {
            running,
            started_at,
            config,
            shards,
            totals,
            rates,
            degraded: self.degraded.load(Ordering::Relaxed),
            events_rejected: rejected,
            lagged_consumers: self.telemetry.lagged_consumer_count(),
            last_error: control.last_error.clone(),
        }
    }
}

async fn query_shards(cmd: &mpsc::Sender<SupervisorCommand>) -> Vec<ShardStatus> {
    let (tx, rx) = oneshot::channel();
    if cmd.send(SupervisorCommand::Status(tx)).await.is_err() {
        return Vec::new();
    }
    match tokio::time::timeout(Duration::from_secs(2), rx).await {
        Ok(Ok(status)) => status,
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseSettings;
    use crate::venue::{DepthSnapshot, VenueResult};
    use async_trait::async_trait;

    struct NoSnapshots;

    #[async_trait]
    impl DepthSnapshotSource for NoSnapshots {
        async fn fetch(&self, _symbol: &str) -> VenueResult<DepthSnapshot> {
            Ok(DepthSnapshot { last_update_id: 0 })
        }
    }

    fn test_engine() -> Arc<CollectorEngine> {
        let mut settings = Settings::default_settings();
        // Point at addresses nothing listens on; the pipeline runs its
        // reconnect loops without any live dependencies.
        settings.database.url = "postgresql://127.0.0.1:1/na".to_string();
        settings.venue.ws_base = "ws://127.0.0.1:9".to_string();
        settings.venue.rest_base = "http://127.0.0.1:9".to_string();
        settings.venue.connect_timeout_secs = 1;
        settings.monitoring.drain_deadline_secs = 5;
        settings.retention.interval_secs = 3600;

        let repo = Arc::new(
            MarketDataRepository::from_settings_lazy(&DatabaseSettings {
                url: settings.database.url.clone(),
                max_connections: 1,
                min_connections: 0,
                acquire_timeout_secs: 1,
            })
            .unwrap(),
        );
        let registry = Arc::new(SymbolRegistry::new_empty(
            repo.pool().clone(),
            "binance-futures",
        ));
        CollectorEngine::new(
            settings,
            repo,
            registry,
            TelemetryBus::default(),
            Arc::new(NoSnapshots),
        )
    }

    fn config() -> StartConfig {
        StartConfig {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            channels: vec![ChannelKind::BookTicker, ChannelKind::AggTrade],
            log_level: None,
            shard_plan_overrides: None,
        }
    }

    #[tokio::test]
    async fn test_start_twice_reports_already_running() {
        let engine = test_engine();
        assert_eq!(engine.start(config()).await, StartOutcome::Accepted);
        assert_eq!(engine.start(config()).await, StartOutcome::AlreadyRunning);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_stop_twice_is_accepted() {
        let engine = test_engine();
        assert_eq!(engine.start(config()).await, StartOutcome::Accepted);

        let first = engine.stop().await;
        assert!(first.accepted);

        let second = engine.stop().await;
        assert!(second.accepted);
        assert!(second.clean);

        // No orphan pipeline remains.
        let status = engine.status().await;
        assert!(!status.running);
        assert!(status.shards.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_leaves_prior_state_intact() {
        let engine = test_engine();
        assert_eq!(engine.start(config()).await, StartOutcome::Accepted);

        let bad = StartConfig {
            symbols: vec![],
            ..config()
        };
        // Already running wins over validation, so stop first.
        engine.stop().await;
        assert!(matches!(
            engine.start(bad).await,
            StartOutcome::Invalid(_)
        ));
        let status = engine.status().await;
        assert!(!status.running);
    }

    #[tokio::test]
    async fn test_invalid_symbols_rejected() {
        let engine = test_engine();
        let bad = StartConfig {
            symbols: vec!["BTC/USDT".to_string()],
            ..config()
        };
        assert!(matches!(engine.start(bad).await, StartOutcome::Invalid(_)));
    }

    #[tokio::test]
    async fn test_status_answers_when_stopped() {
        let engine = test_engine();
        let status = engine.status().await;
        assert!(!status.running);
        assert!(status.started_at.is_none());
        assert_eq!(status.totals.book_ticker, 0);
    }

    #[tokio::test]
    async fn test_status_reports_running_pipeline() {
        let engine = test_engine();
        engine.start(config()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = engine.status().await;
        assert!(status.running);
        assert!(status.started_at.is_some());
        assert!(!status.shards.is_empty());

        engine.stop().await;
    }
}
