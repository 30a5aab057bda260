//! Shard supervisor
//!
//! Owns the stream clients for a running plan: spawns one client plus one
//! pipeline task per shard, restarts clients that report Failed (subject
//! to the per-shard circuit breaker), applies minimal-diff rebalancing on
//! plan changes, and drains everything on stop within a bounded deadline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{BreakerState, CircuitBreaker, ShardPlan, ShardSpec};
use crate::config::Settings;
use crate::ingest::{ChannelCounters, ShardPipeline, WriterHandles};
use crate::schema::{ChannelKind, MarketEvent};
use crate::telemetry::{TelemetryBus, TelemetryEvent};
use crate::venue::{
    ConnectionState, DepthChainTracker, DepthSnapshotSource, EventNormalizer, StreamClient,
    StreamClientConfig,
};

/// Snapshot of one shard for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ShardStatus {
    pub id: usize,
    pub channels: Vec<ChannelKind>,
    pub symbol_count: usize,
    pub state: ConnectionState,
    pub breaker: BreakerState,
    pub messages_received: u64,
    pub last_error: Option<String>,
}

/// Commands accepted by the supervisor task.
pub enum SupervisorCommand {
    Status(oneshot::Sender<Vec<ShardStatus>>),
    Rebalance(ShardPlan),
}

struct ShardHandle {
    spec: ShardSpec,
    client_task: JoinHandle<crate::venue::VenueResult<()>>,
    pipeline_task: JoinHandle<()>,
    state_rx: watch::Receiver<ConnectionState>,
    messages: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
    breaker: CircuitBreaker,
    connected_recorded: bool,
    last_error: Option<String>,
}

/// Shared dependencies every shard needs.
pub struct ShardSupervisor {
    settings: Settings,
    normalizer: Arc<EventNormalizer>,
    snapshot_source: Arc<dyn DepthSnapshotSource>,
    writers: WriterHandles,
    aggregator_tx: mpsc::Sender<MarketEvent>,
    counters: Arc<ChannelCounters>,
    telemetry: TelemetryBus,

    plan: ShardPlan,
    handles: HashMap<usize, ShardHandle>,
    next_shard_id: usize,
}

impl ShardSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        normalizer: Arc<EventNormalizer>,
        snapshot_source: Arc<dyn DepthSnapshotSource>,
        writers: WriterHandles,
        aggregator_tx: mpsc::Sender<MarketEvent>,
        counters: Arc<ChannelCounters>,
        telemetry: TelemetryBus,
    ) -> Self {
        Self {
            settings,
            normalizer,
            snapshot_source,
            writers,
            aggregator_tx,
            counters,
            telemetry,
            plan: ShardPlan { shards: Vec::new() },
            handles: HashMap::new(),
            next_shard_id: 0,
        }
    }

    /// Spawn the supervisor task for a plan. Returns the command channel.
    pub fn spawn(
        mut self,
        plan: ShardPlan,
        shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Sender<SupervisorCommand>, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let task = tokio::spawn(async move {
            self.apply_plan(plan);
            self.run(cmd_rx, shutdown).await;
        });
        (cmd_tx, task)
    }

    async fn run(
        &mut self,
        mut commands: mpsc::Receiver<SupervisorCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        info!(shards = self.plan.shards.len(), "Shard supervisor running");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_liveness();
                }
                Some(cmd) = commands.recv() => match cmd {
                    SupervisorCommand::Status(reply) => {
                        let _ = reply.send(self.status());
                    }
                    SupervisorCommand::Rebalance(plan) => {
                        self.rebalance(plan).await;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain_all().await;
        info!("Shard supervisor stopped");
    }

    /// Spawn clients for every shard in the plan.
    fn apply_plan(&mut self, plan: ShardPlan) {
        for spec in &plan.shards {
            let handle = self.spawn_shard(spec.clone());
            self.handles.insert(spec.id, handle);
            self.next_shard_id = self.next_shard_id.max(spec.id + 1);
        }
        self.plan = plan;
    }

    fn spawn_shard(&self, spec: ShardSpec) -> ShardHandle {
        let (frames_tx, frames_rx) = mpsc::channel(self.settings.ingest.queue_capacity);
        let config =
            StreamClientConfig::from_settings(spec.id, spec.stream_names(), &self.settings.venue);
        let (client, state_rx, messages) =
            StreamClient::new(config, frames_tx, self.telemetry.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let client_task = tokio::spawn(client.run(shutdown_rx));

        let pipeline = ShardPipeline::new(
            spec.id,
            self.normalizer.clone(),
            DepthChainTracker::new(self.snapshot_source.clone()),
            self.writers.clone(),
            self.aggregator_tx.clone(),
            self.counters.clone(),
            self.telemetry.clone(),
        );
        let pipeline_task = tokio::spawn(pipeline.run(frames_rx));

        debug!(
            shard_id = spec.id,
            symbols = spec.symbols.len(),
            channels = ?spec.channels,
            "Shard spawned"
        );

        ShardHandle {
            spec,
            client_task,
            pipeline_task,
            state_rx,
            messages,
            shutdown_tx,
            breaker: CircuitBreaker::new(&self.settings.shards.breaker),
            connected_recorded: false,
            last_error: None,
        }
    }

    /// Restart dead clients, feed the breakers, and note successes.
    fn check_liveness(&mut self) {
        let now = Instant::now();
        let mut respawn: Vec<usize> = Vec::new();

        for (id, handle) in self.handles.iter_mut() {
            let state = *handle.state_rx.borrow();

            if state == ConnectionState::Connected && !handle.connected_recorded {
                handle.breaker.record_success();
                handle.connected_recorded = true;
            }
            if state != ConnectionState::Connected {
                handle.connected_recorded = false;
            }

            if handle.client_task.is_finished() {
                handle.breaker.record_failure(now);
                if handle.breaker.can_attempt(now) {
                    respawn.push(*id);
                } else if state != ConnectionState::Failed {
                    warn!(
                        shard_id = id,
                        cooldown = ?handle.breaker.cooldown_remaining(now),
                        "Circuit breaker open, restart suppressed"
                    );
                }
            }
        }

        for id in respawn {
            if let Some(old) = self.handles.remove(&id) {
                let last_error = Some("client task exited".to_string());
                old.pipeline_task.abort();
                warn!(shard_id = id, "Restarting failed stream client");
                let mut handle = self.spawn_shard(old.spec);
                // Carry breaker history across restarts.
                handle.breaker = old.breaker;
                handle.last_error = last_error;
                self.handles.insert(id, handle);
            }
        }
    }

    /// Replace the running plan with a minimal diff: drain removed shards
    /// and spawn added ones; untouched shards keep their connections.
    async fn rebalance(&mut self, new_plan: ShardPlan) {
        let diff = new_plan.diff(&self.plan);
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            unchanged = diff.unchanged.len(),
            "Rebalancing shard plan"
        );

        for id in &diff.removed {
            if let Some(handle) = self.handles.remove(id) {
                let _ = handle.shutdown_tx.send(true);
                let _ = tokio::time::timeout(Duration::from_secs(5), handle.client_task).await;
                let _ = tokio::time::timeout(Duration::from_secs(5), handle.pipeline_task).await;
            }
        }

        for spec in diff.added {
            let mut spec = spec;
            // Re-number additions so ids never collide with survivors.
            spec.id = self.next_shard_id;
            self.next_shard_id += 1;
            let handle = self.spawn_shard(spec.clone());
            self.handles.insert(spec.id, handle);
        }

        self.plan = ShardPlan {
            shards: self.handles.values().map(|h| h.spec.clone()).collect(),
        };
    }

    /// Current per-shard status.
    fn status(&self) -> Vec<ShardStatus> {
        let mut statuses: Vec<ShardStatus> = self
            .handles
            .values()
            .map(|h| ShardStatus {
                id: h.spec.id,
                channels: h.spec.channels.clone(),
                symbol_count: h.spec.symbols.len(),
                state: *h.state_rx.borrow(),
                breaker: h.breaker.state(),
                messages_received: h.messages.load(Ordering::Relaxed),
                last_error: h.last_error.clone(),
            })
            .collect();
        statuses.sort_by_key(|s| s.id);
        statuses
    }

    /// Drain every shard within the configured deadline; abort stragglers.
    pub(crate) async fn drain_all(&mut self) {
        let deadline = Duration::from_secs(self.settings.monitoring.drain_deadline_secs);
        info!(shards = self.handles.len(), ?deadline, "Draining all shards");

        for handle in self.handles.values() {
            let _ = handle.shutdown_tx.send(true);
        }

        for (id, handle) in self.handles.drain() {
            let mut client_task = handle.client_task;
            if tokio::time::timeout(deadline, &mut client_task).await.is_err() {
                error!(shard_id = id, "Drain deadline exceeded, aborting client");
                client_task.abort();
                self.telemetry.publish(TelemetryEvent::TaskAborted {
                    task: format!("stream-client-{}", id),
                    error: "drain deadline exceeded".to_string(),
                });
            }
            let mut pipeline_task = handle.pipeline_task;
            if tokio::time::timeout(deadline, &mut pipeline_task).await.is_err() {
                error!(shard_id = id, "Pipeline did not finish, aborting");
                pipeline_task.abort();
                self.telemetry.publish(TelemetryEvent::TaskAborted {
                    task: format!("pipeline-{}", id),
                    error: "drain deadline exceeded".to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseSettings;
    use crate::ingest::BatchWriter;
    use crate::shard::{LiquidityTier, ShardSpec};
    use crate::storage::MarketDataRepository;
    use crate::symbol::SymbolRegistry;
    use crate::venue::{DepthSnapshot, VenueResult};
    use async_trait::async_trait;

    struct NoSnapshots;

    #[async_trait]
    impl DepthSnapshotSource for NoSnapshots {
        async fn fetch(&self, _symbol: &str) -> VenueResult<DepthSnapshot> {
            Ok(DepthSnapshot { last_update_id: 0 })
        }
    }

    fn offline_settings() -> Settings {
        let mut settings = Settings::default_settings();
        settings.venue.ws_base = "ws://127.0.0.1:9".to_string();
        settings.venue.connect_timeout_secs = 1;
        settings.venue.reconnection.initial_delay_secs = 1;
        settings.venue.reconnection.max_attempts = 1000;
        settings.monitoring.drain_deadline_secs = 5;
        settings
    }

    fn plan_of(symbol_groups: &[&[&str]]) -> ShardPlan {
        ShardPlan {
            shards: symbol_groups
                .iter()
                .enumerate()
                .map(|(id, symbols)| ShardSpec {
                    id,
                    tier: LiquidityTier::Low,
                    channels: vec![ChannelKind::BookTicker],
                    symbols: symbols.iter().map(|s| s.to_string()).collect(),
                })
                .collect(),
        }
    }

    async fn spawn_supervisor(
        plan: ShardPlan,
    ) -> (
        mpsc::Sender<SupervisorCommand>,
        JoinHandle<()>,
        watch::Sender<bool>,
    ) {
        let settings = offline_settings();
        let repo = Arc::new(
            MarketDataRepository::from_settings_lazy(&DatabaseSettings {
                url: "postgresql://127.0.0.1:1/na".to_string(),
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
        let telemetry = TelemetryBus::default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (writers, _writer_tasks) =
            BatchWriter::spawn(repo, &settings.ingest, telemetry.clone(), shutdown_rx.clone());
        let (aggregator_tx, _aggregator_rx) = mpsc::channel(64);

        let supervisor = ShardSupervisor::new(
            settings,
            Arc::new(EventNormalizer::new(registry)),
            Arc::new(NoSnapshots),
            writers,
            aggregator_tx,
            Arc::new(ChannelCounters::default()),
            telemetry,
        );
        let (cmd_tx, task) = supervisor.spawn(plan, shutdown_rx);
        (cmd_tx, task, shutdown_tx)
    }

    async fn query_status(cmd: &mpsc::Sender<SupervisorCommand>) -> Vec<ShardStatus> {
        let (tx, rx) = oneshot::channel();
        cmd.send(SupervisorCommand::Status(tx)).await.unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_status_reports_every_shard() {
        let (cmd, task, shutdown) =
            spawn_supervisor(plan_of(&[&["AUSDT", "BUSDT"], &["CUSDT"]])).await;

        let status = query_status(&cmd).await;
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].symbol_count, 2);
        assert_eq!(status[1].symbol_count, 1);

        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(15), task)
            .await
            .expect("supervisor did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_rebalance_applies_minimal_diff() {
        let (cmd, task, shutdown) =
            spawn_supervisor(plan_of(&[&["AUSDT"], &["BUSDT"]])).await;

        // Keep the AUSDT shard, drop BUSDT, add CUSDT.
        cmd.send(SupervisorCommand::Rebalance(plan_of(&[
            &["AUSDT"],
            &["CUSDT"],
        ])))
        .await
        .unwrap();

        // Poll until the rebalance settles.
        let mut symbols: Vec<usize> = Vec::new();
        for _ in 0..50 {
            let status = query_status(&cmd).await;
            symbols = status.iter().map(|s| s.symbol_count).collect();
            if status.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(symbols.len(), 2);

        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(15), task)
            .await
            .expect("supervisor did not stop")
            .unwrap();
    }
}
