//! Broadcast bus for component telemetry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::venue::ConnectionState;

/// Events published on the telemetry bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryEvent {
    ConnectionStateChanged {
        shard_id: usize,
        state: ConnectionState,
        detail: Option<String>,
    },
    BatchFlushed {
        table: &'static str,
        rows: usize,
        inserted: u64,
        duration_ms: u64,
    },
    RowsQuarantined {
        table: &'static str,
        rows: usize,
        reason: String,
    },
    Backpressure {
        shard_id: usize,
        wait_ms: u64,
    },
    Degraded {
        on: bool,
        reason: String,
    },
    EventsDropped {
        table: &'static str,
        count: u64,
    },
    DepthResync {
        symbol_id: i64,
        snapshot_last_update_id: i64,
        discarded: u64,
    },
    SecondClosed {
        symbol_id: i64,
        ts_second: DateTime<Utc>,
    },
    LateRecompute {
        symbol_id: i64,
        ts_second: DateTime<Utc>,
    },
    ValidationCompleted {
        passed: bool,
        failed_symbols: usize,
    },
    RetentionApplied {
        table: String,
        policy: &'static str,
        chunks: u64,
    },
    RetentionFailed {
        table: String,
        policy: &'static str,
        error: String,
    },
    TaskAborted {
        task: String,
        error: String,
    },
}

/// In-process pub/sub for telemetry events.
///
/// Subscribers get a bounded queue; a consumer that falls behind is
/// disconnected by the broadcast channel (observed as a `Lagged` receive
/// error) and counted in `lagged_consumers`.
#[derive(Clone)]
pub struct TelemetryBus {
    tx: broadcast::Sender<TelemetryEvent>,
    published: Arc<AtomicU64>,
    lagged_consumers: Arc<AtomicU64>,
}

impl TelemetryBus {
    /// Create a bus whose subscribers buffer at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            published: Arc::new(AtomicU64::new(0)),
            lagged_consumers: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event. Publishing never blocks and never fails; with no
    /// subscribers the event is simply discarded.
    pub fn publish(&self, event: TelemetryEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(event);
    }

    /// Subscribe with a bounded queue.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.tx.subscribe()
    }

    /// Record that a subscriber lagged and was cut off.
    pub fn record_lagged_consumer(&self) {
        self.lagged_consumers.fetch_add(1, Ordering::Relaxed);
    }

    /// Total events published since startup.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Number of consumers that were disconnected for falling behind.
    pub fn lagged_consumer_count(&self) -> u64 {
        self.lagged_consumers.load(Ordering::Relaxed)
    }
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = TelemetryBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(TelemetryEvent::Degraded {
            on: true,
            reason: "store unavailable".to_string(),
        });

        match rx.recv().await.unwrap() {
            TelemetryEvent::Degraded { on, .. } => assert!(on),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = TelemetryBus::new(4);
        bus.publish(TelemetryEvent::EventsDropped {
            table: "trades",
            count: 3,
        });
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn test_slow_consumer_observes_lag() {
        let bus = TelemetryBus::new(2);
        let mut rx = bus.subscribe();

        for i in 0..8 {
            bus.publish(TelemetryEvent::EventsDropped {
                table: "trades",
                count: i,
            });
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                assert!(missed > 0);
                bus.record_lagged_consumer();
            }
            other => panic!("expected lag, got {:?}", other),
        }
        assert_eq!(bus.lagged_consumer_count(), 1);
    }
}
