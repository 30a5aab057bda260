//! Depth update chain tracking and resync
//!
//! Depth deltas form a per-symbol chain: each accepted event's
//! `first_update_id` must equal the previous event's `final_update_id + 1`.
//! On a break, the tracker requests a REST snapshot and re-bases the chain
//! on top of it; deltas at or below the snapshot's `last_update_id` are
//! discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::types::DepthSnapshotResponse;
use super::{VenueError, VenueResult};
use crate::schema::DepthRecord;

/// A depth snapshot, reduced to what the resync flow needs.
#[derive(Debug, Clone)]
pub struct DepthSnapshot {
    pub last_update_id: i64,
}

impl From<DepthSnapshotResponse> for DepthSnapshot {
    fn from(r: DepthSnapshotResponse) -> Self {
        Self {
            last_update_id: r.last_update_id,
        }
    }
}

/// Source of depth snapshots. The REST implementation is used in
/// production; tests inject a fake.
#[async_trait]
pub trait DepthSnapshotSource: Send + Sync {
    async fn fetch(&self, symbol: &str) -> VenueResult<DepthSnapshot>;
}

/// REST snapshot source hitting `/fapi/v1/depth`.
pub struct RestSnapshotSource {
    client: reqwest::Client,
    rest_base: String,
    limit: u16,
}

impl RestSnapshotSource {
    pub fn new(rest_base: impl Into<String>, limit: u16, timeout: Duration) -> VenueResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VenueError::Configuration(e.to_string()))?;
        Ok(Self {
            client,
            rest_base: rest_base.into(),
            limit,
        })
    }
}

#[async_trait]
impl DepthSnapshotSource for RestSnapshotSource {
    async fn fetch(&self, symbol: &str) -> VenueResult<DepthSnapshot> {
        let url = format!(
            "{}/fapi/v1/depth?symbol={}&limit={}",
            self.rest_base, symbol, self.limit
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| VenueError::Snapshot(e.to_string()))?;

        if !response.status().is_success() {
            return Err(VenueError::Snapshot(format!(
                "snapshot request for {} returned {}",
                symbol,
                response.status()
            )));
        }

        let snapshot: DepthSnapshotResponse = response
            .json()
            .await
            .map_err(|e| VenueError::Snapshot(e.to_string()))?;

        Ok(snapshot.into())
    }
}

/// What to do with one observed depth event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthObservation {
    /// Whether the event should be persisted.
    pub accept: bool,
    /// Set when this observation triggered a snapshot request; carries the
    /// snapshot's last_update_id.
    pub resynced: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
enum ChainState {
    /// Chain is intact; holds the last accepted final_update_id.
    Following(i64),
    /// Waiting for the first delta that covers the snapshot.
    Resyncing(i64),
}

/// Per-symbol depth chain tracker.
pub struct DepthChainTracker {
    source: Arc<dyn DepthSnapshotSource>,
    states: HashMap<i64, ChainState>,
    snapshot_requests: u64,
    discarded: u64,
}

impl DepthChainTracker {
    pub fn new(source: Arc<dyn DepthSnapshotSource>) -> Self {
        Self {
            source,
            states: HashMap::new(),
            snapshot_requests: 0,
            discarded: 0,
        }
    }

    /// Snapshot requests issued so far.
    pub fn snapshot_requests(&self) -> u64 {
        self.snapshot_requests
    }

    /// Deltas discarded during resyncs so far.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Observe one normalized depth event for `symbol` and decide whether
    /// it continues the chain.
    pub async fn observe(
        &mut self,
        symbol: &str,
        record: &DepthRecord,
    ) -> VenueResult<DepthObservation> {
        match self.states.get(&record.symbol_id).copied() {
            None => {
                // First delta for this symbol starts the chain.
                self.states
                    .insert(record.symbol_id, ChainState::Following(record.final_update_id));
                Ok(DepthObservation {
                    accept: true,
                    resynced: None,
                })
            }
            Some(ChainState::Following(last_final)) => {
                if record.first_update_id == last_final + 1 {
                    self.states
                        .insert(record.symbol_id, ChainState::Following(record.final_update_id));
                    return Ok(DepthObservation {
                        accept: true,
                        resynced: None,
                    });
                }

                warn!(
                    symbol,
                    expected = last_final + 1,
                    got = record.first_update_id,
                    "Depth chain broken, requesting snapshot"
                );
                let snapshot = self.request_snapshot(symbol).await?;
                self.apply_snapshot(symbol, record, snapshot.last_update_id)
            }
            Some(ChainState::Resyncing(snapshot_last)) => {
                self.apply_snapshot(symbol, record, snapshot_last)
            }
        }
    }

    async fn request_snapshot(&mut self, symbol: &str) -> VenueResult<DepthSnapshot> {
        self.snapshot_requests += 1;
        let snapshot = self.source.fetch(symbol).await?;
        info!(
            symbol,
            last_update_id = snapshot.last_update_id,
            "Depth snapshot received"
        );
        Ok(snapshot)
    }

    /// Re-base the chain on a snapshot: discard deltas entirely covered by
    /// it, accept the first delta that spans `last_update_id + 1`.
    fn apply_snapshot(
        &mut self,
        symbol: &str,
        record: &DepthRecord,
        snapshot_last: i64,
    ) -> VenueResult<DepthObservation> {
        if record.final_update_id <= snapshot_last {
            self.discarded += 1;
            self.states
                .insert(record.symbol_id, ChainState::Resyncing(snapshot_last));
            debug!(
                symbol,
                final_update_id = record.final_update_id,
                snapshot_last, "Discarding delta covered by snapshot"
            );
            return Ok(DepthObservation {
                accept: false,
                resynced: Some(snapshot_last),
            });
        }

        if record.first_update_id <= snapshot_last + 1 {
            // Delta spans the snapshot boundary: chain is re-based.
            self.states
                .insert(record.symbol_id, ChainState::Following(record.final_update_id));
            return Ok(DepthObservation {
                accept: true,
                resynced: Some(snapshot_last),
            });
        }

        // The stream is already past the snapshot; it went stale while we
        // were fetching. Keep resyncing from the current delta.
        warn!(
            symbol,
            first_update_id = record.first_update_id,
            snapshot_last, "Snapshot stale, keeping delta and re-basing on it"
        );
        self.states
            .insert(record.symbol_id, ChainState::Following(record.final_update_id));
        Ok(DepthObservation {
            accept: true,
            resynced: Some(snapshot_last),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

    struct FakeSource {
        last_update_id: AtomicI64,
        calls: AtomicU64,
    }

    impl FakeSource {
        fn new(last_update_id: i64) -> Arc<Self> {
            Arc::new(Self {
                last_update_id: AtomicI64::new(last_update_id),
                calls: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl DepthSnapshotSource for FakeSource {
        async fn fetch(&self, _symbol: &str) -> VenueResult<DepthSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(DepthSnapshot {
                last_update_id: self.last_update_id.load(Ordering::SeqCst),
            })
        }
    }

    fn delta(first: i64, last: i64, prev: Option<i64>) -> DepthRecord {
        DepthRecord {
            symbol_id: 1,
            ts_exchange: Utc::now(),
            ts_ingest: Utc::now(),
            first_update_id: first,
            final_update_id: last,
            prev_final_update_id: prev,
            bids: vec![["100.0".to_string(), "1.0".to_string()]],
            asks: vec![["100.1".to_string(), "1.0".to_string()]],
        }
    }

    #[tokio::test]
    async fn test_contiguous_chain_is_accepted() {
        let source = FakeSource::new(0);
        let mut tracker = DepthChainTracker::new(source.clone());

        assert!(tracker.observe("BTCUSDT", &delta(1, 10, None)).await.unwrap().accept);
        assert!(tracker.observe("BTCUSDT", &delta(11, 20, Some(10))).await.unwrap().accept);
        assert!(tracker.observe("BTCUSDT", &delta(21, 30, Some(20))).await.unwrap().accept);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_gap_triggers_exactly_one_snapshot() {
        // Gap between 300 and 320; snapshot covers through 340, deltas up
        // to 340 are discarded, the delta spanning 341 re-bases the chain.
        let source = FakeSource::new(340);
        let mut tracker = DepthChainTracker::new(source.clone());

        assert!(tracker.observe("BTCUSDT", &delta(291, 300, None)).await.unwrap().accept);

        // 320 != 300 + 1 -> snapshot requested, delta covered -> discard
        let obs = tracker.observe("BTCUSDT", &delta(320, 330, Some(310))).await.unwrap();
        assert!(!obs.accept);
        assert_eq!(obs.resynced, Some(340));

        // Still covered by snapshot -> discard without a second snapshot
        let obs = tracker.observe("BTCUSDT", &delta(331, 340, Some(330))).await.unwrap();
        assert!(!obs.accept);

        // Spans snapshot_last + 1 -> accepted, chain re-based
        let obs = tracker.observe("BTCUSDT", &delta(341, 350, Some(340))).await.unwrap();
        assert!(obs.accept);

        // Contiguous from here on
        assert!(tracker.observe("BTCUSDT", &delta(351, 360, Some(350))).await.unwrap().accept);

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.snapshot_requests(), 1);
        assert_eq!(tracker.discarded(), 2);
    }

    #[tokio::test]
    async fn test_stale_snapshot_rebases_on_stream() {
        let source = FakeSource::new(100);
        let mut tracker = DepthChainTracker::new(source.clone());

        assert!(tracker.observe("BTCUSDT", &delta(91, 100, None)).await.unwrap().accept);

        // Gap, and the next delta starts well past the snapshot.
        let obs = tracker.observe("BTCUSDT", &delta(150, 160, Some(140))).await.unwrap();
        assert!(obs.accept);

        // Chain continues from the re-based delta.
        assert!(tracker.observe("BTCUSDT", &delta(161, 170, Some(160))).await.unwrap().accept);
    }

    #[tokio::test]
    async fn test_symbols_tracked_independently() {
        let source = FakeSource::new(1000);
        let mut tracker = DepthChainTracker::new(source.clone());

        let mut a = delta(1, 10, None);
        a.symbol_id = 1;
        let mut b = delta(500, 510, None);
        b.symbol_id = 2;

        assert!(tracker.observe("BTCUSDT", &a).await.unwrap().accept);
        assert!(tracker.observe("ETHUSDT", &b).await.unwrap().accept);

        // A gap on symbol 2 does not disturb symbol 1.
        let mut a2 = delta(11, 20, Some(10));
        a2.symbol_id = 1;
        assert!(tracker.observe("BTCUSDT", &a2).await.unwrap().accept);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }
}
