//! Per-shard pipeline: raw frames -> normalizer -> depth gate -> writers.
//!
//! One pipeline task runs per stream client. It ends when the client's
//! frame channel closes, after forwarding everything already queued, so a
//! draining client never loses in-flight events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::WriterHandles;
use crate::schema::{ChannelKind, MarketEvent};
use crate::telemetry::{TelemetryBus, TelemetryEvent};
use crate::venue::{DepthChainTracker, EventNormalizer, RawFrame, VenueError};

/// Per-channel event counters, shared with the status endpoint.
#[derive(Debug, Default)]
pub struct ChannelCounters {
    pub book_ticker: AtomicU64,
    pub agg_trade: AtomicU64,
    pub depth: AtomicU64,
    pub mark_price: AtomicU64,
    pub force_order: AtomicU64,
    pub unparsed_frames: AtomicU64,
}

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ChannelCounterSnapshot {
    pub book_ticker: u64,
    pub agg_trade: u64,
    pub depth: u64,
    pub mark_price: u64,
    pub force_order: u64,
    pub unparsed_frames: u64,
}

impl ChannelCounters {
    pub fn record(&self, channel: ChannelKind) {
        let counter = match channel {
            ChannelKind::BookTicker => &self.book_ticker,
            ChannelKind::AggTrade => &self.agg_trade,
            ChannelKind::Depth => &self.depth,
            ChannelKind::MarkPrice => &self.mark_price,
            ChannelKind::ForceOrder => &self.force_order,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ChannelCounterSnapshot {
        ChannelCounterSnapshot {
            book_ticker: self.book_ticker.load(Ordering::Relaxed),
            agg_trade: self.agg_trade.load(Ordering::Relaxed),
            depth: self.depth.load(Ordering::Relaxed),
            mark_price: self.mark_price.load(Ordering::Relaxed),
            force_order: self.force_order.load(Ordering::Relaxed),
            unparsed_frames: self.unparsed_frames.load(Ordering::Relaxed),
        }
    }
}

/// The normalize-and-route stage for one shard.
pub struct ShardPipeline {
    shard_id: usize,
    normalizer: Arc<EventNormalizer>,
    depth_tracker: DepthChainTracker,
    writers: WriterHandles,
    aggregator_tx: mpsc::Sender<MarketEvent>,
    counters: Arc<ChannelCounters>,
    telemetry: TelemetryBus,
}

impl ShardPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shard_id: usize,
        normalizer: Arc<EventNormalizer>,
        depth_tracker: DepthChainTracker,
        writers: WriterHandles,
        aggregator_tx: mpsc::Sender<MarketEvent>,
        counters: Arc<ChannelCounters>,
        telemetry: TelemetryBus,
    ) -> Self {
        Self {
            shard_id,
            normalizer,
            depth_tracker,
            writers,
            aggregator_tx,
            counters,
            telemetry,
        }
    }

    /// Consume frames until the client side closes the channel.
    ///
    /// Transient failures (symbol resolution against an unavailable store,
    /// snapshot fetch hiccups) retry the same frame with a pause; the
    /// stalled pipeline backs the stream client off through the bounded
    /// frame channel, so nothing is dropped while the store is away.
    pub async fn run(mut self, mut frames_rx: mpsc::Receiver<RawFrame>) {
        use market_common::error::ErrorClassification;

        debug!(shard_id = self.shard_id, "Pipeline started");

        'frames: while let Some(frame) = frames_rx.recv().await {
            loop {
                match self.process_frame(&frame).await {
                    Ok(()) => break,
                    Err(VenueError::ChannelClosed) => {
                        warn!(shard_id = self.shard_id, "Writer channels closed");
                        break 'frames;
                    }
                    Err(e) if e.is_transient() => {
                        warn!(
                            shard_id = self.shard_id,
                            error = %e,
                            "Transient failure, pausing frame processing"
                        );
                        tokio::time::sleep(
                            e.suggested_retry_delay()
                                .unwrap_or(std::time::Duration::from_millis(500)),
                        )
                        .await;
                    }
                    Err(e) => {
                        self.counters.unparsed_frames.fetch_add(1, Ordering::Relaxed);
                        debug!(shard_id = self.shard_id, error = %e, "Frame not processed");
                        break;
                    }
                }
            }
        }

        debug!(shard_id = self.shard_id, "Pipeline stopped");
    }

    async fn process_frame(&mut self, frame: &RawFrame) -> Result<(), VenueError> {
        let event = match self.normalizer.normalize_frame(&frame.payload).await? {
            Some(event) => event,
            None => return Ok(()),
        };

        // Depth events pass through the chain gate; a broken chain
        // triggers a snapshot and re-base inside the tracker.
        if let MarketEvent::Depth(ref record) = event {
            let symbol = self
                .normalizer
                .registry()
                .symbol_for_id(record.symbol_id)
                .unwrap_or_default();
            let observation = self.depth_tracker.observe(&symbol, record).await?;

            if let Some(snapshot_last) = observation.resynced {
                self.telemetry.publish(TelemetryEvent::DepthResync {
                    symbol_id: record.symbol_id,
                    snapshot_last_update_id: snapshot_last,
                    discarded: self.depth_tracker.discarded(),
                });
            }
            if !observation.accept {
                return Ok(());
            }
        }

        self.counters.record(event.channel());

        // Rollups consume book ticker and trade events; the send is
        // bounded so a stalled aggregator slows ingest instead of
        // silently losing derived data.
        if matches!(
            event.channel(),
            ChannelKind::BookTicker | ChannelKind::AggTrade
        ) && self.aggregator_tx.send(event.clone()).await.is_err()
        {
            return Err(VenueError::ChannelClosed);
        }

        self.writers
            .dispatch(event)
            .await
            .map_err(|_| VenueError::ChannelClosed)
    }
}
