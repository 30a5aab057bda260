//! Batch writer
//!
//! One task per raw table. Each task owns a [`TableBuffer`] flushed on a
//! size or age trigger with a single idempotent bulk upsert. Transient
//! store failures are retried with backoff while the buffer absorbs the
//! outage up to a hard cap; persistent constraint violations are bisected
//! until the smallest failing unit is quarantined.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use market_common::error::{retry_with_backoff, ErrorClassification};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::TableBuffer;
use crate::config::IngestSettings;
use crate::schema::{
    BookTickerRecord, DepthRecord, ForceOrderRecord, MarkPriceRecord, MarketEvent, TradeRecord,
};
use crate::storage::{MarketDataRepository, RepositoryResult};
use crate::telemetry::{TelemetryBus, TelemetryEvent};

/// Rows the writer can persist in bulk.
#[async_trait]
trait TableRows: Sized + Send + Sync + 'static {
    const TABLE: &'static str;
    async fn persist(repo: &MarketDataRepository, rows: &[Self]) -> RepositoryResult<u64>;
}

#[async_trait]
impl TableRows for BookTickerRecord {
    const TABLE: &'static str = "book_ticker";
    async fn persist(repo: &MarketDataRepository, rows: &[Self]) -> RepositoryResult<u64> {
        repo.insert_book_ticker_batch(rows).await
    }
}

#[async_trait]
impl TableRows for TradeRecord {
    const TABLE: &'static str = "trades";
    async fn persist(repo: &MarketDataRepository, rows: &[Self]) -> RepositoryResult<u64> {
        repo.insert_trades_batch(rows).await
    }
}

#[async_trait]
impl TableRows for DepthRecord {
    const TABLE: &'static str = "depth_events";
    async fn persist(repo: &MarketDataRepository, rows: &[Self]) -> RepositoryResult<u64> {
        repo.insert_depth_batch(rows).await
    }
}

#[async_trait]
impl TableRows for MarkPriceRecord {
    const TABLE: &'static str = "mark_price";
    async fn persist(repo: &MarketDataRepository, rows: &[Self]) -> RepositoryResult<u64> {
        repo.insert_mark_price_batch(rows).await
    }
}

#[async_trait]
impl TableRows for ForceOrderRecord {
    const TABLE: &'static str = "force_orders";
    async fn persist(repo: &MarketDataRepository, rows: &[Self]) -> RepositoryResult<u64> {
        repo.insert_force_orders_batch(rows).await
    }
}

/// Senders into the per-table writer tasks.
#[derive(Clone)]
pub struct WriterHandles {
    pub book_ticker: mpsc::Sender<BookTickerRecord>,
    pub trades: mpsc::Sender<TradeRecord>,
    pub depth: mpsc::Sender<DepthRecord>,
    pub mark_price: mpsc::Sender<MarkPriceRecord>,
    pub force_orders: mpsc::Sender<ForceOrderRecord>,
}

impl WriterHandles {
    /// Route one normalized event to its table queue. Blocks when the
    /// queue is full, which is how backpressure reaches the stream client.
    pub async fn dispatch(&self, event: MarketEvent) -> Result<(), mpsc::error::SendError<()>> {
        let result = match event {
            MarketEvent::BookTicker(r) => self.book_ticker.send(r).await.map_err(|_| ()),
            MarketEvent::Trade(r) => self.trades.send(r).await.map_err(|_| ()),
            MarketEvent::Depth(r) => self.depth.send(r).await.map_err(|_| ()),
            MarketEvent::MarkPrice(r) => self.mark_price.send(r).await.map_err(|_| ()),
            MarketEvent::ForceOrder(r) => self.force_orders.send(r).await.map_err(|_| ()),
        };
        result.map_err(mpsc::error::SendError)
    }
}

/// Spawns and owns the per-table writer tasks.
pub struct BatchWriter;

impl BatchWriter {
    /// Spawn one writer task per raw table.
    pub fn spawn(
        repo: Arc<MarketDataRepository>,
        settings: &IngestSettings,
        telemetry: TelemetryBus,
        shutdown: watch::Receiver<bool>,
    ) -> (WriterHandles, Vec<JoinHandle<()>>) {
        let (bt_tx, bt_rx) = mpsc::channel(settings.queue_capacity);
        let (tr_tx, tr_rx) = mpsc::channel(settings.queue_capacity);
        let (dp_tx, dp_rx) = mpsc::channel(settings.queue_capacity);
        let (mp_tx, mp_rx) = mpsc::channel(settings.queue_capacity);
        let (fo_tx, fo_rx) = mpsc::channel(settings.queue_capacity);

        let handles = vec![
            tokio::spawn(run_table_writer::<BookTickerRecord>(
                repo.clone(),
                bt_rx,
                settings.clone(),
                telemetry.clone(),
                shutdown.clone(),
            )),
            tokio::spawn(run_table_writer::<TradeRecord>(
                repo.clone(),
                tr_rx,
                settings.clone(),
                telemetry.clone(),
                shutdown.clone(),
            )),
            tokio::spawn(run_table_writer::<DepthRecord>(
                repo.clone(),
                dp_rx,
                settings.clone(),
                telemetry.clone(),
                shutdown.clone(),
            )),
            tokio::spawn(run_table_writer::<MarkPriceRecord>(
                repo.clone(),
                mp_rx,
                settings.clone(),
                telemetry.clone(),
                shutdown.clone(),
            )),
            tokio::spawn(run_table_writer::<ForceOrderRecord>(
                repo.clone(),
                fo_rx,
                settings.clone(),
                telemetry.clone(),
                shutdown,
            )),
        ];

        (
            WriterHandles {
                book_ticker: bt_tx,
                trades: tr_tx,
                depth: dp_tx,
                mark_price: mp_tx,
                force_orders: fo_tx,
            },
            handles,
        )
    }
}

/// The per-table writer loop.
async fn run_table_writer<T: TableRows>(
    repo: Arc<MarketDataRepository>,
    mut rx: mpsc::Receiver<T>,
    settings: IngestSettings,
    telemetry: TelemetryBus,
    mut shutdown: watch::Receiver<bool>,
) {
    let max_age = Duration::from_secs(settings.batch_max_age_secs);
    let mut buffer = TableBuffer::new(settings.batch_size, max_age, settings.buffer_hard_cap);
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let mut degraded = false;

    debug!(table = T::TABLE, "Writer task started");

    loop {
        let can_accept = !buffer.at_hard_cap();
        tokio::select! {
            row = rx.recv(), if can_accept => {
                match row {
                    Some(row) => {
                        buffer.push(row);
                    }
                    None => {
                        // All senders gone: final flush, then exit.
                        final_flush(&repo, &mut buffer, &settings, &telemetry).await;
                        break;
                    }
                }
            }
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    drain_on_shutdown(&repo, &mut rx, &mut buffer, &settings, &telemetry).await;
                    break;
                }
            }
        }

        if buffer.should_flush() || buffer.at_hard_cap() {
            flush(&repo, &mut buffer, &settings, &telemetry, &mut degraded).await;
        }
    }

    debug!(table = T::TABLE, "Writer task stopped");
}

/// Flush the buffer. Transient failures restore the rows (the buffer and
/// eventually the bounded queues absorb the outage); permanent failures go
/// through bisection.
async fn flush<T: TableRows>(
    repo: &MarketDataRepository,
    buffer: &mut TableBuffer<T>,
    settings: &IngestSettings,
    telemetry: &TelemetryBus,
    degraded: &mut bool,
) {
    if buffer.is_empty() {
        return;
    }

    let rows = buffer.drain();
    let count = rows.len();
    let started = std::time::Instant::now();

    match retry_with_backoff(
        || T::persist(repo, &rows),
        settings.flush_max_retries,
        Duration::from_millis(200),
    )
    .await
    {
        Ok(inserted) => {
            telemetry.publish(TelemetryEvent::BatchFlushed {
                table: T::TABLE,
                rows: count,
                inserted,
                duration_ms: started.elapsed().as_millis() as u64,
            });
            if *degraded {
                *degraded = false;
                info!(table = T::TABLE, "Store recovered, backlog flushed");
                telemetry.publish(TelemetryEvent::Degraded {
                    on: false,
                    reason: format!("{} writer recovered", T::TABLE),
                });
            }
        }
        Err(e) if e.is_permanent() => {
            warn!(table = T::TABLE, error = %e, "Poison batch, bisecting");
            bisect_and_quarantine(repo, rows, settings, telemetry).await;
        }
        Err(e) => {
            // Retry budget exhausted on a transient error: keep the rows
            // and flag degraded mode until a later flush succeeds.
            warn!(
                table = T::TABLE,
                error = %e,
                buffered = count,
                "Flush failed, store unavailable"
            );
            buffer.restore(rows);
            if !*degraded {
                *degraded = true;
                telemetry.publish(TelemetryEvent::Degraded {
                    on: true,
                    reason: format!("{} flush failing: {}", T::TABLE, e),
                });
            }
        }
    }
}

/// Split a poison batch by bisection and quarantine the smallest failing
/// units. Rows that persist fine along the way are kept.
async fn bisect_and_quarantine<T: TableRows>(
    repo: &MarketDataRepository,
    rows: Vec<T>,
    settings: &IngestSettings,
    telemetry: &TelemetryBus,
) {
    let mut stack = vec![rows];
    let mut quarantined: usize = 0;

    while let Some(batch) = stack.pop() {
        match retry_with_backoff(
            || T::persist(repo, &batch),
            settings.flush_max_retries,
            Duration::from_millis(200),
        )
        .await
        {
            Ok(_) => {}
            Err(e) if e.is_permanent() => {
                if batch.len() <= 1 {
                    quarantined += batch.len();
                    error!(table = T::TABLE, error = %e, "Quarantined poison row");
                    telemetry.publish(TelemetryEvent::RowsQuarantined {
                        table: T::TABLE,
                        rows: batch.len(),
                        reason: e.to_string(),
                    });
                } else {
                    let mut batch = batch;
                    let tail = batch.split_off(batch.len() / 2);
                    stack.push(batch);
                    stack.push(tail);
                }
            }
            Err(e) => {
                // Store went away mid-bisection; report the batch dropped
                // rather than looping forever on shutdown paths.
                error!(table = T::TABLE, error = %e, "Store lost during bisection");
                telemetry.publish(TelemetryEvent::EventsDropped {
                    table: T::TABLE,
                    count: batch.len() as u64,
                });
            }
        }
    }

    if quarantined > 0 {
        warn!(table = T::TABLE, quarantined, "Bisection completed");
    }
}

/// On shutdown: pull whatever is already queued, then flush once with the
/// remaining retry budget. Anything that cannot land is reported dropped;
/// there is no silent loss.
async fn drain_on_shutdown<T: TableRows>(
    repo: &MarketDataRepository,
    rx: &mut mpsc::Receiver<T>,
    buffer: &mut TableBuffer<T>,
    settings: &IngestSettings,
    telemetry: &TelemetryBus,
) {
    rx.close();
    while let Ok(row) = rx.try_recv() {
        if !buffer.push(row) {
            telemetry.publish(TelemetryEvent::EventsDropped {
                table: T::TABLE,
                count: 1,
            });
        }
    }
    final_flush(repo, buffer, settings, telemetry).await;
}

async fn final_flush<T: TableRows>(
    repo: &MarketDataRepository,
    buffer: &mut TableBuffer<T>,
    settings: &IngestSettings,
    telemetry: &TelemetryBus,
) {
    if buffer.is_empty() {
        return;
    }
    let rows = buffer.drain();
    let count = rows.len();
    match retry_with_backoff(
        || T::persist(repo, &rows),
        settings.flush_max_retries,
        Duration::from_millis(200),
    )
    .await
    {
        Ok(inserted) => {
            info!(table = T::TABLE, rows = count, inserted, "Final flush complete");
        }
        Err(e) => {
            error!(table = T::TABLE, rows = count, error = %e, "Final flush failed");
            telemetry.publish(TelemetryEvent::EventsDropped {
                table: T::TABLE,
                count: count as u64,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseSettings;

    fn lazy_repo() -> Arc<MarketDataRepository> {
        Arc::new(
            MarketDataRepository::from_settings_lazy(&DatabaseSettings {
                url: "postgresql://127.0.0.1:1/na".to_string(),
                max_connections: 1,
                min_connections: 0,
                acquire_timeout_secs: 1,
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_writers_stop_on_shutdown() {
        let repo = lazy_repo();
        let settings = IngestSettings {
            flush_max_retries: 1,
            ..IngestSettings::default()
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handles, tasks) =
            BatchWriter::spawn(repo, &settings, TelemetryBus::default(), shutdown_rx);

        drop(handles);
        shutdown_tx.send(true).unwrap();

        for task in tasks {
            tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .expect("writer did not stop")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_unflushed_rows_reported_dropped_on_shutdown() {
        let repo = lazy_repo();
        let settings = IngestSettings {
            flush_max_retries: 1,
            batch_size: 100,
            ..IngestSettings::default()
        };
        let telemetry = TelemetryBus::new(64);
        let mut events = telemetry.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handles, tasks) =
            BatchWriter::spawn(repo, &settings, telemetry.clone(), shutdown_rx);

        handles
            .trades
            .send(TradeRecord {
                symbol_id: 1,
                ts_exchange: chrono::Utc::now(),
                ts_ingest: chrono::Utc::now(),
                agg_trade_id: 1,
                price: rust_decimal::Decimal::ONE,
                qty: rust_decimal::Decimal::ONE,
                is_buyer_maker: false,
            })
            .await
            .unwrap();

        drop(handles);
        shutdown_tx.send(true).unwrap();
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .expect("writer did not stop")
                .unwrap();
        }

        // The store at port 1 is unreachable, so the drained row must be
        // accounted for as dropped.
        let mut saw_drop = false;
        while let Ok(event) = events.try_recv() {
            if matches!(
                event,
                TelemetryEvent::EventsDropped { table: "trades", .. }
            ) {
                saw_drop = true;
            }
        }
        assert!(saw_drop);
    }
}
