//! Per-second rollups.
//!
//! Accumulators build `bt_1s` and `trade_1s` rows incrementally from the
//! normalized event stream. A second [t, t+1) for a symbol closes when an
//! event with `ts_exchange >= t+1+grace` arrives on that channel, or when
//! the maximum lateness elapses on the wall clock. Closed rows are
//! upserted; events arriving after closure trigger an idempotent
//! recompute of the affected row from the raw tables (default policy) or
//! are dropped (reject policy).
//!
//! OHLC tie-breaks: open takes the earliest `ts_exchange`, close the
//! latest; among events sharing a timestamp the larger update id wins,
//! and with no update id the later-inserted event wins.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use market_common::error::retry_with_backoff;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{AggregateSettings, LateEventPolicy};
use crate::schema::{BookTickerRecord, BtSecondRow, MarketEvent, TradeRecord, TradeSecondRow};
use crate::storage::MarketDataRepository;
use crate::telemetry::{TelemetryBus, TelemetryEvent};

/// Ranking for events sharing a ts_exchange: larger update id wins, then
/// later insertion.
type TieKey = (i64, u64);

/// One open second of book ticker activity.
#[derive(Debug)]
pub struct BtSecondAccumulator {
    symbol_id: i64,
    epoch_second: i64,
    opened_at: Instant,

    open: Decimal,
    open_ts: DateTime<Utc>,
    open_key: TieKey,
    close: Decimal,
    close_ts: DateTime<Utc>,
    close_key: TieKey,
    high: Decimal,
    low: Decimal,

    spread_sum: Decimal,
    spread_max: Decimal,
    bid_qty_sum: Decimal,
    ask_qty_sum: Decimal,
    weighted_mid_sum: Decimal,
    weight_sum: Decimal,
    count: i64,
}

impl BtSecondAccumulator {
    fn new(record: &BookTickerRecord, epoch_second: i64, seq: u64) -> Self {
        let key = (record.update_id, seq);
        Self {
            symbol_id: record.symbol_id,
            epoch_second,
            opened_at: Instant::now(),
            open: record.mid,
            open_ts: record.ts_exchange,
            open_key: key,
            close: record.mid,
            close_ts: record.ts_exchange,
            close_key: key,
            high: record.mid,
            low: record.mid,
            spread_sum: record.spread,
            spread_max: record.spread,
            bid_qty_sum: record.bid_qty,
            ask_qty_sum: record.ask_qty,
            weighted_mid_sum: record.mid * (record.bid_qty + record.ask_qty),
            weight_sum: record.bid_qty + record.ask_qty,
            count: 1,
        }
    }

    fn apply(&mut self, record: &BookTickerRecord, seq: u64) {
        let key = (record.update_id, seq);

        // Open: earliest timestamp; ties resolved toward the winning key.
        if record.ts_exchange < self.open_ts
            || (record.ts_exchange == self.open_ts && key > self.open_key)
        {
            self.open = record.mid;
            self.open_ts = record.ts_exchange;
            self.open_key = key;
        }
        // Close: latest timestamp, same tie rule.
        if record.ts_exchange > self.close_ts
            || (record.ts_exchange == self.close_ts && key > self.close_key)
        {
            self.close = record.mid;
            self.close_ts = record.ts_exchange;
            self.close_key = key;
        }

        self.high = self.high.max(record.mid);
        self.low = self.low.min(record.mid);
        self.spread_sum += record.spread;
        self.spread_max = self.spread_max.max(record.spread);
        self.bid_qty_sum += record.bid_qty;
        self.ask_qty_sum += record.ask_qty;
        self.weighted_mid_sum += record.mid * (record.bid_qty + record.ask_qty);
        self.weight_sum += record.bid_qty + record.ask_qty;
        self.count += 1;
    }

    fn finish(&self) -> BtSecondRow {
        let n = Decimal::from(self.count);
        BtSecondRow {
            symbol_id: self.symbol_id,
            ts_second: epoch_to_ts(self.epoch_second),
            mid_open: self.open,
            mid_high: self.high,
            mid_low: self.low,
            mid_close: self.close,
            spread_mean: self.spread_sum / n,
            spread_max: self.spread_max,
            bid_qty_mean: self.bid_qty_sum / n,
            ask_qty_mean: self.ask_qty_sum / n,
            vw_mid: if self.weight_sum > Decimal::ZERO {
                Some(self.weighted_mid_sum / self.weight_sum)
            } else {
                None
            },
            update_count: self.count,
        }
    }
}

/// One open second of trade activity.
#[derive(Debug)]
pub struct TradeSecondAccumulator {
    symbol_id: i64,
    epoch_second: i64,
    opened_at: Instant,

    count: i64,
    volume: Decimal,
    value: Decimal,
    buy_volume: Decimal,
    sell_volume: Decimal,
    buy_count: i64,
    sell_count: i64,
    price_min: Decimal,
    price_max: Decimal,
}

impl TradeSecondAccumulator {
    fn new(record: &TradeRecord, epoch_second: i64) -> Self {
        let mut acc = Self {
            symbol_id: record.symbol_id,
            epoch_second,
            opened_at: Instant::now(),
            count: 0,
            volume: Decimal::ZERO,
            value: Decimal::ZERO,
            buy_volume: Decimal::ZERO,
            sell_volume: Decimal::ZERO,
            buy_count: 0,
            sell_count: 0,
            price_min: record.price,
            price_max: record.price,
        };
        acc.apply(record);
        acc
    }

    fn apply(&mut self, record: &TradeRecord) {
        self.count += 1;
        self.volume += record.qty;
        self.value += record.price * record.qty;
        // Buyer-is-maker means the aggressor sold.
        if record.is_buyer_maker {
            self.sell_volume += record.qty;
            self.sell_count += 1;
        } else {
            self.buy_volume += record.qty;
            self.buy_count += 1;
        }
        self.price_min = self.price_min.min(record.price);
        self.price_max = self.price_max.max(record.price);
    }

    fn finish(&self) -> TradeSecondRow {
        TradeSecondRow {
            symbol_id: self.symbol_id,
            ts_second: epoch_to_ts(self.epoch_second),
            trade_count: self.count,
            volume_sum: self.volume,
            value_sum: self.value,
            vwap: if self.volume > Decimal::ZERO {
                Some(self.value / self.volume)
            } else {
                None
            },
            buy_volume: self.buy_volume,
            sell_volume: self.sell_volume,
            buy_count: self.buy_count,
            sell_count: self.sell_count,
            price_min: self.price_min,
            price_max: self.price_max,
            imbalance_ratio: if self.volume > Decimal::ZERO {
                Some(self.buy_volume / self.volume)
            } else {
                None
            },
        }
    }
}

/// What the engine wants done after observing an event.
#[derive(Debug)]
pub enum RollupOutput {
    CloseBt(BtSecondRow),
    CloseTrade(TradeSecondRow),
    /// A closed second saw a late event and must be recomputed from raw.
    RecomputeBt { symbol_id: i64, ts_second: DateTime<Utc> },
    RecomputeTrade { symbol_id: i64, ts_second: DateTime<Utc> },
}

/// Rollup state machine for all symbols.
pub struct RollupEngine {
    grace_ms: i64,
    max_lateness: Duration,
    late_policy: LateEventPolicy,
    seq: u64,

    bt_open: HashMap<(i64, i64), BtSecondAccumulator>,
    trade_open: HashMap<(i64, i64), TradeSecondAccumulator>,
    /// Per symbol: seconds at or below this are closed.
    bt_closed_through: HashMap<i64, i64>,
    trade_closed_through: HashMap<i64, i64>,
}

impl RollupEngine {
    pub fn new(settings: &AggregateSettings) -> Self {
        Self {
            grace_ms: settings.grace_ms as i64,
            max_lateness: Duration::from_secs(settings.max_lateness_secs),
            late_policy: settings.late_event_policy,
            seq: 0,
            bt_open: HashMap::new(),
            trade_open: HashMap::new(),
            bt_closed_through: HashMap::new(),
            trade_closed_through: HashMap::new(),
        }
    }

    /// Feed one event; returns closed rows and recompute requests.
    pub fn observe(&mut self, event: &MarketEvent) -> Vec<RollupOutput> {
        self.seq += 1;
        match event {
            MarketEvent::BookTicker(r) => self.observe_bt(r),
            MarketEvent::Trade(r) => self.observe_trade(r),
            _ => Vec::new(),
        }
    }

    fn observe_bt(&mut self, record: &BookTickerRecord) -> Vec<RollupOutput> {
        let mut out = Vec::new();
        let sec = epoch_second(record.ts_exchange);
        let closed_through = self.bt_closed_through.get(&record.symbol_id).copied();

        if let Some(limit) = closed_through {
            if sec <= limit {
                // Late arrival past closure.
                if self.late_policy == LateEventPolicy::Update {
                    out.push(RollupOutput::RecomputeBt {
                        symbol_id: record.symbol_id,
                        ts_second: epoch_to_ts(sec),
                    });
                }
                return out;
            }
        }

        let seq = self.seq;
        self.bt_open
            .entry((record.symbol_id, sec))
            .and_modify(|acc| acc.apply(record, seq))
            .or_insert_with(|| BtSecondAccumulator::new(record, sec, seq));

        // An event at ts closes every second t with t+1+grace <= ts.
        let newly_closed = (record.ts_exchange.timestamp_millis() - self.grace_ms) / 1000 - 1;
        if newly_closed > closed_through.unwrap_or(i64::MIN) {
            out.extend(self.close_bt_through(record.symbol_id, newly_closed));
        }
        out
    }

    fn observe_trade(&mut self, record: &TradeRecord) -> Vec<RollupOutput> {
        let mut out = Vec::new();
        let sec = epoch_second(record.ts_exchange);
        let closed_through = self.trade_closed_through.get(&record.symbol_id).copied();

        if let Some(limit) = closed_through {
            if sec <= limit {
                if self.late_policy == LateEventPolicy::Update {
                    out.push(RollupOutput::RecomputeTrade {
                        symbol_id: record.symbol_id,
                        ts_second: epoch_to_ts(sec),
                    });
                }
                return out;
            }
        }

        self.trade_open
            .entry((record.symbol_id, sec))
            .and_modify(|acc| acc.apply(record))
            .or_insert_with(|| TradeSecondAccumulator::new(record, sec));

        let newly_closed = (record.ts_exchange.timestamp_millis() - self.grace_ms) / 1000 - 1;
        if newly_closed > closed_through.unwrap_or(i64::MIN) {
            out.extend(self.close_trade_through(record.symbol_id, newly_closed));
        }
        out
    }

    fn close_bt_through(&mut self, symbol_id: i64, through: i64) -> Vec<RollupOutput> {
        let mut out = Vec::new();
        let keys: Vec<(i64, i64)> = self
            .bt_open
            .keys()
            .filter(|(sym, sec)| *sym == symbol_id && *sec <= through)
            .copied()
            .collect();
        for key in keys {
            if let Some(acc) = self.bt_open.remove(&key) {
                out.push(RollupOutput::CloseBt(acc.finish()));
            }
        }
        self.bt_closed_through.insert(symbol_id, through);
        out
    }

    fn close_trade_through(&mut self, symbol_id: i64, through: i64) -> Vec<RollupOutput> {
        let mut out = Vec::new();
        let keys: Vec<(i64, i64)> = self
            .trade_open
            .keys()
            .filter(|(sym, sec)| *sym == symbol_id && *sec <= through)
            .copied()
            .collect();
        for key in keys {
            if let Some(acc) = self.trade_open.remove(&key) {
                out.push(RollupOutput::CloseTrade(acc.finish()));
            }
        }
        self.trade_closed_through.insert(symbol_id, through);
        out
    }

    /// Force-close accumulators whose lateness bound has elapsed on the
    /// wall clock. Quiet symbols close their seconds this way.
    pub fn close_overdue(&mut self, now: Instant) -> Vec<RollupOutput> {
        let max_lateness = self.max_lateness;
        let mut out = Vec::new();

        let overdue_bt: Vec<(i64, i64)> = self
            .bt_open
            .iter()
            .filter(|(_, acc)| now.duration_since(acc.opened_at) >= max_lateness)
            .map(|(k, _)| *k)
            .collect();
        for (symbol_id, sec) in overdue_bt {
            if let Some(acc) = self.bt_open.remove(&(symbol_id, sec)) {
                out.push(RollupOutput::CloseBt(acc.finish()));
                let entry = self.bt_closed_through.entry(symbol_id).or_insert(sec);
                *entry = (*entry).max(sec);
            }
        }

        let overdue_trade: Vec<(i64, i64)> = self
            .trade_open
            .iter()
            .filter(|(_, acc)| now.duration_since(acc.opened_at) >= max_lateness)
            .map(|(k, _)| *k)
            .collect();
        for (symbol_id, sec) in overdue_trade {
            if let Some(acc) = self.trade_open.remove(&(symbol_id, sec)) {
                out.push(RollupOutput::CloseTrade(acc.finish()));
                let entry = self.trade_closed_through.entry(symbol_id).or_insert(sec);
                *entry = (*entry).max(sec);
            }
        }

        out
    }

    /// Close everything still open (shutdown path).
    pub fn flush_all(&mut self) -> Vec<RollupOutput> {
        let mut out = Vec::new();
        for (_, acc) in self.bt_open.drain() {
            out.push(RollupOutput::CloseBt(acc.finish()));
        }
        for (_, acc) in self.trade_open.drain() {
            out.push(RollupOutput::CloseTrade(acc.finish()));
        }
        out
    }

    /// Open accumulator count (for status).
    pub fn open_seconds(&self) -> usize {
        self.bt_open.len() + self.trade_open.len()
    }

    /// Drive the engine from the event stream until shutdown.
    pub async fn run(
        mut self,
        repo: Arc<MarketDataRepository>,
        telemetry: TelemetryBus,
        mut events: mpsc::Receiver<MarketEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Rollup engine started");
        let mut ticker = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => {
                        let outputs = self.observe(&event);
                        apply_outputs(&repo, &telemetry, outputs).await;
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    let outputs = self.close_overdue(Instant::now());
                    apply_outputs(&repo, &telemetry, outputs).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let outputs = self.flush_all();
        let remaining = outputs.len();
        apply_outputs(&repo, &telemetry, outputs).await;
        info!(flushed = remaining, "Rollup engine stopped");
    }
}

async fn apply_outputs(
    repo: &MarketDataRepository,
    telemetry: &TelemetryBus,
    outputs: Vec<RollupOutput>,
) {
    for output in outputs {
        let result = match &output {
            RollupOutput::CloseBt(row) => {
                let r = retry_with_backoff(
                    || repo.upsert_bt_second(row),
                    3,
                    Duration::from_millis(200),
                )
                .await;
                if r.is_ok() {
                    telemetry.publish(TelemetryEvent::SecondClosed {
                        symbol_id: row.symbol_id,
                        ts_second: row.ts_second,
                    });
                }
                r
            }
            RollupOutput::CloseTrade(row) => {
                retry_with_backoff(|| repo.upsert_trade_second(row), 3, Duration::from_millis(200))
                    .await
            }
            RollupOutput::RecomputeBt { symbol_id, ts_second } => {
                debug!(symbol_id, %ts_second, "Late book ticker event, recomputing second");
                telemetry.publish(TelemetryEvent::LateRecompute {
                    symbol_id: *symbol_id,
                    ts_second: *ts_second,
                });
                retry_with_backoff(
                    || repo.recompute_bt_second(*symbol_id, *ts_second),
                    3,
                    Duration::from_millis(200),
                )
                .await
            }
            RollupOutput::RecomputeTrade { symbol_id, ts_second } => {
                telemetry.publish(TelemetryEvent::LateRecompute {
                    symbol_id: *symbol_id,
                    ts_second: *ts_second,
                });
                retry_with_backoff(
                    || repo.recompute_trade_second(*symbol_id, *ts_second),
                    3,
                    Duration::from_millis(200),
                )
                .await
            }
        };

        if let Err(e) = result {
            // The row stays recomputable from raw; losing one upsert is
            // not data loss.
            warn!(error = %e, "Aggregate upsert failed");
        }
    }
}

fn epoch_second(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis().div_euclid(1000)
}

fn epoch_to_ts(sec: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(sec, 0).expect("second within chrono range")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::MarketEvent;
    use rust_decimal_macros::dec;

    fn settings() -> AggregateSettings {
        AggregateSettings {
            grace_ms: 500,
            max_lateness_secs: 5,
            ..AggregateSettings::default()
        }
    }

    fn bt(symbol_id: i64, ts_ms: i64, update_id: i64, bid: Decimal, ask: Decimal) -> MarketEvent {
        let spread = ask - bid;
        let mid = (ask + bid) / dec!(2);
        MarketEvent::BookTicker(BookTickerRecord {
            symbol_id,
            ts_exchange: DateTime::from_timestamp_millis(ts_ms).unwrap(),
            ts_ingest: Utc::now(),
            update_id,
            best_bid: bid,
            best_ask: ask,
            bid_qty: dec!(1),
            ask_qty: dec!(1),
            spread,
            mid,
        })
    }

    fn trade(symbol_id: i64, ts_ms: i64, id: i64, price: Decimal, qty: Decimal, maker: bool) -> MarketEvent {
        MarketEvent::Trade(TradeRecord {
            symbol_id,
            ts_exchange: DateTime::from_timestamp_millis(ts_ms).unwrap(),
            ts_ingest: Utc::now(),
            agg_trade_id: id,
            price,
            qty,
            is_buyer_maker: maker,
        })
    }

    fn closed_bt(outputs: &[RollupOutput]) -> Vec<&BtSecondRow> {
        outputs
            .iter()
            .filter_map(|o| match o {
                RollupOutput::CloseBt(row) => Some(row),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_thousand_frames_cover_ten_seconds() {
        // 1,000 synthetic frames 10 ms apart starting at T0.
        let mut engine = RollupEngine::new(&settings());
        let t0: i64 = 1_700_000_000_000;
        let mut outputs = Vec::new();

        for i in 0..1000 {
            let ts = t0 + i * 10;
            let bid = dec!(100) + Decimal::from(i) / dec!(1000);
            let ask = bid + dec!(1);
            outputs.extend(engine.observe(&bt(1, ts, i, bid, ask)));
        }
        outputs.extend(engine.flush_all());

        let rows = closed_bt(&outputs);
        assert_eq!(rows.len(), 10);

        let total_updates: i64 = rows.iter().map(|r| r.update_count).sum();
        assert_eq!(total_updates, 1000);

        // Each full second has 100 updates, open at the first frame and
        // close at the last.
        let first = rows
            .iter()
            .find(|r| r.ts_second.timestamp() == t0 / 1000)
            .unwrap();
        assert_eq!(first.update_count, 100);
        assert_eq!(first.mid_open, dec!(100.5));
        // Frame 99: bid = 100.099, mid = 100.599
        assert_eq!(first.mid_close, dec!(100.599));
        assert_eq!(first.mid_low, first.mid_open);
        assert_eq!(first.mid_high, first.mid_close);
        assert_eq!(first.spread_mean, dec!(1));
    }

    #[test]
    fn test_second_closes_on_grace_boundary() {
        let mut engine = RollupEngine::new(&settings());
        let t0: i64 = 1_700_000_000_000;

        assert!(engine.observe(&bt(1, t0, 1, dec!(10), dec!(11))).is_empty());
        // t0+1.4s is before t0+1s+grace: second 0 stays open.
        assert!(engine
            .observe(&bt(1, t0 + 1400, 2, dec!(10), dec!(11)))
            .is_empty());
        // t0+1.6s is past t0+1s+0.5s grace: second 0 closes.
        let outputs = engine.observe(&bt(1, t0 + 1600, 3, dec!(10), dec!(11)));
        assert_eq!(closed_bt(&outputs).len(), 1);
    }

    #[test]
    fn test_tie_break_larger_update_id_wins() {
        let mut engine = RollupEngine::new(&settings());
        let t0: i64 = 1_700_000_000_000;

        // Two events at the exact same ts_exchange, out of id order.
        engine.observe(&bt(1, t0, 7, dec!(100), dec!(102)));
        engine.observe(&bt(1, t0, 9, dec!(200), dec!(202)));
        engine.observe(&bt(1, t0, 8, dec!(300), dec!(302)));

        let outputs = engine.flush_all();
        let rows = closed_bt(&outputs);
        assert_eq!(rows.len(), 1);
        // update id 9 wins both open and close at that instant.
        assert_eq!(rows[0].mid_open, dec!(201));
        assert_eq!(rows[0].mid_close, dec!(201));
    }

    #[test]
    fn test_tie_break_insertion_order_without_update_id() {
        let mut engine = RollupEngine::new(&settings());
        let t0: i64 = 1_700_000_000_000;

        // update_id 0 stands for "absent"; later insertion wins.
        engine.observe(&bt(1, t0, 0, dec!(100), dec!(102)));
        engine.observe(&bt(1, t0, 0, dec!(200), dec!(202)));

        let outputs = engine.flush_all();
        let rows = closed_bt(&outputs);
        assert_eq!(rows[0].mid_close, dec!(201));
        assert_eq!(rows[0].mid_open, dec!(201));
    }

    #[test]
    fn test_late_event_requests_recompute() {
        let mut engine = RollupEngine::new(&settings());
        let t0: i64 = 1_700_000_000_000;

        engine.observe(&bt(1, t0, 1, dec!(10), dec!(11)));
        // Far ahead: closes second 0.
        let outputs = engine.observe(&bt(1, t0 + 5000, 2, dec!(10), dec!(11)));
        assert_eq!(closed_bt(&outputs).len(), 1);

        // An event for the closed second now triggers a recompute.
        let outputs = engine.observe(&bt(1, t0 + 500, 3, dec!(10), dec!(11)));
        assert!(matches!(
            outputs.as_slice(),
            [RollupOutput::RecomputeBt { symbol_id: 1, .. }]
        ));
    }

    #[test]
    fn test_late_event_rejected_under_reject_policy() {
        let mut cfg = settings();
        cfg.late_event_policy = LateEventPolicy::Reject;
        let mut engine = RollupEngine::new(&cfg);
        let t0: i64 = 1_700_000_000_000;

        engine.observe(&bt(1, t0, 1, dec!(10), dec!(11)));
        engine.observe(&bt(1, t0 + 5000, 2, dec!(10), dec!(11)));
        let outputs = engine.observe(&bt(1, t0 + 500, 3, dec!(10), dec!(11)));
        assert!(outputs.is_empty());
    }

    #[test]
    fn test_trade_rollup_vwap_and_imbalance() {
        let mut engine = RollupEngine::new(&settings());
        let t0: i64 = 1_700_000_000_000;

        // Taker buys 2 @ 100, taker sells 1 @ 103.
        engine.observe(&trade(1, t0, 1, dec!(100), dec!(2), false));
        engine.observe(&trade(1, t0 + 100, 2, dec!(103), dec!(1), true));

        let outputs = engine.flush_all();
        let row = outputs
            .iter()
            .find_map(|o| match o {
                RollupOutput::CloseTrade(row) => Some(row),
                _ => None,
            })
            .unwrap();

        assert_eq!(row.trade_count, 2);
        assert_eq!(row.volume_sum, dec!(3));
        assert_eq!(row.value_sum, dec!(303));
        assert_eq!(row.vwap, Some(dec!(101)));
        assert_eq!(row.buy_volume, dec!(2));
        assert_eq!(row.sell_volume, dec!(1));
        assert_eq!(row.buy_count, 1);
        assert_eq!(row.sell_count, 1);
        assert_eq!(row.price_min, dec!(100));
        assert_eq!(row.price_max, dec!(103));
        assert_eq!(
            row.imbalance_ratio,
            Some(dec!(2) / dec!(3))
        );
    }

    #[test]
    fn test_overdue_seconds_close_on_wall_clock() {
        let mut cfg = settings();
        cfg.max_lateness_secs = 0;
        let mut engine = RollupEngine::new(&cfg);
        let t0: i64 = 1_700_000_000_000;

        engine.observe(&bt(1, t0, 1, dec!(10), dec!(11)));
        // With a zero lateness bound the tick closes it immediately.
        let outputs = engine.close_overdue(Instant::now());
        assert_eq!(closed_bt(&outputs).len(), 1);

        // And a later event for that second is now late.
        let outputs = engine.observe(&bt(1, t0 + 100, 2, dec!(10), dec!(11)));
        assert!(matches!(
            outputs.as_slice(),
            [RollupOutput::RecomputeBt { .. }]
        ));
    }

    #[test]
    fn test_symbols_roll_up_independently() {
        let mut engine = RollupEngine::new(&settings());
        let t0: i64 = 1_700_000_000_000;

        engine.observe(&bt(1, t0, 1, dec!(10), dec!(11)));
        engine.observe(&bt(2, t0, 1, dec!(20), dec!(21)));
        // Advancing symbol 1 does not close symbol 2's second.
        let outputs = engine.observe(&bt(1, t0 + 5000, 2, dec!(10), dec!(11)));
        let rows = closed_bt(&outputs);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol_id, 1);
        assert_eq!(engine.open_seconds(), 2);
    }
}
