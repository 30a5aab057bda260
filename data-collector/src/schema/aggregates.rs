//! Per-second aggregate rows.
//!
//! `bt_1s` and `trade_1s` are keyed by (symbol_id, ts_second) and are
//! recomputable from the raw tables; `core_1s_24h` is the gap-filled flat
//! grid consumed by the ML feature pipeline.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

/// One second of book ticker activity: OHLC of the mid price plus spread
/// and depth-at-top statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BtSecondRow {
    pub symbol_id: i64,
    pub ts_second: DateTime<Utc>,
    pub mid_open: Decimal,
    pub mid_high: Decimal,
    pub mid_low: Decimal,
    pub mid_close: Decimal,
    pub spread_mean: Decimal,
    pub spread_max: Decimal,
    pub bid_qty_mean: Decimal,
    pub ask_qty_mean: Decimal,
    /// Volume-weighted mid, weighted by top-of-book quantity.
    pub vw_mid: Option<Decimal>,
    pub update_count: i64,
}

/// One second of trade activity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeSecondRow {
    pub symbol_id: i64,
    pub ts_second: DateTime<Utc>,
    pub trade_count: i64,
    pub volume_sum: Decimal,
    pub value_sum: Decimal,
    pub vwap: Option<Decimal>,
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,
    pub buy_count: i64,
    pub sell_count: i64,
    pub price_min: Decimal,
    pub price_max: Decimal,
    /// buy_volume / volume_sum; None when the second has no volume.
    pub imbalance_ratio: Option<Decimal>,
}

/// One row of the 24h flat grid. Exactly one row exists per active symbol
/// per second inside the rolling window; `mid_ffill` / `spread_ffill` are
/// last-observation-carried-forward from `bt_1s`, counters are zero on
/// empty seconds and `vwap` is NULL when `trade_count` is zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridRow {
    pub symbol_id: i64,
    pub ts_second: DateTime<Utc>,
    pub mid_ffill: Option<Decimal>,
    pub spread_ffill: Option<Decimal>,
    pub trade_count: i64,
    pub volume_sum: Decimal,
    pub vwap: Option<Decimal>,
    pub update_count: i64,
}
