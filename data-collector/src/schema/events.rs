//! Normalized event records for the raw tables.
//!
//! All timestamps are UTC. `ts_exchange` is the authoritative event time
//! reported by the venue; `ts_ingest` is stamped by the normalizer on entry.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Stream channel classes offered by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelKind {
    BookTicker,
    AggTrade,
    Depth,
    MarkPrice,
    ForceOrder,
}

impl ChannelKind {
    /// All channels, in subscription order.
    pub const ALL: [ChannelKind; 5] = [
        ChannelKind::BookTicker,
        ChannelKind::AggTrade,
        ChannelKind::Depth,
        ChannelKind::MarkPrice,
        ChannelKind::ForceOrder,
    ];

    /// Wire name used in stream identifiers (e.g. `btcusdt@bookTicker`).
    pub fn stream_suffix(&self) -> &'static str {
        match self {
            ChannelKind::BookTicker => "bookTicker",
            ChannelKind::AggTrade => "aggTrade",
            ChannelKind::Depth => "depth@100ms",
            ChannelKind::MarkPrice => "markPrice@1s",
            ChannelKind::ForceOrder => "forceOrder",
        }
    }

    /// Raw table this channel feeds.
    pub fn table(&self) -> &'static str {
        match self {
            ChannelKind::BookTicker => "book_ticker",
            ChannelKind::AggTrade => "trades",
            ChannelKind::Depth => "depth_events",
            ChannelKind::MarkPrice => "mark_price",
            ChannelKind::ForceOrder => "force_orders",
        }
    }

    /// Parse from the configuration name.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "bookTicker" | "book_ticker" => Some(ChannelKind::BookTicker),
            "aggTrade" | "agg_trade" | "trades" => Some(ChannelKind::AggTrade),
            "depth" => Some(ChannelKind::Depth),
            "markPrice" | "mark_price" => Some(ChannelKind::MarkPrice),
            "forceOrder" | "force_order" => Some(ChannelKind::ForceOrder),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::BookTicker => "bookTicker",
            ChannelKind::AggTrade => "aggTrade",
            ChannelKind::Depth => "depth",
            ChannelKind::MarkPrice => "markPrice",
            ChannelKind::ForceOrder => "forceOrder",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order side for liquidation events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    /// Convert to single character representation ('B' or 'S')
    pub fn as_db_char(&self) -> char {
        match self {
            TradeSide::Buy => 'B',
            TradeSide::Sell => 'S',
        }
    }

    /// Parse from single character
    pub fn from_db_char(c: char) -> Option<Self> {
        match c {
            'B' | 'b' => Some(TradeSide::Buy),
            'S' | 's' => Some(TradeSide::Sell),
            _ => None,
        }
    }

    /// Parse from the venue's "BUY"/"SELL" strings
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" | "B" => Some(TradeSide::Buy),
            "SELL" | "S" => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

/// Best bid/ask snapshot for one instant.
///
/// Uniqueness: (symbol_id, ts_exchange, update_id); `update_id` is zero when
/// the venue did not supply one. `spread` and `mid` are derived at
/// normalization and always satisfy `spread = ask - bid`,
/// `mid = (ask + bid) / 2`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookTickerRecord {
    pub symbol_id: i64,
    pub ts_exchange: DateTime<Utc>,
    pub ts_ingest: DateTime<Utc>,
    pub update_id: i64,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub bid_qty: Decimal,
    pub ask_qty: Decimal,
    pub spread: Decimal,
    pub mid: Decimal,
}

/// Venue-side aggregated trade.
///
/// Uniqueness: (symbol_id, agg_trade_id).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeRecord {
    pub symbol_id: i64,
    pub ts_exchange: DateTime<Utc>,
    pub ts_ingest: DateTime<Utc>,
    pub agg_trade_id: i64,
    pub price: Decimal,
    pub qty: Decimal,
    pub is_buyer_maker: bool,
}

/// Incremental order book update.
///
/// Bid and ask changes are preserved verbatim as `[price, qty]` string
/// pairs for faithful reconstruction downstream; flattening into top-N
/// columns belongs to the aggregation layer, not ingest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepthRecord {
    pub symbol_id: i64,
    pub ts_exchange: DateTime<Utc>,
    pub ts_ingest: DateTime<Utc>,
    pub first_update_id: i64,
    pub final_update_id: i64,
    pub prev_final_update_id: Option<i64>,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
}

/// Mark price update (optional channel).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkPriceRecord {
    pub symbol_id: i64,
    pub ts_exchange: DateTime<Utc>,
    pub ts_ingest: DateTime<Utc>,
    pub mark_price: Decimal,
    pub index_price: Decimal,
    pub funding_rate: Option<Decimal>,
    pub next_funding_time: Option<DateTime<Utc>>,
}

/// Liquidation order (optional channel). The raw payload is preserved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForceOrderRecord {
    pub symbol_id: i64,
    pub ts_exchange: DateTime<Utc>,
    pub ts_ingest: DateTime<Utc>,
    pub side: TradeSide,
    pub price: Decimal,
    pub qty: Decimal,
    pub raw: serde_json::Value,
}

/// A normalized event, ready for the batch writer and the aggregator.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    BookTicker(BookTickerRecord),
    Trade(TradeRecord),
    Depth(DepthRecord),
    MarkPrice(MarkPriceRecord),
    ForceOrder(ForceOrderRecord),
}

impl MarketEvent {
    pub fn channel(&self) -> ChannelKind {
        match self {
            MarketEvent::BookTicker(_) => ChannelKind::BookTicker,
            MarketEvent::Trade(_) => ChannelKind::AggTrade,
            MarketEvent::Depth(_) => ChannelKind::Depth,
            MarketEvent::MarkPrice(_) => ChannelKind::MarkPrice,
            MarketEvent::ForceOrder(_) => ChannelKind::ForceOrder,
        }
    }

    pub fn symbol_id(&self) -> i64 {
        match self {
            MarketEvent::BookTicker(r) => r.symbol_id,
            MarketEvent::Trade(r) => r.symbol_id,
            MarketEvent::Depth(r) => r.symbol_id,
            MarketEvent::MarkPrice(r) => r.symbol_id,
            MarketEvent::ForceOrder(r) => r.symbol_id,
        }
    }

    pub fn ts_exchange(&self) -> DateTime<Utc> {
        match self {
            MarketEvent::BookTicker(r) => r.ts_exchange,
            MarketEvent::Trade(r) => r.ts_exchange,
            MarketEvent::Depth(r) => r.ts_exchange,
            MarketEvent::MarkPrice(r) => r.ts_exchange,
            MarketEvent::ForceOrder(r) => r.ts_exchange,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_round_trip() {
        for kind in ChannelKind::ALL {
            assert_eq!(ChannelKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(ChannelKind::from_str("klines"), None);
    }

    #[test]
    fn test_channel_stream_suffix() {
        assert_eq!(ChannelKind::BookTicker.stream_suffix(), "bookTicker");
        assert_eq!(ChannelKind::Depth.stream_suffix(), "depth@100ms");
        assert_eq!(ChannelKind::MarkPrice.stream_suffix(), "markPrice@1s");
    }

    #[test]
    fn test_trade_side_conversion() {
        assert_eq!(TradeSide::from_db_char('B'), Some(TradeSide::Buy));
        assert_eq!(TradeSide::from_str("SELL"), Some(TradeSide::Sell));
        assert_eq!(TradeSide::Buy.as_db_char(), 'B');
        assert_eq!(TradeSide::from_str("HOLD"), None);
    }
}
