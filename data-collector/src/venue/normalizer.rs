//! Event normalizer
//!
//! Stateless transformation from wire shapes to internal records. Resolves
//! symbol ids through the registry, stamps `ts_ingest` on entry, derives
//! spread and mid, and rejects events that fail the data model invariants.
//! Rejections are counted and surfaced through rate-limited warnings; an
//! invalid event is never forwarded.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::types::{
    is_control_message, AggTradeMessage, BookTickerMessage, CombinedStreamMessage,
    DepthUpdateMessage, ForceOrderMessage, MarkPriceMessage, VenueMessage,
};
use super::{VenueError, VenueResult};
use crate::schema::{
    BookTickerRecord, ChannelKind, DepthRecord, ForceOrderRecord, MarkPriceRecord, MarketEvent,
    TradeRecord, TradeSide,
};
use crate::symbol::SymbolRegistry;

/// Minimum gap between rejection warnings per normalizer.
const WARN_INTERVAL: Duration = Duration::from_secs(5);

/// Stateless wire-to-record normalizer.
pub struct EventNormalizer {
    registry: Arc<SymbolRegistry>,
    rejected: AtomicU64,
    last_warn: Mutex<Instant>,
}

impl EventNormalizer {
    pub fn new(registry: Arc<SymbolRegistry>) -> Self {
        Self {
            registry,
            rejected: AtomicU64::new(0),
            last_warn: Mutex::new(Instant::now() - WARN_INTERVAL),
        }
    }

    /// Total events rejected for invariant violations.
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// The registry this normalizer resolves symbols through.
    pub fn registry(&self) -> &Arc<SymbolRegistry> {
        &self.registry
    }

    /// Resolve a symbol id, keeping the store-down case transient so the
    /// pipeline can pause and retry instead of dropping the event.
    async fn resolve(&self, symbol: &str) -> VenueResult<i64> {
        self.registry.resolve(symbol).await.map_err(|e| match e {
            crate::symbol::RegistryError::Database(_) => {
                VenueError::Connection(format!("symbol resolution for {} failed: {}", symbol, e))
            }
            other => VenueError::UnknownSymbol(format!("{}: {}", symbol, other)),
        })
    }

    /// Normalize one text frame.
    ///
    /// Returns `Ok(None)` for control messages (subscription acks) and for
    /// events rejected by invariant checks; those are counted, not errors.
    pub async fn normalize_frame(&self, text: &str) -> VenueResult<Option<MarketEvent>> {
        // Combined stream endpoint wraps payloads in {"stream", "data"}.
        let payload = match serde_json::from_str::<CombinedStreamMessage>(text) {
            Ok(envelope) => envelope.data.get(),
            Err(_) => text,
        };

        let msg = match serde_json::from_str::<VenueMessage>(payload) {
            Ok(msg) => msg,
            Err(e) => {
                if is_control_message(text) {
                    debug!("Ignoring control message");
                    return Ok(None);
                }
                return Err(VenueError::Parse(format!("unrecognized frame: {}", e)));
            }
        };

        let ts_ingest = Utc::now();
        match msg {
            VenueMessage::BookTicker(m) => self.normalize_book_ticker(m, ts_ingest).await,
            VenueMessage::AggTrade(m) => self.normalize_agg_trade(m, ts_ingest).await,
            VenueMessage::DepthUpdate(m) => self.normalize_depth(m, ts_ingest).await,
            VenueMessage::MarkPrice(m) => self.normalize_mark_price(m, ts_ingest).await,
            VenueMessage::ForceOrder(m) => self.normalize_force_order(m, payload, ts_ingest).await,
        }
    }

    async fn normalize_book_ticker(
        &self,
        m: BookTickerMessage,
        ts_ingest: DateTime<Utc>,
    ) -> VenueResult<Option<MarketEvent>> {
        let best_bid = parse_decimal(&m.best_bid, "best_bid")?;
        let best_ask = parse_decimal(&m.best_ask, "best_ask")?;
        let bid_qty = parse_decimal(&m.bid_qty, "bid_qty")?;
        let ask_qty = parse_decimal(&m.ask_qty, "ask_qty")?;

        if best_bid <= Decimal::ZERO || best_ask <= Decimal::ZERO {
            return Ok(self.reject(ChannelKind::BookTicker, &m.symbol, "non-positive price"));
        }
        if best_ask < best_bid {
            return Ok(self.reject(ChannelKind::BookTicker, &m.symbol, "inverted book"));
        }
        if bid_qty < Decimal::ZERO || ask_qty < Decimal::ZERO {
            return Ok(self.reject(ChannelKind::BookTicker, &m.symbol, "negative quantity"));
        }

        let symbol_id = self.resolve(&m.symbol).await?;

        let ts_exchange = parse_millis(m.transaction_time)?;
        let spread = best_ask - best_bid;
        let mid = (best_ask + best_bid) / Decimal::TWO;

        Ok(Some(MarketEvent::BookTicker(BookTickerRecord {
            symbol_id,
            ts_exchange,
            ts_ingest,
            update_id: m.update_id,
            best_bid,
            best_ask,
            bid_qty,
            ask_qty,
            spread,
            mid,
        })))
    }

    async fn normalize_agg_trade(
        &self,
        m: AggTradeMessage,
        ts_ingest: DateTime<Utc>,
    ) -> VenueResult<Option<MarketEvent>> {
        let price = parse_decimal(&m.price, "price")?;
        let qty = parse_decimal(&m.quantity, "quantity")?;

        if price <= Decimal::ZERO {
            return Ok(self.reject(ChannelKind::AggTrade, &m.symbol, "non-positive price"));
        }
        if qty <= Decimal::ZERO {
            return Ok(self.reject(ChannelKind::AggTrade, &m.symbol, "non-positive quantity"));
        }

        let symbol_id = self.resolve(&m.symbol).await?;

        Ok(Some(MarketEvent::Trade(TradeRecord {
            symbol_id,
            ts_exchange: parse_millis(m.trade_time)?,
            ts_ingest,
            agg_trade_id: m.agg_trade_id,
            price,
            qty,
            is_buyer_maker: m.is_buyer_maker,
        })))
    }

    async fn normalize_depth(
        &self,
        m: DepthUpdateMessage,
        ts_ingest: DateTime<Utc>,
    ) -> VenueResult<Option<MarketEvent>> {
        if m.final_update_id < m.first_update_id {
            return Ok(self.reject(ChannelKind::Depth, &m.symbol, "update id range inverted"));
        }

        let symbol_id = self.resolve(&m.symbol).await?;

        Ok(Some(MarketEvent::Depth(DepthRecord {
            symbol_id,
            ts_exchange: parse_millis(m.transaction_time)?,
            ts_ingest,
            first_update_id: m.first_update_id,
            final_update_id: m.final_update_id,
            prev_final_update_id: m.prev_final_update_id,
            bids: m.bids,
            asks: m.asks,
        })))
    }

    async fn normalize_mark_price(
        &self,
        m: MarkPriceMessage,
        ts_ingest: DateTime<Utc>,
    ) -> VenueResult<Option<MarketEvent>> {
        let mark_price = parse_decimal(&m.mark_price, "mark_price")?;
        let index_price = parse_decimal(&m.index_price, "index_price")?;
        if mark_price <= Decimal::ZERO || index_price <= Decimal::ZERO {
            return Ok(self.reject(ChannelKind::MarkPrice, &m.symbol, "non-positive price"));
        }

        let funding_rate = match m.funding_rate.as_deref() {
            None | Some("") => None,
            Some(r) => Some(parse_decimal(r, "funding_rate")?),
        };

        let symbol_id = self.resolve(&m.symbol).await?;

        Ok(Some(MarketEvent::MarkPrice(MarkPriceRecord {
            symbol_id,
            ts_exchange: parse_millis(m.event_time)?,
            ts_ingest,
            mark_price,
            index_price,
            funding_rate,
            next_funding_time: m
                .next_funding_time
                .filter(|t| *t > 0)
                .map(parse_millis)
                .transpose()?,
        })))
    }

    async fn normalize_force_order(
        &self,
        m: ForceOrderMessage,
        payload: &str,
        ts_ingest: DateTime<Utc>,
    ) -> VenueResult<Option<MarketEvent>> {
        let price = parse_decimal(&m.order.price, "price")?;
        let qty = parse_decimal(&m.order.quantity, "quantity")?;
        if price <= Decimal::ZERO || qty <= Decimal::ZERO {
            return Ok(self.reject(
                ChannelKind::ForceOrder,
                &m.order.symbol,
                "non-positive price or quantity",
            ));
        }
        let side = match TradeSide::from_str(&m.order.side) {
            Some(side) => side,
            None => {
                return Ok(self.reject(ChannelKind::ForceOrder, &m.order.symbol, "unknown side"))
            }
        };

        let symbol_id = self.resolve(&m.order.symbol).await?;

        // The wire payload is preserved verbatim for reconstruction.
        let raw: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| VenueError::Parse(format!("force order payload: {}", e)))?;

        Ok(Some(MarketEvent::ForceOrder(ForceOrderRecord {
            symbol_id,
            ts_exchange: parse_millis(m.order.trade_time)?,
            ts_ingest,
            side,
            price,
            qty,
            raw,
        })))
    }

    /// Count a rejection and warn at most once per interval.
    fn reject(&self, channel: ChannelKind, symbol: &str, reason: &str) -> Option<MarketEvent> {
        let total = self.rejected.fetch_add(1, Ordering::Relaxed) + 1;
        let mut last = self.last_warn.lock().unwrap();
        if last.elapsed() >= WARN_INTERVAL {
            *last = Instant::now();
            warn!(
                channel = channel.as_str(),
                symbol, reason, total_rejected = total, "Rejected invalid event"
            );
        }
        None
    }
}

fn parse_decimal(s: &str, field: &str) -> VenueResult<Decimal> {
    Decimal::from_str(s).map_err(|e| VenueError::Parse(format!("invalid {} '{}': {}", field, s, e)))
}

fn parse_millis(ms: i64) -> VenueResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| VenueError::Parse(format!("invalid timestamp {}", ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    fn test_normalizer() -> EventNormalizer {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgresql://localhost/test")
            .unwrap();
        let registry = Arc::new(SymbolRegistry::new_empty(pool, "binance-futures"));
        // Pre-warm the cache so tests never touch the database.
        registry.cache_insert_for_tests("BTCUSDT", 1);
        EventNormalizer::new(registry)
    }

    fn book_ticker_frame(bid: &str, ask: &str) -> String {
        format!(
            r#"{{"e":"bookTicker","u":17,"s":"BTCUSDT","b":"{}","B":"2.5","a":"{}","A":"1.0","T":1700000000123,"E":1700000000125}}"#,
            bid, ask
        )
    }

    #[tokio::test]
    async fn test_normalize_book_ticker_derives_spread_and_mid() {
        let normalizer = test_normalizer();
        let event = normalizer
            .normalize_frame(&book_ticker_frame("100.0", "101.0"))
            .await
            .unwrap()
            .unwrap();

        match event {
            MarketEvent::BookTicker(r) => {
                assert_eq!(r.symbol_id, 1);
                assert_eq!(r.spread, Decimal::from_str("1.0").unwrap());
                assert_eq!(r.mid, Decimal::from_str("100.5").unwrap());
                assert_eq!(r.update_id, 17);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inverted_book_is_rejected() {
        let normalizer = test_normalizer();
        let result = normalizer
            .normalize_frame(&book_ticker_frame("101.0", "100.0"))
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(normalizer.rejected_count(), 1);
    }

    #[tokio::test]
    async fn test_non_positive_price_is_rejected() {
        let normalizer = test_normalizer();
        let frame = r#"{"e":"aggTrade","E":1700000000125,"s":"BTCUSDT","a":42,"p":"0","q":"1.5","f":1,"l":2,"T":1700000000123,"m":false}"#;
        let result = normalizer.normalize_frame(frame).await.unwrap();
        assert!(result.is_none());
        assert_eq!(normalizer.rejected_count(), 1);
    }

    #[tokio::test]
    async fn test_control_message_is_ignored() {
        let normalizer = test_normalizer();
        let result = normalizer
            .normalize_frame(r#"{"result":null,"id":1}"#)
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(normalizer.rejected_count(), 0);
    }

    #[tokio::test]
    async fn test_combined_envelope_unwrapped() {
        let normalizer = test_normalizer();
        let frame = format!(
            r#"{{"stream":"btcusdt@bookTicker","data":{}}}"#,
            book_ticker_frame("50000.10", "50000.20")
        );
        let event = normalizer.normalize_frame(&frame).await.unwrap().unwrap();
        assert!(matches!(event, MarketEvent::BookTicker(_)));
    }

    #[tokio::test]
    async fn test_garbage_frame_is_parse_error() {
        let normalizer = test_normalizer();
        let result = normalizer.normalize_frame("not json").await;
        assert!(matches!(result, Err(VenueError::Parse(_))));
    }
}
