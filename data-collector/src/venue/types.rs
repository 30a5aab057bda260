//! Venue message types
//!
//! Types for deserializing the futures WebSocket messages. The combined
//! stream endpoint wraps every payload in `{"stream": ..., "data": ...}`;
//! the inner payload is tagged by its `e` event type field.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Combined stream wrapper. `data` is kept raw so the envelope can be
/// unpacked without parsing the payload twice.
#[derive(Debug, Deserialize)]
pub struct CombinedStreamMessage<'a> {
    /// Stream name (e.g., "btcusdt@bookTicker")
    #[allow(dead_code)]
    pub stream: &'a str,

    /// The actual event payload
    #[serde(borrow)]
    pub data: &'a RawValue,
}

/// Any event payload the subscribed channels can produce, tagged by the
/// venue's `e` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
pub enum VenueMessage {
    #[serde(rename = "bookTicker")]
    BookTicker(BookTickerMessage),
    #[serde(rename = "aggTrade")]
    AggTrade(AggTradeMessage),
    #[serde(rename = "depthUpdate")]
    DepthUpdate(DepthUpdateMessage),
    #[serde(rename = "markPriceUpdate")]
    MarkPrice(MarkPriceMessage),
    #[serde(rename = "forceOrder")]
    ForceOrder(ForceOrderMessage),
}

/// Best bid/ask update
#[derive(Debug, Deserialize, Clone)]
pub struct BookTickerMessage {
    /// Symbol
    #[serde(rename = "s")]
    pub symbol: String,

    /// Order book update ID
    #[serde(rename = "u")]
    pub update_id: i64,

    /// Best bid price
    #[serde(rename = "b")]
    pub best_bid: String,

    /// Best bid quantity
    #[serde(rename = "B")]
    pub bid_qty: String,

    /// Best ask price
    #[serde(rename = "a")]
    pub best_ask: String,

    /// Best ask quantity
    #[serde(rename = "A")]
    pub ask_qty: String,

    /// Transaction time
    #[serde(rename = "T")]
    pub transaction_time: i64,

    /// Event time
    #[serde(rename = "E")]
    pub event_time: i64,
}

/// Aggregated trade
#[derive(Debug, Deserialize, Clone)]
pub struct AggTradeMessage {
    /// Symbol
    #[serde(rename = "s")]
    pub symbol: String,

    /// Aggregate trade ID
    #[serde(rename = "a")]
    pub agg_trade_id: i64,

    /// Price
    #[serde(rename = "p")]
    pub price: String,

    /// Quantity
    #[serde(rename = "q")]
    pub quantity: String,

    /// Trade time
    #[serde(rename = "T")]
    pub trade_time: i64,

    /// Is the buyer the market maker?
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

/// Incremental depth update (100 ms cadence)
#[derive(Debug, Deserialize, Clone)]
pub struct DepthUpdateMessage {
    /// Symbol
    #[serde(rename = "s")]
    pub symbol: String,

    /// Transaction time
    #[serde(rename = "T")]
    pub transaction_time: i64,

    /// First update ID in event
    #[serde(rename = "U")]
    pub first_update_id: i64,

    /// Final update ID in event
    #[serde(rename = "u")]
    pub final_update_id: i64,

    /// Final update ID of the previous event
    #[serde(rename = "pu")]
    pub prev_final_update_id: Option<i64>,

    /// Bid changes as [price, qty] pairs
    #[serde(rename = "b")]
    pub bids: Vec<[String; 2]>,

    /// Ask changes as [price, qty] pairs
    #[serde(rename = "a")]
    pub asks: Vec<[String; 2]>,
}

/// Mark price update (1 s cadence)
#[derive(Debug, Deserialize, Clone)]
pub struct MarkPriceMessage {
    /// Symbol
    #[serde(rename = "s")]
    pub symbol: String,

    /// Event time
    #[serde(rename = "E")]
    pub event_time: i64,

    /// Mark price
    #[serde(rename = "p")]
    pub mark_price: String,

    /// Index price
    #[serde(rename = "i")]
    pub index_price: String,

    /// Funding rate (empty for non-funding instruments)
    #[serde(rename = "r")]
    pub funding_rate: Option<String>,

    /// Next funding time
    #[serde(rename = "T")]
    pub next_funding_time: Option<i64>,
}

/// Liquidation order event; the order details live in the nested `o`
/// object and the whole payload is preserved raw in storage.
#[derive(Debug, Deserialize, Clone)]
pub struct ForceOrderMessage {
    /// Event time
    #[serde(rename = "E")]
    pub event_time: i64,

    /// Order details
    #[serde(rename = "o")]
    pub order: ForceOrderDetails,
}

/// The `o` object of a forceOrder event
#[derive(Debug, Deserialize, Clone)]
pub struct ForceOrderDetails {
    /// Symbol
    #[serde(rename = "s")]
    pub symbol: String,

    /// Side ("BUY" / "SELL")
    #[serde(rename = "S")]
    pub side: String,

    /// Original quantity
    #[serde(rename = "q")]
    pub quantity: String,

    /// Price
    #[serde(rename = "p")]
    pub price: String,

    /// Order trade time
    #[serde(rename = "T")]
    pub trade_time: i64,
}

/// Subscription message format
#[derive(Debug, Serialize)]
pub struct SubscribeMessage {
    pub method: String,
    pub params: Vec<String>,
    pub id: u32,
}

impl SubscribeMessage {
    pub fn new(streams: Vec<String>) -> Self {
        Self {
            method: "SUBSCRIBE".to_string(),
            params: streams,
            id: 1,
        }
    }
}

/// REST depth snapshot used by the resync flow.
#[derive(Debug, Deserialize, Clone)]
pub struct DepthSnapshotResponse {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: i64,

    #[serde(rename = "E")]
    pub event_time: Option<i64>,

    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
}

/// Returns true for subscription acks and other non-event control frames.
pub fn is_control_message(text: &str) -> bool {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
        return value.get("result").is_some() || value.get("id").is_some();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_book_ticker_combined() {
        let json = r#"{
            "stream": "btcusdt@bookTicker",
            "data": {
                "e": "bookTicker",
                "u": 400900217,
                "E": 1568014460893,
                "T": 1568014460891,
                "s": "BTCUSDT",
                "b": "25.35190000",
                "B": "31.21000000",
                "a": "25.36520000",
                "A": "40.66000000"
            }
        }"#;

        let envelope: CombinedStreamMessage = serde_json::from_str(json).unwrap();
        let msg: VenueMessage = serde_json::from_str(envelope.data.get()).unwrap();
        match msg {
            VenueMessage::BookTicker(bt) => {
                assert_eq!(bt.symbol, "BTCUSDT");
                assert_eq!(bt.update_id, 400900217);
                assert_eq!(bt.best_bid, "25.35190000");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_agg_trade() {
        let json = r#"{
            "e": "aggTrade",
            "E": 1568014460893,
            "s": "BTCUSDT",
            "a": 5933014,
            "p": "9638.12",
            "q": "0.025",
            "f": 100,
            "l": 105,
            "T": 1568014460891,
            "m": true
        }"#;

        let msg: VenueMessage = serde_json::from_str(json).unwrap();
        match msg {
            VenueMessage::AggTrade(t) => {
                assert_eq!(t.agg_trade_id, 5933014);
                assert!(t.is_buyer_maker);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_depth_update() {
        let json = r#"{
            "e": "depthUpdate",
            "E": 1571889248277,
            "T": 1571889248276,
            "s": "BTCUSDT",
            "U": 390497796,
            "u": 390497878,
            "pu": 390497794,
            "b": [["7403.89", "0.002"], ["7403.90", "3.906"]],
            "a": [["7405.96", "3.340"]]
        }"#;

        let msg: VenueMessage = serde_json::from_str(json).unwrap();
        match msg {
            VenueMessage::DepthUpdate(d) => {
                assert_eq!(d.first_update_id, 390497796);
                assert_eq!(d.prev_final_update_id, Some(390497794));
                assert_eq!(d.bids.len(), 2);
                assert_eq!(d.bids[0][0], "7403.89");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_force_order() {
        let json = r#"{
            "e": "forceOrder",
            "E": 1568014460893,
            "o": {
                "s": "BTCUSDT",
                "S": "SELL",
                "o": "LIMIT",
                "f": "IOC",
                "q": "0.014",
                "p": "9910",
                "ap": "9547.5",
                "X": "FILLED",
                "l": "0.014",
                "z": "0.014",
                "T": 1568014460893
            }
        }"#;

        let msg: VenueMessage = serde_json::from_str(json).unwrap();
        match msg {
            VenueMessage::ForceOrder(f) => {
                assert_eq!(f.order.side, "SELL");
                assert_eq!(f.order.price, "9910");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_control_message_detection() {
        assert!(is_control_message(r#"{"result": null, "id": 1}"#));
        assert!(!is_control_message(r#"{"e": "aggTrade", "s": "BTCUSDT"}"#));
    }

    #[test]
    fn test_subscribe_message() {
        let msg = SubscribeMessage::new(vec![
            "btcusdt@bookTicker".to_string(),
            "ethusdt@aggTrade".to_string(),
        ]);

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("SUBSCRIBE"));
        assert!(json.contains("btcusdt@bookTicker"));
    }
}
