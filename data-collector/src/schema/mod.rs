//! Normalized market data types
//!
//! These types represent the canonical format for all market data in the
//! system. Venue-specific wire data is normalized to these types before
//! storage or aggregation.

mod aggregates;
mod events;

pub use aggregates::{BtSecondRow, GridRow, TradeSecondRow};
pub use events::{
    BookTickerRecord, ChannelKind, DepthRecord, ForceOrderRecord, MarkPriceRecord, MarketEvent,
    TradeRecord, TradeSide,
};
