//! Per-second aggregation
//!
//! In-memory accumulators roll the normalized event stream up into
//! `bt_1s` / `trade_1s` rows as seconds close; the grid refresher keeps
//! the gap-filled 24h view current.

mod grid;
mod rollup;

pub use grid::GridRefresher;
pub use rollup::{BtSecondAccumulator, RollupEngine, TradeSecondAccumulator};
