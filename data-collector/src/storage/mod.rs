//! Persistent store access
//!
//! `MarketDataRepository` is the only component that talks SQL. The batch
//! writer owns the raw tables, the aggregator owns the derived tables, and
//! the retention manager owns chunk lifecycle.

mod repository;
mod retention;
mod timescale;

pub use repository::{
    DatabaseStats, MarketDataRepository, RepositoryError, RepositoryResult, SymbolChannelStats,
    SymbolHealthRow,
};
pub use retention::{RetentionManager, TablePolicy};
pub use timescale::{CompressionStats, TimescaleOperations};
