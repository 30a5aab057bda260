//! Symbol Registry
//!
//! Provides stable, monotonically assigned symbol ids for all event tables.
//! Rows are created lazily when a symbol is first observed or configured,
//! never deleted, only deactivated.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      SymbolRegistry                        │
//! │  ┌─────────────┐     ┌──────────────┐    ┌──────────────┐  │
//! │  │  L1 Cache   │───> │  symbols     │───>│  BIGSERIAL   │  │
//! │  │  (DashMap)  │     │  (Postgres)  │    │  assignment  │  │
//! │  └─────────────┘     └──────────────┘    └──────────────┘  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! After warm-up, resolution is an O(1) cache hit; the database is only
//! touched for symbols never seen before. On store unavailability the
//! resolve call fails fast and upstream buffering absorbs the pause.

use dashmap::DashMap;
use market_common::error::{ErrorCategory, ErrorClassification};
use sqlx::{PgPool, Row};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Error type for symbol registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ErrorClassification for RegistryError {
    fn category(&self) -> ErrorCategory {
        match self {
            RegistryError::Database(_) => ErrorCategory::Transient,
            RegistryError::InvalidInput(_) => ErrorCategory::Permanent,
        }
    }
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// A registered symbol.
#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub id: i64,
    pub venue: String,
    pub symbol: String,
    pub is_active: bool,
}

/// Registry statistics.
#[derive(Debug, Default)]
pub struct RegistryStats {
    /// L1 cache hits
    pub cache_hits: AtomicU64,
    /// Database hits
    pub db_hits: AtomicU64,
    /// New symbol rows created
    pub creations: AtomicU64,
}

impl RegistryStats {
    /// Get cache hit ratio.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let db_hits = self.db_hits.load(Ordering::Relaxed);
        let creations = self.creations.load(Ordering::Relaxed);
        let total = hits + db_hits + creations;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Symbol registry backed by the `symbols` table with an in-memory cache.
pub struct SymbolRegistry {
    /// Database connection pool
    pool: PgPool,

    /// Venue identifier stored with every row
    venue: String,

    /// L1 cache: "venue@symbol" -> id
    cache: DashMap<String, i64>,

    /// Reverse lookup: id -> symbol code
    id_to_symbol: DashMap<i64, String>,

    /// Statistics
    stats: Arc<RegistryStats>,
}

impl SymbolRegistry {
    /// Create a new registry and warm the cache from the database.
    pub async fn new(pool: PgPool, venue: impl Into<String>) -> RegistryResult<Self> {
        let registry = Self::new_empty(pool, venue);
        registry.load_from_db().await?;
        Ok(registry)
    }

    /// Create a registry without pre-loading (for testing).
    pub fn new_empty(pool: PgPool, venue: impl Into<String>) -> Self {
        Self {
            pool,
            venue: venue.into(),
            cache: DashMap::new(),
            id_to_symbol: DashMap::new(),
            stats: Arc::new(RegistryStats::default()),
        }
    }

    /// Get registry statistics.
    pub fn stats(&self) -> &Arc<RegistryStats> {
        &self.stats
    }

    /// Get number of cached symbols.
    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    /// Venue this registry serves.
    pub fn venue(&self) -> &str {
        &self.venue
    }

    /// Load existing mappings from database into cache.
    async fn load_from_db(&self) -> RegistryResult<()> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, symbol FROM symbols WHERE venue = $1")
                .bind(&self.venue)
                .fetch_all(&self.pool)
                .await?;

        let count = rows.len();
        for (id, symbol) in rows {
            self.cache.insert(self.cache_key(&symbol), id);
            self.id_to_symbol.insert(id, symbol);
        }

        if count > 0 {
            info!("Loaded {} symbols from database", count);
        }

        Ok(())
    }

    /// Resolve a symbol code to its stable id, creating the row lazily.
    ///
    /// 1. Checks the in-memory cache first
    /// 2. Upserts into `symbols`, which either returns the existing id or
    ///    assigns the next one
    pub async fn resolve(&self, symbol: &str) -> RegistryResult<i64> {
        if symbol.is_empty() {
            return Err(RegistryError::InvalidInput("empty symbol".to_string()));
        }
        let symbol = symbol.to_uppercase();
        let key = self.cache_key(&symbol);

        if let Some(id) = self.cache.get(&key) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(*id);
        }

        // The DO UPDATE arm makes RETURNING yield the id for pre-existing
        // rows as well, so one round trip covers both cases.
        let (base, quote) = split_assets(&symbol);
        let row = sqlx::query(
            r#"
            INSERT INTO symbols (venue, symbol, instrument_class, base_asset, quote_asset)
            VALUES ($1, $2, 'perpetual', $3, $4)
            ON CONFLICT (venue, symbol) DO UPDATE SET updated_at = NOW()
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(&self.venue)
        .bind(&symbol)
        .bind(base)
        .bind(quote)
        .fetch_one(&self.pool)
        .await?;

        let id: i64 = row.get("id");
        let inserted: bool = row.get("inserted");
        if inserted {
            self.stats.creations.fetch_add(1, Ordering::Relaxed);
            debug!("Registered new symbol {} -> id {}", symbol, id);
        } else {
            self.stats.db_hits.fetch_add(1, Ordering::Relaxed);
        }

        self.cache.insert(key, id);
        self.id_to_symbol.insert(id, symbol);
        Ok(id)
    }

    /// Resolve from the cache only; None when the symbol has never been
    /// seen. Used on hot paths that must not block on the store.
    pub fn resolve_cached(&self, symbol: &str) -> Option<i64> {
        let key = self.cache_key(&symbol.to_uppercase());
        let id = self.cache.get(&key).map(|v| *v);
        if id.is_some() {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        id
    }

    /// Reverse lookup of a cached id.
    pub fn symbol_for_id(&self, id: i64) -> Option<String> {
        self.id_to_symbol.get(&id).map(|v| v.clone())
    }

    /// List all active symbols for this venue.
    pub async fn list_active(&self) -> RegistryResult<Vec<SymbolInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT id, venue, symbol, is_active
            FROM symbols
            WHERE venue = $1 AND is_active
            ORDER BY id
            "#,
        )
        .bind(&self.venue)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| SymbolInfo {
                id: row.get("id"),
                venue: row.get("venue"),
                symbol: row.get("symbol"),
                is_active: row.get("is_active"),
            })
            .collect())
    }

    /// Deactivate a symbol. The row and its id are preserved.
    pub async fn deactivate(&self, id: i64) -> RegistryResult<()> {
        sqlx::query("UPDATE symbols SET is_active = FALSE, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn cache_key(&self, symbol: &str) -> String {
        format!("{}@{}", self.venue, symbol)
    }

    /// Seed the cache directly so unit tests never touch the database.
    #[cfg(test)]
    pub fn cache_insert_for_tests(&self, symbol: &str, id: i64) {
        let symbol = symbol.to_uppercase();
        self.cache.insert(self.cache_key(&symbol), id);
        self.id_to_symbol.insert(id, symbol);
    }
}

/// Best-effort split of a futures symbol code into base and quote assets.
fn split_assets(symbol: &str) -> (String, String) {
    for quote in ["USDT", "USDC", "BUSD", "USD"] {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return (base.to_string(), quote.to_string());
            }
        }
    }
    (symbol.to_string(), String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_assets() {
        assert_eq!(
            split_assets("BTCUSDT"),
            ("BTC".to_string(), "USDT".to_string())
        );
        assert_eq!(
            split_assets("ETHUSDC"),
            ("ETH".to_string(), "USDC".to_string())
        );
        // No recognized quote suffix: whole code is the base
        assert_eq!(split_assets("BTCDOM"), ("BTCDOM".to_string(), String::new()));
        // Degenerate code equal to a quote asset is not split to empty base
        assert_eq!(split_assets("USDT"), ("USDT".to_string(), String::new()));
    }

    #[test]
    fn test_stats_hit_ratio() {
        let stats = RegistryStats::default();
        assert_eq!(stats.hit_ratio(), 0.0);
        stats.cache_hits.store(3, Ordering::Relaxed);
        stats.db_hits.store(1, Ordering::Relaxed);
        assert_eq!(stats.hit_ratio(), 0.75);
    }
}
