//! TimescaleDB-specific operations
//!
//! Migrations, hypertable conversion, and chunk-level compression and
//! retention. Every statement is idempotent so migrations can run on each
//! startup.

use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};

use super::{RepositoryError, RepositoryResult};

/// Raw event hypertables and their chunk interval.
const HYPERTABLES: [(&str, &str); 5] = [
    ("book_ticker", "1 day"),
    ("trades", "1 day"),
    ("depth_events", "1 day"),
    ("mark_price", "1 day"),
    ("force_orders", "1 day"),
];

/// Aggregate hypertables (longer retention, wider chunks).
const AGGREGATE_HYPERTABLES: [(&str, &str); 2] = [("bt_1s", "1 day"), ("trade_1s", "1 day")];

/// TimescaleDB operations
pub struct TimescaleOperations {
    pool: PgPool,
}

impl TimescaleOperations {
    /// Create a new TimescaleDB operations helper
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> RepositoryResult<()> {
        info!("Running TimescaleDB migrations...");

        sqlx::query("CREATE EXTENSION IF NOT EXISTS timescaledb CASCADE")
            .execute(&self.pool)
            .await?;

        self.create_symbols_table().await?;
        self.create_raw_tables().await?;
        self.create_aggregate_tables().await?;

        for (table, interval) in HYPERTABLES.iter().chain(AGGREGATE_HYPERTABLES.iter()) {
            self.ensure_hypertable(table, interval).await;
        }

        self.create_indexes().await?;

        info!("TimescaleDB migrations completed");
        Ok(())
    }

    async fn create_symbols_table(&self) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS symbols (
                id BIGSERIAL PRIMARY KEY,
                venue VARCHAR(32) NOT NULL,
                symbol VARCHAR(32) NOT NULL,
                instrument_class VARCHAR(16) NOT NULL DEFAULT 'perpetual',
                base_asset VARCHAR(16),
                quote_asset VARCHAR(16),
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                tick_size NUMERIC(20, 10),
                lot_size NUMERIC(20, 10),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (venue, symbol)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_raw_tables(&self) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS book_ticker (
                symbol_id BIGINT NOT NULL,
                ts_exchange TIMESTAMPTZ NOT NULL,
                ts_ingest TIMESTAMPTZ NOT NULL,
                update_id BIGINT NOT NULL DEFAULT 0,
                best_bid NUMERIC(20, 8) NOT NULL,
                best_ask NUMERIC(20, 8) NOT NULL,
                bid_qty NUMERIC(20, 8) NOT NULL,
                ask_qty NUMERIC(20, 8) NOT NULL,
                spread NUMERIC(20, 8) NOT NULL,
                mid NUMERIC(20, 8) NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                symbol_id BIGINT NOT NULL,
                ts_exchange TIMESTAMPTZ NOT NULL,
                ts_ingest TIMESTAMPTZ NOT NULL,
                agg_trade_id BIGINT NOT NULL,
                price NUMERIC(20, 8) NOT NULL,
                qty NUMERIC(20, 8) NOT NULL,
                is_buyer_maker BOOLEAN NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS depth_events (
                symbol_id BIGINT NOT NULL,
                ts_exchange TIMESTAMPTZ NOT NULL,
                ts_ingest TIMESTAMPTZ NOT NULL,
                first_update_id BIGINT NOT NULL,
                final_update_id BIGINT NOT NULL,
                prev_final_update_id BIGINT,
                bids JSONB NOT NULL,
                asks JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mark_price (
                symbol_id BIGINT NOT NULL,
                ts_exchange TIMESTAMPTZ NOT NULL,
                ts_ingest TIMESTAMPTZ NOT NULL,
                mark_price NUMERIC(20, 8) NOT NULL,
                index_price NUMERIC(20, 8) NOT NULL,
                funding_rate NUMERIC(20, 10),
                next_funding_time TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS force_orders (
                symbol_id BIGINT NOT NULL,
                ts_exchange TIMESTAMPTZ NOT NULL,
                ts_ingest TIMESTAMPTZ NOT NULL,
                side CHAR(1) NOT NULL,
                price NUMERIC(20, 8) NOT NULL,
                qty NUMERIC(20, 8) NOT NULL,
                raw JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_aggregate_tables(&self) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bt_1s (
                symbol_id BIGINT NOT NULL,
                ts_second TIMESTAMPTZ NOT NULL,
                mid_open NUMERIC(20, 8) NOT NULL,
                mid_high NUMERIC(20, 8) NOT NULL,
                mid_low NUMERIC(20, 8) NOT NULL,
                mid_close NUMERIC(20, 8) NOT NULL,
                spread_mean NUMERIC(20, 8) NOT NULL,
                spread_max NUMERIC(20, 8) NOT NULL,
                bid_qty_mean NUMERIC(20, 8) NOT NULL,
                ask_qty_mean NUMERIC(20, 8) NOT NULL,
                vw_mid NUMERIC(20, 8),
                update_count BIGINT NOT NULL,
                PRIMARY KEY (ts_second, symbol_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_1s (
                symbol_id BIGINT NOT NULL,
                ts_second TIMESTAMPTZ NOT NULL,
                trade_count BIGINT NOT NULL,
                volume_sum NUMERIC(24, 8) NOT NULL,
                value_sum NUMERIC(24, 8) NOT NULL,
                vwap NUMERIC(20, 8),
                buy_volume NUMERIC(24, 8) NOT NULL DEFAULT 0,
                sell_volume NUMERIC(24, 8) NOT NULL DEFAULT 0,
                buy_count BIGINT NOT NULL DEFAULT 0,
                sell_count BIGINT NOT NULL DEFAULT 0,
                price_min NUMERIC(20, 8) NOT NULL,
                price_max NUMERIC(20, 8) NOT NULL,
                imbalance_ratio NUMERIC(10, 8),
                PRIMARY KEY (ts_second, symbol_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Flat grid is bounded to the rolling window by the refresher, so
        // it stays a plain table.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS core_1s_24h (
                symbol_id BIGINT NOT NULL,
                ts_second TIMESTAMPTZ NOT NULL,
                mid_ffill NUMERIC(20, 8),
                spread_ffill NUMERIC(20, 8),
                trade_count BIGINT NOT NULL DEFAULT 0,
                volume_sum NUMERIC(24, 8) NOT NULL DEFAULT 0,
                vwap NUMERIC(20, 8),
                update_count BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (symbol_id, ts_second)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Convert a table to a hypertable; logs instead of failing when it
    /// already is one.
    async fn ensure_hypertable(&self, table: &str, chunk_interval: &str) {
        let query = format!(
            r#"
            SELECT create_hypertable(
                '{}',
                'ts_exchange',
                chunk_time_interval => INTERVAL '{}',
                if_not_exists => TRUE
            )
            "#,
            table, chunk_interval
        );

        // Aggregate tables partition on ts_second instead.
        let query = if table.ends_with("_1s") {
            query.replace("'ts_exchange'", "'ts_second'")
        } else {
            query
        };

        match sqlx::query(&query).execute(&self.pool).await {
            Ok(_) => debug!("Hypertable {} ready", table),
            Err(e) => {
                if e.to_string().contains("already a hypertable") {
                    debug!("{} is already a hypertable", table);
                } else {
                    warn!("Failed to create hypertable {}: {}", table, e);
                }
            }
        }
    }

    async fn create_indexes(&self) -> RepositoryResult<()> {
        // Uniqueness keys. Hypertable unique indexes must include the
        // partitioning column, which every key here does.
        let statements = [
            r#"CREATE UNIQUE INDEX IF NOT EXISTS uq_book_ticker
               ON book_ticker (symbol_id, ts_exchange, update_id)"#,
            r#"CREATE UNIQUE INDEX IF NOT EXISTS uq_trades
               ON trades (symbol_id, ts_exchange, agg_trade_id)"#,
            r#"CREATE UNIQUE INDEX IF NOT EXISTS uq_depth_events
               ON depth_events (symbol_id, ts_exchange, final_update_id)"#,
            r#"CREATE UNIQUE INDEX IF NOT EXISTS uq_mark_price
               ON mark_price (symbol_id, ts_exchange)"#,
            r#"CREATE UNIQUE INDEX IF NOT EXISTS uq_force_orders
               ON force_orders (symbol_id, ts_exchange, side, price, qty)"#,
            // Range scan indexes on (symbol_id, time)
            r#"CREATE INDEX IF NOT EXISTS idx_book_ticker_symbol_ts
               ON book_ticker (symbol_id, ts_exchange DESC)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_trades_symbol_ts
               ON trades (symbol_id, ts_exchange DESC)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_depth_symbol_ts
               ON depth_events (symbol_id, ts_exchange DESC)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_bt_1s_symbol_ts
               ON bt_1s (symbol_id, ts_second DESC)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_trade_1s_symbol_ts
               ON trade_1s (symbol_id, ts_second DESC)"#,
        ];

        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Enable native compression on every hypertable.
    pub async fn enable_compression(&self) -> RepositoryResult<()> {
        info!("Enabling compression on hypertables...");

        for (table, _) in HYPERTABLES.iter().chain(AGGREGATE_HYPERTABLES.iter()) {
            let order_col = if table.ends_with("_1s") {
                "ts_second"
            } else {
                "ts_exchange"
            };
            let query = format!(
                r#"
                ALTER TABLE {} SET (
                    timescaledb.compress,
                    timescaledb.compress_segmentby = 'symbol_id',
                    timescaledb.compress_orderby = '{} DESC'
                )
                "#,
                table, order_col
            );
            if let Err(e) = sqlx::query(&query).execute(&self.pool).await {
                // Already configured is fine; anything else is not.
                if !e.to_string().contains("already") {
                    return Err(RepositoryError::Database(e));
                }
            }
        }

        info!("Compression enabled");
        Ok(())
    }

    /// Manually compress chunks older than `days` for one table. Returns
    /// the number of chunks compressed.
    pub async fn compress_chunks_older_than(&self, table: &str, days: u32) -> RepositoryResult<u64> {
        let query = format!(
            r#"
            SELECT compress_chunk(c.chunk_schema || '.' || c.chunk_name)
            FROM timescaledb_information.chunks c
            WHERE c.hypertable_name = '{}'
              AND c.range_end < NOW() - INTERVAL '{} days'
              AND NOT c.is_compressed
            "#,
            table, days
        );

        let result = sqlx::query(&query).execute(&self.pool).await?;
        let count = result.rows_affected();
        if count > 0 {
            info!("Compressed {} chunks of {}", count, table);
        }
        Ok(count)
    }

    /// Drop chunks older than `days` for one table. Returns the number of
    /// chunks dropped.
    pub async fn drop_chunks_older_than(&self, table: &str, days: u32) -> RepositoryResult<u64> {
        let query = format!(
            "SELECT drop_chunks('{}', older_than => INTERVAL '{} days')",
            table, days
        );

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        let count = rows.len() as u64;
        if count > 0 {
            info!("Dropped {} chunks of {}", count, table);
        }
        Ok(count)
    }

    /// Get compression statistics across all hypertables.
    pub async fn compression_stats(&self) -> RepositoryResult<CompressionStats> {
        let row = sqlx::query(
            r#"
            SELECT
                SUM(CASE WHEN is_compressed THEN 1 ELSE 0 END)::BIGINT AS compressed_chunks,
                SUM(CASE WHEN NOT is_compressed THEN 1 ELSE 0 END)::BIGINT AS uncompressed_chunks
            FROM timescaledb_information.chunks
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(CompressionStats {
            compressed_chunks: row.get::<Option<i64>, _>("compressed_chunks").unwrap_or(0) as u64,
            uncompressed_chunks: row
                .get::<Option<i64>, _>("uncompressed_chunks")
                .unwrap_or(0) as u64,
        })
    }
}

/// Compression statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CompressionStats {
    pub compressed_chunks: u64,
    pub uncompressed_chunks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hypertable_list_covers_raw_tables() {
        let names: Vec<&str> = HYPERTABLES.iter().map(|(t, _)| *t).collect();
        assert!(names.contains(&"book_ticker"));
        assert!(names.contains(&"trades"));
        assert!(names.contains(&"depth_events"));
        assert!(names.contains(&"mark_price"));
        assert!(names.contains(&"force_orders"));
    }
}
