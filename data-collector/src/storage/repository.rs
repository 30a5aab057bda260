//! Market data repository
//!
//! High-level data access for the raw event tables, the per-second
//! aggregates, and the monitoring queries behind the control plane.
//!
//! All raw inserts are idempotent multi-row upserts with
//! `ON CONFLICT DO NOTHING` on the table's uniqueness key, so at-least-once
//! delivery from the ingestion pipeline never produces duplicates.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use market_common::error::{ErrorCategory, ErrorClassification};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::DatabaseSettings;
use crate::schema::{
    BookTickerRecord, BtSecondRow, DepthRecord, ForceOrderRecord, MarkPriceRecord, TradeRecord,
    TradeSecondRow,
};

/// Repository errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl ErrorClassification for RepositoryError {
    fn category(&self) -> ErrorCategory {
        match self {
            RepositoryError::Database(e) => classify_sqlx(e),
            RepositoryError::Configuration(_) => ErrorCategory::Configuration,
            RepositoryError::NotFound(_) => ErrorCategory::Permanent,
            RepositoryError::InvalidData(_) => ErrorCategory::Permanent,
        }
    }

    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self.category() {
            ErrorCategory::Transient => Some(Duration::from_millis(500)),
            _ => None,
        }
    }
}

/// Constraint violations will not resolve on retry; connectivity, timeouts
/// and pool exhaustion will.
fn classify_sqlx(e: &sqlx::Error) -> ErrorCategory {
    match e {
        sqlx::Error::Database(db) => {
            // SQLSTATE class 23 = integrity constraint violation
            match db.code() {
                Some(code) if code.starts_with("23") => ErrorCategory::Permanent,
                // 40P01 deadlock, 40001 serialization failure
                Some(code) if code.starts_with("40") => ErrorCategory::Transient,
                _ => ErrorCategory::Transient,
            }
        }
        sqlx::Error::PoolTimedOut => ErrorCategory::ResourceExhausted,
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed => ErrorCategory::Transient,
        sqlx::Error::RowNotFound => ErrorCategory::Permanent,
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => ErrorCategory::Permanent,
        _ => ErrorCategory::Transient,
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Market data repository
pub struct MarketDataRepository {
    pool: PgPool,
    batch_size: usize,
}

impl MarketDataRepository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: PgPool, batch_size: usize) -> Self {
        Self { pool, batch_size }
    }

    /// Create a new repository from settings, connecting eagerly.
    pub async fn from_settings(settings: &DatabaseSettings) -> RepositoryResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
            .connect(&settings.url)
            .await?;

        Ok(Self::new(pool, 1000))
    }

    /// Create a repository whose pool connects on first use. Start-up code
    /// prefers `from_settings`; this exists for tooling and tests.
    pub fn from_settings_lazy(settings: &DatabaseSettings) -> RepositoryResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
            .connect_lazy(&settings.url)
            .map_err(|e| RepositoryError::Configuration(e.to_string()))?;

        Ok(Self::new(pool, 1000))
    }

    /// Get the database pool reference
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // =========================================================================
    // Raw table writes (batch writer only)
    // =========================================================================

    /// Batch insert book ticker rows. Returns rows actually inserted;
    /// duplicates are silently skipped by the uniqueness key.
    pub async fn insert_book_ticker_batch(
        &self,
        rows: &[BookTickerRecord],
    ) -> RepositoryResult<u64> {
        let mut inserted = 0;
        for chunk in rows.chunks(self.batch_size) {
            let mut query = String::from(
                r#"
                INSERT INTO book_ticker (
                    symbol_id, ts_exchange, ts_ingest, update_id,
                    best_bid, best_ask, bid_qty, ask_qty, spread, mid
                ) VALUES
                "#,
            );
            push_placeholders(&mut query, chunk.len(), 10);
            query.push_str(" ON CONFLICT (symbol_id, ts_exchange, update_id) DO NOTHING");

            let mut q = sqlx::query(&query);
            for r in chunk {
                q = q
                    .bind(r.symbol_id)
                    .bind(r.ts_exchange)
                    .bind(r.ts_ingest)
                    .bind(r.update_id)
                    .bind(r.best_bid)
                    .bind(r.best_ask)
                    .bind(r.bid_qty)
                    .bind(r.ask_qty)
                    .bind(r.spread)
                    .bind(r.mid);
            }
            inserted += q.execute(&self.pool).await?.rows_affected();
        }
        debug!("Inserted {} book ticker rows", inserted);
        Ok(inserted)
    }

    /// Batch insert trade rows.
    pub async fn insert_trades_batch(&self, rows: &[TradeRecord]) -> RepositoryResult<u64> {
        let mut inserted = 0;
        for chunk in rows.chunks(self.batch_size) {
            let mut query = String::from(
                r#"
                INSERT INTO trades (
                    symbol_id, ts_exchange, ts_ingest, agg_trade_id,
                    price, qty, is_buyer_maker
                ) VALUES
                "#,
            );
            push_placeholders(&mut query, chunk.len(), 7);
            query.push_str(" ON CONFLICT (symbol_id, ts_exchange, agg_trade_id) DO NOTHING");

            let mut q = sqlx::query(&query);
            for r in chunk {
                q = q
                    .bind(r.symbol_id)
                    .bind(r.ts_exchange)
                    .bind(r.ts_ingest)
                    .bind(r.agg_trade_id)
                    .bind(r.price)
                    .bind(r.qty)
                    .bind(r.is_buyer_maker);
            }
            inserted += q.execute(&self.pool).await?.rows_affected();
        }
        debug!("Inserted {} trade rows", inserted);
        Ok(inserted)
    }

    /// Batch insert depth delta rows. Bid/ask change arrays are stored
    /// verbatim as JSONB.
    pub async fn insert_depth_batch(&self, rows: &[DepthRecord]) -> RepositoryResult<u64> {
        let mut inserted = 0;
        for chunk in rows.chunks(self.batch_size) {
            let mut query = String::from(
                r#"
                INSERT INTO depth_events (
                    symbol_id, ts_exchange, ts_ingest, first_update_id,
                    final_update_id, prev_final_update_id, bids, asks
                ) VALUES
                "#,
            );
            push_placeholders(&mut query, chunk.len(), 8);
            query.push_str(" ON CONFLICT (symbol_id, ts_exchange, final_update_id) DO NOTHING");

            let mut q = sqlx::query(&query);
            for r in chunk {
                q = q
                    .bind(r.symbol_id)
                    .bind(r.ts_exchange)
                    .bind(r.ts_ingest)
                    .bind(r.first_update_id)
                    .bind(r.final_update_id)
                    .bind(r.prev_final_update_id)
                    .bind(serde_json::to_value(&r.bids).unwrap_or_default())
                    .bind(serde_json::to_value(&r.asks).unwrap_or_default());
            }
            inserted += q.execute(&self.pool).await?.rows_affected();
        }
        debug!("Inserted {} depth rows", inserted);
        Ok(inserted)
    }

    /// Batch insert mark price rows.
    pub async fn insert_mark_price_batch(
        &self,
        rows: &[MarkPriceRecord],
    ) -> RepositoryResult<u64> {
        let mut inserted = 0;
        for chunk in rows.chunks(self.batch_size) {
            let mut query = String::from(
                r#"
                INSERT INTO mark_price (
                    symbol_id, ts_exchange, ts_ingest, mark_price,
                    index_price, funding_rate, next_funding_time
                ) VALUES
                "#,
            );
            push_placeholders(&mut query, chunk.len(), 7);
            query.push_str(" ON CONFLICT (symbol_id, ts_exchange) DO NOTHING");

            let mut q = sqlx::query(&query);
            for r in chunk {
                q = q
                    .bind(r.symbol_id)
                    .bind(r.ts_exchange)
                    .bind(r.ts_ingest)
                    .bind(r.mark_price)
                    .bind(r.index_price)
                    .bind(r.funding_rate)
                    .bind(r.next_funding_time);
            }
            inserted += q.execute(&self.pool).await?.rows_affected();
        }
        Ok(inserted)
    }

    /// Batch insert liquidation rows.
    pub async fn insert_force_orders_batch(
        &self,
        rows: &[ForceOrderRecord],
    ) -> RepositoryResult<u64> {
        let mut inserted = 0;
        for chunk in rows.chunks(self.batch_size) {
            let mut query = String::from(
                r#"
                INSERT INTO force_orders (
                    symbol_id, ts_exchange, ts_ingest, side, price, qty, raw
                ) VALUES
                "#,
            );
            push_placeholders(&mut query, chunk.len(), 7);
            query.push_str(" ON CONFLICT (symbol_id, ts_exchange, side, price, qty) DO NOTHING");

            let mut q = sqlx::query(&query);
            for r in chunk {
                q = q
                    .bind(r.symbol_id)
                    .bind(r.ts_exchange)
                    .bind(r.ts_ingest)
                    .bind(r.side.as_db_char().to_string())
                    .bind(r.price)
                    .bind(r.qty)
                    .bind(&r.raw);
            }
            inserted += q.execute(&self.pool).await?.rows_affected();
        }
        Ok(inserted)
    }

    // =========================================================================
    // Aggregate writes (aggregator only)
    // =========================================================================

    /// Upsert one closed book-ticker second.
    pub async fn upsert_bt_second(&self, row: &BtSecondRow) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bt_1s (
                symbol_id, ts_second, mid_open, mid_high, mid_low, mid_close,
                spread_mean, spread_max, bid_qty_mean, ask_qty_mean, vw_mid, update_count
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (symbol_id, ts_second) DO UPDATE SET
                mid_open = EXCLUDED.mid_open,
                mid_high = EXCLUDED.mid_high,
                mid_low = EXCLUDED.mid_low,
                mid_close = EXCLUDED.mid_close,
                spread_mean = EXCLUDED.spread_mean,
                spread_max = EXCLUDED.spread_max,
                bid_qty_mean = EXCLUDED.bid_qty_mean,
                ask_qty_mean = EXCLUDED.ask_qty_mean,
                vw_mid = EXCLUDED.vw_mid,
                update_count = EXCLUDED.update_count
            "#,
        )
        .bind(row.symbol_id)
        .bind(row.ts_second)
        .bind(row.mid_open)
        .bind(row.mid_high)
        .bind(row.mid_low)
        .bind(row.mid_close)
        .bind(row.spread_mean)
        .bind(row.spread_max)
        .bind(row.bid_qty_mean)
        .bind(row.ask_qty_mean)
        .bind(row.vw_mid)
        .bind(row.update_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert one closed trade second.
    pub async fn upsert_trade_second(&self, row: &TradeSecondRow) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_1s (
                symbol_id, ts_second, trade_count, volume_sum, value_sum, vwap,
                buy_volume, sell_volume, buy_count, sell_count,
                price_min, price_max, imbalance_ratio
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (symbol_id, ts_second) DO UPDATE SET
                trade_count = EXCLUDED.trade_count,
                volume_sum = EXCLUDED.volume_sum,
                value_sum = EXCLUDED.value_sum,
                vwap = EXCLUDED.vwap,
                buy_volume = EXCLUDED.buy_volume,
                sell_volume = EXCLUDED.sell_volume,
                buy_count = EXCLUDED.buy_count,
                sell_count = EXCLUDED.sell_count,
                price_min = EXCLUDED.price_min,
                price_max = EXCLUDED.price_max,
                imbalance_ratio = EXCLUDED.imbalance_ratio
            "#,
        )
        .bind(row.symbol_id)
        .bind(row.ts_second)
        .bind(row.trade_count)
        .bind(row.volume_sum)
        .bind(row.value_sum)
        .bind(row.vwap)
        .bind(row.buy_volume)
        .bind(row.sell_volume)
        .bind(row.buy_count)
        .bind(row.sell_count)
        .bind(row.price_min)
        .bind(row.price_max)
        .bind(row.imbalance_ratio)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recompute one bt_1s row from the raw book_ticker table. Used for
    /// late arrivals after the in-memory accumulator closed the second;
    /// replaying the same second always converges to the same row.
    pub async fn recompute_bt_second(
        &self,
        symbol_id: i64,
        ts_second: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bt_1s (
                symbol_id, ts_second, mid_open, mid_high, mid_low, mid_close,
                spread_mean, spread_max, bid_qty_mean, ask_qty_mean, vw_mid, update_count
            )
            SELECT
                symbol_id,
                $2,
                (array_agg(mid ORDER BY ts_exchange ASC, update_id DESC))[1],
                MAX(mid),
                MIN(mid),
                (array_agg(mid ORDER BY ts_exchange DESC, update_id DESC))[1],
                AVG(spread),
                MAX(spread),
                AVG(bid_qty),
                AVG(ask_qty),
                CASE WHEN SUM(bid_qty + ask_qty) > 0
                     THEN SUM(mid * (bid_qty + ask_qty)) / SUM(bid_qty + ask_qty)
                END,
                COUNT(*)
            FROM book_ticker
            WHERE symbol_id = $1
              AND ts_exchange >= $2
              AND ts_exchange < $2 + INTERVAL '1 second'
            GROUP BY symbol_id
            ON CONFLICT (symbol_id, ts_second) DO UPDATE SET
                mid_open = EXCLUDED.mid_open,
                mid_high = EXCLUDED.mid_high,
                mid_low = EXCLUDED.mid_low,
                mid_close = EXCLUDED.mid_close,
                spread_mean = EXCLUDED.spread_mean,
                spread_max = EXCLUDED.spread_max,
                bid_qty_mean = EXCLUDED.bid_qty_mean,
                ask_qty_mean = EXCLUDED.ask_qty_mean,
                vw_mid = EXCLUDED.vw_mid,
                update_count = EXCLUDED.update_count
            "#,
        )
        .bind(symbol_id)
        .bind(ts_second)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recompute one trade_1s row from the raw trades table.
    pub async fn recompute_trade_second(
        &self,
        symbol_id: i64,
        ts_second: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_1s (
                symbol_id, ts_second, trade_count, volume_sum, value_sum, vwap,
                buy_volume, sell_volume, buy_count, sell_count,
                price_min, price_max, imbalance_ratio
            )
            SELECT
                symbol_id,
                $2,
                COUNT(*),
                SUM(qty),
                SUM(price * qty),
                CASE WHEN SUM(qty) > 0 THEN SUM(price * qty) / SUM(qty) END,
                SUM(qty) FILTER (WHERE NOT is_buyer_maker),
                SUM(qty) FILTER (WHERE is_buyer_maker),
                COUNT(*) FILTER (WHERE NOT is_buyer_maker),
                COUNT(*) FILTER (WHERE is_buyer_maker),
                MIN(price),
                MAX(price),
                CASE WHEN SUM(qty) > 0
                     THEN COALESCE(SUM(qty) FILTER (WHERE NOT is_buyer_maker), 0) / SUM(qty)
                END
            FROM trades
            WHERE symbol_id = $1
              AND ts_exchange >= $2
              AND ts_exchange < $2 + INTERVAL '1 second'
            GROUP BY symbol_id
            ON CONFLICT (symbol_id, ts_second) DO UPDATE SET
                trade_count = EXCLUDED.trade_count,
                volume_sum = EXCLUDED.volume_sum,
                value_sum = EXCLUDED.value_sum,
                vwap = EXCLUDED.vwap,
                buy_volume = EXCLUDED.buy_volume,
                sell_volume = EXCLUDED.sell_volume,
                buy_count = EXCLUDED.buy_count,
                sell_count = EXCLUDED.sell_count,
                price_min = EXCLUDED.price_min,
                price_max = EXCLUDED.price_max,
                imbalance_ratio = EXCLUDED.imbalance_ratio
            "#,
        )
        .bind(symbol_id)
        .bind(ts_second)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Flat grid (grid refresher only)
    // =========================================================================

    /// Refresh the gap-filled 24h grid for [start, end).
    ///
    /// Pass 1 upserts rows for every second covered by bt_1s with LOCF
    /// mid/spread and trade counters joined in; pass 2 zero-fills the
    /// seconds no bt_1s group produced (symbols quiet for the whole
    /// window); pass 3 trims rows that slid out of the window.
    pub async fn refresh_grid(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RepositoryResult<(u64, u64, u64)> {
        let filled = sqlx::query(
            r#"
            INSERT INTO core_1s_24h (
                symbol_id, ts_second, mid_ffill, spread_ffill,
                trade_count, volume_sum, vwap, update_count
            )
            SELECT
                sub.symbol_id,
                sub.ts_second,
                sub.mid_ffill,
                sub.spread_ffill,
                COALESCE(sub.trade_count, 0),
                COALESCE(sub.volume_sum, 0),
                sub.vwap,
                COALESCE(sub.update_count, 0)
            FROM (
                SELECT
                    src.symbol_id,
                    time_bucket_gapfill('1 second', src.ts_second, $1, $2) AS ts_second,
                    locf(last(src.mid_close, src.ts_second)) AS mid_ffill,
                    locf(last(src.spread_mean, src.ts_second)) AS spread_ffill,
                    SUM(src.trade_count) AS trade_count,
                    SUM(src.volume_sum) AS volume_sum,
                    CASE WHEN SUM(src.volume_sum) > 0
                         THEN SUM(src.value_sum) / SUM(src.volume_sum)
                    END AS vwap,
                    SUM(src.update_count) AS update_count
                FROM (
                    -- FULL JOIN keeps seconds that saw trades but no book
                    -- update; both tables are 1-row-per-second so the join
                    -- never multiplies.
                    SELECT symbol_id, ts_second,
                           b.mid_close, b.spread_mean, b.update_count,
                           t.trade_count, t.volume_sum, t.value_sum
                    FROM bt_1s b
                    FULL JOIN trade_1s t USING (symbol_id, ts_second)
                    WHERE ts_second >= $1 AND ts_second < $2
                ) src
                GROUP BY src.symbol_id, 2
            ) sub
            WHERE sub.ts_second IS NOT NULL
            ON CONFLICT (symbol_id, ts_second) DO UPDATE SET
                mid_ffill = EXCLUDED.mid_ffill,
                spread_ffill = EXCLUDED.spread_ffill,
                trade_count = EXCLUDED.trade_count,
                volume_sum = EXCLUDED.volume_sum,
                vwap = EXCLUDED.vwap,
                update_count = EXCLUDED.update_count
            "#,
        )
        .bind(start)
        .bind(end)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let zero_filled = sqlx::query(
            r#"
            INSERT INTO core_1s_24h (
                symbol_id, ts_second, mid_ffill, spread_ffill,
                trade_count, volume_sum, vwap, update_count
            )
            SELECT s.id, g.ts_second, NULL, NULL, 0, 0, NULL, 0
            FROM symbols s
            CROSS JOIN generate_series($1, $2 - INTERVAL '1 second', INTERVAL '1 second')
                AS g(ts_second)
            WHERE s.is_active
            ON CONFLICT (symbol_id, ts_second) DO NOTHING
            "#,
        )
        .bind(start)
        .bind(end)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let trimmed = sqlx::query("DELETE FROM core_1s_24h WHERE ts_second < $1")
            .bind(start)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok((filled, zero_filled, trimmed))
    }

    /// Grid coverage for [start, end): fraction of expected rows present.
    pub async fn grid_coverage(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RepositoryResult<f64> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM core_1s_24h
                  WHERE ts_second >= $1 AND ts_second < $2) AS actual,
                (SELECT COUNT(*) FROM symbols WHERE is_active) AS symbols
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        let actual: i64 = row.get("actual");
        let symbols: i64 = row.get("symbols");
        let expected = symbols * (end - start).num_seconds();
        if expected == 0 {
            return Ok(1.0);
        }
        Ok(actual as f64 / expected as f64)
    }

    // =========================================================================
    // Monitoring queries (control plane and validator)
    // =========================================================================

    /// Per-symbol event counts and last-seen timestamps over the last hour
    /// and minute, per raw table.
    pub async fn database_stats(&self) -> RepositoryResult<DatabaseStats> {
        let rows = sqlx::query(
            r#"
            SELECT s.symbol, t.table_name, t.cnt_hour, t.cnt_minute, t.last_ts
            FROM (
                SELECT symbol_id, 'book_ticker' AS table_name,
                       COUNT(*) AS cnt_hour,
                       COUNT(*) FILTER (WHERE ts_exchange > NOW() - INTERVAL '1 minute') AS cnt_minute,
                       MAX(ts_exchange) AS last_ts
                FROM book_ticker
                WHERE ts_exchange > NOW() - INTERVAL '1 hour'
                GROUP BY symbol_id
                UNION ALL
                SELECT symbol_id, 'trades',
                       COUNT(*),
                       COUNT(*) FILTER (WHERE ts_exchange > NOW() - INTERVAL '1 minute'),
                       MAX(ts_exchange)
                FROM trades
                WHERE ts_exchange > NOW() - INTERVAL '1 hour'
                GROUP BY symbol_id
                UNION ALL
                SELECT symbol_id, 'depth_events',
                       COUNT(*),
                       COUNT(*) FILTER (WHERE ts_exchange > NOW() - INTERVAL '1 minute'),
                       MAX(ts_exchange)
                FROM depth_events
                WHERE ts_exchange > NOW() - INTERVAL '1 hour'
                GROUP BY symbol_id
            ) t
            JOIN symbols s ON s.id = t.symbol_id
            ORDER BY s.symbol, t.table_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut per_symbol: BTreeMap<String, Vec<SymbolChannelStats>> = BTreeMap::new();
        for row in &rows {
            let symbol: String = row.get("symbol");
            per_symbol
                .entry(symbol)
                .or_default()
                .push(SymbolChannelStats {
                    table: row.get("table_name"),
                    count_last_hour: row.get::<i64, _>("cnt_hour") as u64,
                    count_last_minute: row.get::<i64, _>("cnt_minute") as u64,
                    last_seen: row.get("last_ts"),
                });
        }

        Ok(DatabaseStats {
            generated_at: Utc::now(),
            per_symbol,
        })
    }

    /// Fetch the per-symbol inputs for the validator: last event time,
    /// event counts in the frequency window, and quality violations in the
    /// quality window.
    pub async fn fetch_symbol_health(
        &self,
        frequency_window: ChronoDuration,
        quality_window: ChronoDuration,
    ) -> RepositoryResult<Vec<SymbolHealthRow>> {
        let rows = sqlx::query(
            r#"
            SELECT
                s.id AS symbol_id,
                s.symbol,
                bt.last_ts AS bt_last,
                tr.last_ts AS tr_last,
                COALESCE(bt.cnt_freq, 0) + COALESCE(tr.cnt_freq, 0) AS events_in_window,
                COALESCE(bt.inverted, 0) AS inverted_books,
                COALESCE(bt.nonpositive, 0) + COALESCE(tr.nonpositive, 0) AS nonpositive_rows,
                COALESCE(bt.null_rows, 0) AS null_rows
            FROM symbols s
            LEFT JOIN (
                SELECT symbol_id,
                       MAX(ts_exchange) AS last_ts,
                       COUNT(*) FILTER (WHERE ts_exchange > $1) AS cnt_freq,
                       COUNT(*) FILTER (WHERE best_ask < best_bid) AS inverted,
                       COUNT(*) FILTER (WHERE best_bid <= 0 OR best_ask <= 0) AS nonpositive,
                       COUNT(*) FILTER (WHERE mid IS NULL OR spread IS NULL) AS null_rows
                FROM book_ticker
                WHERE ts_exchange > $2
                GROUP BY symbol_id
            ) bt ON bt.symbol_id = s.id
            LEFT JOIN (
                SELECT symbol_id,
                       MAX(ts_exchange) AS last_ts,
                       COUNT(*) FILTER (WHERE ts_exchange > $1) AS cnt_freq,
                       COUNT(*) FILTER (WHERE price <= 0 OR qty <= 0) AS nonpositive
                FROM trades
                WHERE ts_exchange > $2
                GROUP BY symbol_id
            ) tr ON tr.symbol_id = s.id
            WHERE s.is_active
            ORDER BY s.symbol
            "#,
        )
        .bind(Utc::now() - frequency_window)
        .bind(Utc::now() - quality_window)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let bt_last: Option<DateTime<Utc>> = row.get("bt_last");
                let tr_last: Option<DateTime<Utc>> = row.get("tr_last");
                SymbolHealthRow {
                    symbol_id: row.get("symbol_id"),
                    symbol: row.get("symbol"),
                    last_event: bt_last.into_iter().chain(tr_last).max(),
                    events_in_frequency_window: row.get::<i64, _>("events_in_window") as u64,
                    inverted_books: row.get::<i64, _>("inverted_books") as u64,
                    nonpositive_rows: row.get::<i64, _>("nonpositive_rows") as u64,
                    null_rows: row.get::<i64, _>("null_rows") as u64,
                }
            })
            .collect())
    }

    /// Check that the required tables exist.
    pub async fn check_structure(&self) -> RepositoryResult<Vec<String>> {
        const REQUIRED: [&str; 9] = [
            "symbols",
            "book_ticker",
            "trades",
            "depth_events",
            "mark_price",
            "force_orders",
            "bt_1s",
            "trade_1s",
            "core_1s_24h",
        ];

        let rows = sqlx::query(
            r#"
            SELECT table_name FROM information_schema.tables
            WHERE table_schema = 'public'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let present: Vec<String> = rows.iter().map(|r| r.get("table_name")).collect();
        Ok(REQUIRED
            .iter()
            .filter(|t| !present.iter().any(|p| p == *t))
            .map(|t| t.to_string())
            .collect())
    }

    /// Row counts and time bounds for the db CLI stats command.
    pub async fn table_overview(&self, table: &str) -> RepositoryResult<(u64, Option<DateTime<Utc>>, Option<DateTime<Utc>>)> {
        // Table names come from a fixed internal list, never user input.
        let query = format!(
            "SELECT COUNT(*) AS cnt, MIN(ts_exchange) AS earliest, MAX(ts_exchange) AS latest FROM {}",
            table
        );
        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        Ok((
            row.get::<i64, _>("cnt") as u64,
            row.get("earliest"),
            row.get("latest"),
        ))
    }
}

/// Append `(${n}, ${n+1}, ...)` tuples for a multi-row VALUES clause.
fn push_placeholders(query: &mut String, rows: usize, columns: usize) {
    let mut param = 1;
    for i in 0..rows {
        if i > 0 {
            query.push_str(", ");
        }
        query.push('(');
        for c in 0..columns {
            if c > 0 {
                query.push_str(", ");
            }
            query.push_str(&format!("${}", param));
            param += 1;
        }
        query.push(')');
    }
}

/// Per-symbol, per-table activity counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SymbolChannelStats {
    pub table: String,
    pub count_last_hour: u64,
    pub count_last_minute: u64,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Output of the database stats endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DatabaseStats {
    pub generated_at: DateTime<Utc>,
    pub per_symbol: BTreeMap<String, Vec<SymbolChannelStats>>,
}

/// Raw inputs for the validator, fetched in one pass.
#[derive(Debug, Clone)]
pub struct SymbolHealthRow {
    pub symbol_id: i64,
    pub symbol: String,
    pub last_event: Option<DateTime<Utc>>,
    pub events_in_frequency_window: u64,
    pub inverted_books: u64,
    pub nonpositive_rows: u64,
    pub null_rows: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_placeholders() {
        let mut q = String::new();
        push_placeholders(&mut q, 2, 3);
        assert_eq!(q, "($1, $2, $3), ($4, $5, $6)");
    }

    #[test]
    fn test_push_placeholders_single_row() {
        let mut q = String::new();
        push_placeholders(&mut q, 1, 2);
        assert_eq!(q, "($1, $2)");
    }
}
