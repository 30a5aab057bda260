//! Application settings and configuration
//!
//! Settings are loaded from layered configuration files (`config/default`,
//! `config/{RUN_MODE}`, `config/local`), then `COLLECTOR__`-prefixed
//! environment variables, and finally the flat process-level variables
//! (`DATABASE_URL`, `VENUE_WS_BASE`, `SYMBOLS`, ...) used by deployment
//! tooling.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::schema::ChannelKind;

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Database configuration
    pub database: DatabaseSettings,
    /// Venue endpoints and connection behavior
    #[serde(default)]
    pub venue: VenueSettings,
    /// Symbol universe configuration
    #[serde(default)]
    pub symbols: SymbolSettings,
    /// Channel enable flags
    #[serde(default)]
    pub channels: ChannelSettings,
    /// Batch writer configuration
    #[serde(default)]
    pub ingest: IngestSettings,
    /// Connection sharding configuration
    #[serde(default)]
    pub shards: ShardSettings,
    /// Per-second rollup and flat grid configuration
    #[serde(default)]
    pub aggregates: AggregateSettings,
    /// Retention and compression policies
    #[serde(default)]
    pub retention: RetentionSettings,
    /// Validator thresholds
    #[serde(default)]
    pub validation: ValidationSettings,
    /// Control plane / monitoring server
    #[serde(default)]
    pub monitoring: MonitoringSettings,
}

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Acquire timeout in seconds
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    30
}

/// Venue endpoints and stream client behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueSettings {
    /// WebSocket base URL
    #[serde(default = "default_ws_base")]
    pub ws_base: String,
    /// REST base URL (depth snapshots)
    #[serde(default = "default_rest_base")]
    pub rest_base: String,
    /// Per-attempt connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Reconnect when no frame arrives for this long
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Depth snapshot level count
    #[serde(default = "default_depth_snapshot_limit")]
    pub depth_snapshot_limit: u16,
    /// Maximum reconnection attempts per rate limit window
    #[serde(default = "default_rate_limit_attempts")]
    pub rate_limit_attempts: u32,
    /// Rate limit window in seconds
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_secs: u64,
    /// Reconnection backoff settings
    #[serde(default)]
    pub reconnection: ReconnectionSettings,
}

fn default_ws_base() -> String {
    "wss://fstream.binance.com".to_string()
}

fn default_rest_base() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_depth_snapshot_limit() -> u16 {
    1000
}

fn default_rate_limit_attempts() -> u32 {
    5
}

fn default_rate_limit_window() -> u64 {
    60
}

impl Default for VenueSettings {
    fn default() -> Self {
        Self {
            ws_base: default_ws_base(),
            rest_base: default_rest_base(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            depth_snapshot_limit: default_depth_snapshot_limit(),
            rate_limit_attempts: default_rate_limit_attempts(),
            rate_limit_window_secs: default_rate_limit_window(),
            reconnection: ReconnectionSettings::default(),
        }
    }
}

/// Reconnection backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectionSettings {
    /// Initial reconnection delay in seconds
    #[serde(default = "default_initial_reconnect_delay")]
    pub initial_delay_secs: u64,
    /// Maximum reconnection delay in seconds
    #[serde(default = "default_max_reconnect_delay")]
    pub max_delay_secs: u64,
    /// Maximum reconnection attempts before the client reports Failed
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_attempts: u32,
}

fn default_initial_reconnect_delay() -> u64 {
    1
}

fn default_max_reconnect_delay() -> u64 {
    60
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

impl Default for ReconnectionSettings {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_reconnect_delay(),
            max_delay_secs: default_max_reconnect_delay(),
            max_attempts: default_max_reconnect_attempts(),
        }
    }
}

/// Symbol universe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSettings {
    /// Venue identifier stored with every symbol row
    #[serde(default = "default_venue_name")]
    pub venue: String,
    /// Symbols to subscribe to at startup
    #[serde(default = "default_symbols")]
    pub default_symbols: Vec<String>,
    /// High-liquidity symbols; these get the depth channel and small
    /// per-connection symbol counts in the shard plan
    #[serde(default = "default_top_tier")]
    pub top_tier: Vec<String>,
}

fn default_venue_name() -> String {
    "binance-futures".to_string()
}

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_top_tier() -> Vec<String> {
    [
        "BTCUSDT", "ETHUSDT", "BNBUSDT", "SOLUSDT", "XRPUSDT", "DOGEUSDT", "ADAUSDT", "TRXUSDT",
        "AVAXUSDT", "LINKUSDT", "DOTUSDT", "TONUSDT", "MATICUSDT", "LTCUSDT", "NEARUSDT",
        "UNIUSDT", "ATOMUSDT", "XLMUSDT", "FILUSDT", "ETCUSDT",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for SymbolSettings {
    fn default() -> Self {
        Self {
            venue: default_venue_name(),
            default_symbols: default_symbols(),
            top_tier: default_top_tier(),
        }
    }
}

/// Channel enable flags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    #[serde(default = "default_true")]
    pub book_ticker: bool,
    #[serde(default = "default_true")]
    pub agg_trade: bool,
    #[serde(default = "default_true")]
    pub depth: bool,
    #[serde(default)]
    pub mark_price: bool,
    #[serde(default)]
    pub force_order: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            book_ticker: true,
            agg_trade: true,
            depth: true,
            mark_price: false,
            force_order: false,
        }
    }
}

impl ChannelSettings {
    /// Enabled channels in subscription order.
    pub fn enabled(&self) -> Vec<ChannelKind> {
        let mut out = Vec::new();
        if self.book_ticker {
            out.push(ChannelKind::BookTicker);
        }
        if self.agg_trade {
            out.push(ChannelKind::AggTrade);
        }
        if self.depth {
            out.push(ChannelKind::Depth);
        }
        if self.mark_price {
            out.push(ChannelKind::MarkPrice);
        }
        if self.force_order {
            out.push(ChannelKind::ForceOrder);
        }
        out
    }
}

/// Batch writer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSettings {
    /// Flush a table buffer when it holds this many rows
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Flush a table buffer when its oldest row is this old (seconds)
    #[serde(default = "default_batch_max_age")]
    pub batch_max_age_secs: u64,
    /// Bounded queue depth between normalizer and writer (high-water mark)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Hard cap on rows held in one table buffer during store outages
    #[serde(default = "default_buffer_hard_cap")]
    pub buffer_hard_cap: usize,
    /// Flush retry attempts before a batch is considered poisoned
    #[serde(default = "default_flush_retries")]
    pub flush_max_retries: u32,
}

fn default_batch_size() -> usize {
    500
}

fn default_batch_max_age() -> u64 {
    5
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_buffer_hard_cap() -> usize {
    100_000
}

fn default_flush_retries() -> u32 {
    5
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_max_age_secs: default_batch_max_age(),
            queue_capacity: default_queue_capacity(),
            buffer_hard_cap: default_buffer_hard_cap(),
            flush_max_retries: default_flush_retries(),
        }
    }
}

/// Connection sharding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSettings {
    /// Upper bound on concurrent venue connections
    #[serde(default = "default_max_connections_shards")]
    pub max_connections: usize,
    /// Symbols per connection for the high-liquidity tier
    #[serde(default = "default_high_tier_chunk")]
    pub high_tier_symbols_per_connection: usize,
    /// Symbols per connection for the low-liquidity tier
    #[serde(default = "default_low_tier_chunk")]
    pub low_tier_symbols_per_connection: usize,
    /// Circuit breaker settings (per shard)
    #[serde(default)]
    pub breaker: BreakerSettings,
}

fn default_max_connections_shards() -> usize {
    16
}

fn default_high_tier_chunk() -> usize {
    5
}

fn default_low_tier_chunk() -> usize {
    50
}

impl Default for ShardSettings {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections_shards(),
            high_tier_symbols_per_connection: default_high_tier_chunk(),
            low_tier_symbols_per_connection: default_low_tier_chunk(),
            breaker: BreakerSettings::default(),
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive failures within the window that open the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Failure counting window in seconds
    #[serde(default = "default_breaker_window")]
    pub window_secs: u64,
    /// Initial open cooldown in seconds
    #[serde(default = "default_breaker_cooldown")]
    pub cooldown_secs: u64,
    /// Cooldown ceiling in seconds (cooldown doubles on repeated failure)
    #[serde(default = "default_breaker_max_cooldown")]
    pub max_cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_breaker_window() -> u64 {
    60
}

fn default_breaker_cooldown() -> u64 {
    60
}

fn default_breaker_max_cooldown() -> u64 {
    600
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_secs: default_breaker_window(),
            cooldown_secs: default_breaker_cooldown(),
            max_cooldown_secs: default_breaker_max_cooldown(),
        }
    }
}

/// Policy for events that arrive after a second has been closed and its
/// lateness bound has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LateEventPolicy {
    /// Recompute the affected aggregate row from raw tables
    #[default]
    Update,
    /// Drop the aggregate update (the raw row is still stored)
    Reject,
}

/// Per-second rollup and flat grid configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateSettings {
    /// Grace period past the second boundary before closing, milliseconds
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    /// Maximum lateness before a second is force-closed, seconds
    #[serde(default = "default_max_lateness")]
    pub max_lateness_secs: u64,
    /// Policy for events arriving after closure
    #[serde(default)]
    pub late_event_policy: LateEventPolicy,
    /// Flat grid refresh cadence, seconds (must be <= 60)
    #[serde(default = "default_grid_refresh")]
    pub grid_refresh_secs: u64,
    /// Flat grid window, hours
    #[serde(default = "default_grid_window")]
    pub grid_window_hours: u64,
}

fn default_grace_ms() -> u64 {
    500
}

fn default_max_lateness() -> u64 {
    5
}

fn default_grid_refresh() -> u64 {
    60
}

fn default_grid_window() -> u64 {
    24
}

impl Default for AggregateSettings {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
            max_lateness_secs: default_max_lateness(),
            late_event_policy: LateEventPolicy::default(),
            grid_refresh_secs: default_grid_refresh(),
            grid_window_hours: default_grid_window(),
        }
    }
}

/// Retention and compression policies (days)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionSettings {
    /// Scheduler cadence in seconds
    #[serde(default = "default_retention_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_raw_drop")]
    pub raw_drop_after_days: u32,
    #[serde(default = "default_depth_drop")]
    pub depth_drop_after_days: u32,
    #[serde(default = "default_aggregate_drop")]
    pub aggregate_drop_after_days: u32,
    #[serde(default = "default_raw_compress")]
    pub raw_compress_after_days: u32,
    #[serde(default = "default_depth_compress")]
    pub depth_compress_after_days: u32,
    #[serde(default = "default_aggregate_compress")]
    pub aggregate_compress_after_days: u32,
}

fn default_retention_interval() -> u64 {
    3600
}

fn default_raw_drop() -> u32 {
    30
}

fn default_depth_drop() -> u32 {
    7
}

fn default_aggregate_drop() -> u32 {
    180
}

fn default_raw_compress() -> u32 {
    7
}

fn default_depth_compress() -> u32 {
    1
}

fn default_aggregate_compress() -> u32 {
    7
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_retention_interval(),
            raw_drop_after_days: default_raw_drop(),
            depth_drop_after_days: default_depth_drop(),
            aggregate_drop_after_days: default_aggregate_drop(),
            raw_compress_after_days: default_raw_compress(),
            depth_compress_after_days: default_depth_compress(),
            aggregate_compress_after_days: default_aggregate_compress(),
        }
    }
}

/// Validator thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSettings {
    /// Maximum age of the newest event before a symbol is stale, seconds
    #[serde(default = "default_freshness")]
    pub freshness_secs: u64,
    /// Window for the frequency check, seconds
    #[serde(default = "default_frequency_window")]
    pub frequency_window_secs: u64,
    /// Minimum events per minute inside the frequency window
    #[serde(default = "default_min_events_per_minute")]
    pub min_events_per_minute: u64,
    /// Window for the quality checks, seconds
    #[serde(default = "default_quality_window")]
    pub quality_window_secs: u64,
}

fn default_freshness() -> u64 {
    300
}

fn default_frequency_window() -> u64 {
    600
}

fn default_min_events_per_minute() -> u64 {
    1
}

fn default_quality_window() -> u64 {
    3600
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            freshness_secs: default_freshness(),
            frequency_window_secs: default_frequency_window(),
            min_events_per_minute: default_min_events_per_minute(),
            quality_window_secs: default_quality_window(),
        }
    }
}

/// Control plane / monitoring server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Telemetry push cadence on /ws/monitoring, seconds
    #[serde(default = "default_push_interval")]
    pub push_interval_secs: u64,
    /// Drain deadline for Stop before tasks are aborted, seconds
    #[serde(default = "default_drain_deadline")]
    pub drain_deadline_secs: u64,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_push_interval() -> u64 {
    5
}

fn default_drain_deadline() -> u64 {
    10
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            push_interval_secs: default_push_interval(),
            drain_deadline_secs: default_drain_deadline(),
        }
    }
}

impl Settings {
    /// Load settings from configuration files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_prefix("COLLECTOR")
    }

    /// Load settings with a custom environment variable prefix
    pub fn load_with_prefix(env_prefix: &str) -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        let config_dir = Self::config_dir();

        let s = Config::builder()
            // Start with default configuration
            .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
            // Add environment-specific configuration
            .add_source(File::with_name(&format!("{}/{}", config_dir, run_mode)).required(false))
            // Add local overrides (not checked into git)
            .add_source(File::with_name(&format!("{}/local", config_dir)).required(false))
            // Add environment variables (e.g., COLLECTOR__DATABASE__URL)
            .add_source(
                Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            // DATABASE_URL works even without the prefix form
            .set_default(
                "database.url",
                std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgresql://localhost/marketdata".into()),
            )?
            .build()?;

        let mut settings: Settings = s.try_deserialize()?;
        settings.apply_process_env();
        settings.validate()?;
        Ok(settings)
    }

    /// Get the configuration directory path
    fn config_dir() -> String {
        std::env::var("COLLECTOR_CONFIG_DIR").unwrap_or_else(|_| "config".into())
    }

    /// Apply the flat process-level environment variables used by the
    /// deployment tooling on top of whatever the layered sources produced.
    fn apply_process_env(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(ws) = std::env::var("VENUE_WS_BASE") {
            self.venue.ws_base = ws;
        }
        if let Ok(rest) = std::env::var("VENUE_REST_BASE") {
            self.venue.rest_base = rest;
        }
        if let Ok(symbols) = std::env::var("SYMBOLS") {
            let parsed: Vec<String> = symbols
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.symbols.default_symbols = parsed;
            }
        }
        if let Ok(channels) = std::env::var("CHANNELS") {
            let names: Vec<&str> = channels
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .collect();
            if !names.is_empty() {
                self.channels.book_ticker = names.contains(&"bookTicker");
                self.channels.agg_trade = names.contains(&"aggTrade");
                self.channels.depth = names.contains(&"depth");
                self.channels.mark_price = names.contains(&"markPrice");
                self.channels.force_order = names.contains(&"forceOrder");
            }
        }
        if let Some(n) = env_parse::<usize>("BATCH_SIZE") {
            self.ingest.batch_size = n;
        }
        if let Some(n) = env_parse::<u64>("BATCH_MAX_AGE") {
            self.ingest.batch_max_age_secs = n;
        }
        if let Some(n) = env_parse::<usize>("SHARDS") {
            self.shards.max_connections = n;
        }
        if let Some(n) = env_parse::<u16>("MONITORING_PORT") {
            self.monitoring.port = n;
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::Message("database.url must not be empty".into()));
        }
        if self.symbols.default_symbols.is_empty() {
            return Err(ConfigError::Message(
                "symbols.default_symbols must not be empty".into(),
            ));
        }
        if self.channels.enabled().is_empty() {
            return Err(ConfigError::Message(
                "at least one channel must be enabled".into(),
            ));
        }
        if self.shards.max_connections == 0 {
            return Err(ConfigError::Message(
                "shards.max_connections must be at least 1".into(),
            ));
        }
        if self.ingest.batch_size == 0 {
            return Err(ConfigError::Message("ingest.batch_size must be at least 1".into()));
        }
        if self.aggregates.grid_refresh_secs > 60 {
            return Err(ConfigError::Message(
                "aggregates.grid_refresh_secs must be <= 60".into(),
            ));
        }
        Ok(())
    }

    /// Create default settings (useful for testing)
    pub fn default_settings() -> Self {
        Settings {
            database: DatabaseSettings {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgresql://localhost/marketdata".into()),
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                acquire_timeout_secs: default_acquire_timeout(),
            },
            venue: VenueSettings::default(),
            symbols: SymbolSettings::default(),
            channels: ChannelSettings::default(),
            ingest: IngestSettings::default(),
            shards: ShardSettings::default(),
            aggregates: AggregateSettings::default(),
            retention: RetentionSettings::default(),
            validation: ValidationSettings::default(),
            monitoring: MonitoringSettings::default(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::default_settings()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default_settings();
        assert_eq!(settings.database.max_connections, 10);
        assert_eq!(settings.ingest.batch_size, 500);
        assert_eq!(settings.retention.aggregate_drop_after_days, 180);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_default_channels() {
        let channels = ChannelSettings::default();
        let enabled = channels.enabled();
        assert_eq!(
            enabled,
            vec![
                ChannelKind::BookTicker,
                ChannelKind::AggTrade,
                ChannelKind::Depth
            ]
        );
    }

    #[test]
    fn test_validate_rejects_empty_symbols() {
        let mut settings = Settings::default_settings();
        settings.symbols.default_symbols.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_no_channels() {
        let mut settings = Settings::default_settings();
        settings.channels = ChannelSettings {
            book_ticker: false,
            agg_trade: false,
            depth: false,
            mark_price: false,
            force_order: false,
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_slow_grid_refresh() {
        let mut settings = Settings::default_settings();
        settings.aggregates.grid_refresh_secs = 120;
        assert!(settings.validate().is_err());
    }
}
