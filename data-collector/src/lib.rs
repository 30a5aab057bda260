//! # Data Collector
//!
//! Continuous market-data ingestion engine for Binance USDT-M futures.
//!
//! ## Features
//!
//! - **Multi-stream ingestion**: bookTicker, aggTrade, depth (100 ms),
//!   optional mark price and liquidation channels for 200+ symbols,
//!   sharded across WebSocket connections by liquidity tier
//! - **Durable storage**: idempotent batch upserts into TimescaleDB
//!   hypertables with age-based compression and retention
//! - **Derived data**: per-second rollups (`bt_1s`, `trade_1s`) and a
//!   gap-filled flat 1-second grid (`core_1s_24h`) for ML consumers
//! - **Control plane**: HTTP start/stop/status/validate plus a WebSocket
//!   monitoring stream
//!
//! ## Architecture
//!
//! Stream clients feed the normalizer, which resolves symbol ids, stamps
//! ingest time, and enforces the data model invariants. The batch writer
//! owns the raw tables; the aggregator owns the derived tables. A shard
//! supervisor with per-shard circuit breakers owns connection lifecycles,
//! and every component reports into an in-process telemetry bus consumed
//! by the control plane.

pub mod aggregates;
pub mod api;
pub mod cli;
pub mod config;
pub mod engine;
pub mod ingest;
pub mod schema;
pub mod shard;
pub mod storage;
pub mod symbol;
pub mod telemetry;
pub mod validation;
pub mod venue;

// Re-export commonly used types
pub use config::Settings;
pub use engine::{CollectorEngine, StartConfig, StartOutcome, StatusSnapshot};
pub use schema::{ChannelKind, MarketEvent};
pub use storage::MarketDataRepository;
pub use symbol::SymbolRegistry;
pub use telemetry::{TelemetryBus, TelemetryEvent};
pub use validation::{DataValidator, ValidationReport};
