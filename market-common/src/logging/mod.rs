//! Standardized logging configuration for the collector workspace.
//!
//! Provides consistent logging format across all crates with support for:
//! - Human-readable console output (default)
//! - JSON format for log aggregation
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter (e.g., `info`, `data_collector=debug`)
//! - `LOG_FORMAT`: Output format - `pretty` (default), `compact`, or `json`
//! - `LOG_TIMESTAMPS`: Timestamp format - `local` (default), `utc`, or `none`
//! - `LOG_LEVEL`: Default filter when `RUST_LOG` is not set
//!
//! # Usage
//!
//! ```rust,ignore
//! use market_common::logging::{init_logging, LogConfig};
//!
//! init_logging(LogConfig::from_env().with_app_name("data-collector"))?;
//! ```

mod config;

pub use config::{init_logging, LogConfig, LogFormat, TimestampFormat};
