//! # Market Common
//!
//! Shared infrastructure for the market data collector workspace:
//!
//! - **Error classification**: traits that let errors self-describe whether
//!   they are transient, permanent, or configuration problems, enabling
//!   generic retry logic across crates.
//! - **Logging**: standardized `tracing` initialization with consistent
//!   formats (pretty, compact, json) and timestamp handling.

pub mod error;
pub mod logging;

pub use error::{retry_with_backoff, ErrorCategory, ErrorClassification};
pub use logging::{init_logging, LogConfig, LogFormat, TimestampFormat};
