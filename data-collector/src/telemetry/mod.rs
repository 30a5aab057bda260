//! In-process telemetry bus
//!
//! Typed broadcast of connection, ingest, persistence, validation, and
//! retention events. The control plane subscribes to drive its monitoring
//! stream; everything else only publishes.

mod bus;

pub use bus::{TelemetryBus, TelemetryEvent};
