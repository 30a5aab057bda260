//! HTTP control plane
//!
//! Start/stop/status, database statistics, validation, and a WebSocket
//! monitoring stream pushing compact status snapshots. All operations go
//! through the engine's control mutex; the status endpoint always
//! answers.

mod routes;
mod ws;

pub use routes::{api_router, serve, ApiState};
