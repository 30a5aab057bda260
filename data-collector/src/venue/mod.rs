//! Venue connectivity
//!
//! One WebSocket stream client per shard, a stateless normalizer from wire
//! shapes to internal records, and the depth snapshot/resync flow.

pub mod client;
pub mod depth;
pub mod normalizer;
pub mod types;

use std::time::Duration;

use market_common::error::{ErrorCategory, ErrorClassification};
use serde::Serialize;
use thiserror::Error;

pub use client::{RawFrame, StreamClient, StreamClientConfig};
pub use depth::{
    DepthChainTracker, DepthObservation, DepthSnapshot, DepthSnapshotSource, RestSnapshotSource,
};
pub use normalizer::EventNormalizer;

/// Stream client connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Draining => "draining",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

/// Venue-side errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VenueError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Snapshot request failed: {0}")]
    Snapshot(String),

    #[error("Stream stalled for {0:?}")]
    Stalled(Duration),

    #[error("Symbol not registered: {0}")]
    UnknownSymbol(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ErrorClassification for VenueError {
    fn category(&self) -> ErrorCategory {
        match self {
            VenueError::Connection(_) | VenueError::Stalled(_) | VenueError::Snapshot(_) => {
                ErrorCategory::Transient
            }
            VenueError::Protocol(_) | VenueError::Parse(_) | VenueError::UnknownSymbol(_) => {
                ErrorCategory::Permanent
            }
            VenueError::ChannelClosed => ErrorCategory::Internal,
            VenueError::Configuration(_) => ErrorCategory::Configuration,
        }
    }

    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            VenueError::Connection(_) => Some(Duration::from_secs(1)),
            VenueError::Snapshot(_) => Some(Duration::from_millis(500)),
            VenueError::Stalled(_) => Some(Duration::from_millis(100)),
            _ => None,
        }
    }
}

pub type VenueResult<T> = Result<T, VenueError>;
