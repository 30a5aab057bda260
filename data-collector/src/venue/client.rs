//! Stream client
//!
//! Maintains exactly one duplex connection to the venue, subscribed to a
//! declared set of channel+symbol streams. The state machine is
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (Draining | Reconnecting | Failed)
//! ```
//!
//! Reconnects use exponential backoff with full jitter, bounded by a
//! ceiling, plus a rate limiter on attempts per window. Inbound frames are
//! forwarded on a bounded channel; when the channel is full the client
//! blocks (drop-newest is forbidden) and the stall is surfaced to
//! telemetry as backpressure.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::types::SubscribeMessage;
use super::{ConnectionState, VenueError, VenueResult};
use crate::config::VenueSettings;
use crate::telemetry::{TelemetryBus, TelemetryEvent};

/// Forwarding waits above this threshold are published as backpressure.
const BACKPRESSURE_THRESHOLD: Duration = Duration::from_millis(100);

/// One raw text frame from the venue, stamped with a monotone
/// per-connection sequence and the receive time.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub shard_id: usize,
    pub sequence: u64,
    pub received_at: DateTime<Utc>,
    pub payload: String,
}

/// Stream client settings, derived from [`VenueSettings`] per shard.
#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    pub shard_id: usize,
    pub ws_base: String,
    pub streams: Vec<String>,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub rate_limit_attempts: u32,
    pub rate_limit_window: Duration,
}

impl StreamClientConfig {
    pub fn from_settings(shard_id: usize, streams: Vec<String>, venue: &VenueSettings) -> Self {
        Self {
            shard_id,
            ws_base: venue.ws_base.clone(),
            streams,
            connect_timeout: Duration::from_secs(venue.connect_timeout_secs),
            idle_timeout: Duration::from_secs(venue.idle_timeout_secs),
            initial_reconnect_delay: Duration::from_secs(venue.reconnection.initial_delay_secs),
            max_reconnect_delay: Duration::from_secs(venue.reconnection.max_delay_secs),
            max_reconnect_attempts: venue.reconnection.max_attempts,
            rate_limit_attempts: venue.rate_limit_attempts,
            rate_limit_window: Duration::from_secs(venue.rate_limit_window_secs),
        }
    }
}

/// One persistent WebSocket connection to the venue.
pub struct StreamClient {
    config: StreamClientConfig,
    frames_tx: mpsc::Sender<RawFrame>,
    state_tx: watch::Sender<ConnectionState>,
    telemetry: TelemetryBus,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    messages_received: Arc<AtomicU64>,
}

impl StreamClient {
    /// Create a client. Returns the client plus a watch for its state.
    pub fn new(
        config: StreamClientConfig,
        frames_tx: mpsc::Sender<RawFrame>,
        telemetry: TelemetryBus,
    ) -> (Self, watch::Receiver<ConnectionState>, Arc<AtomicU64>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let quota = Quota::with_period(config.rate_limit_window)
            .expect("rate limit window must be non-zero")
            .allow_burst(NonZeroU32::new(config.rate_limit_attempts.max(1)).unwrap());
        let messages_received = Arc::new(AtomicU64::new(0));

        let client = Self {
            config,
            frames_tx,
            state_tx,
            telemetry,
            rate_limiter: RateLimiter::direct(quota),
            messages_received: messages_received.clone(),
        };
        (client, state_rx, messages_received)
    }

    fn set_state(&self, state: ConnectionState, detail: Option<String>) {
        let _ = self.state_tx.send(state);
        self.telemetry.publish(TelemetryEvent::ConnectionStateChanged {
            shard_id: self.config.shard_id,
            state,
            detail,
        });
    }

    /// Run until shutdown or until the reconnect budget is exhausted.
    ///
    /// Returns `Ok(())` on a controlled drain and `Err` when the client
    /// gives up; the shard supervisor decides what happens next.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> VenueResult<()> {
        let url = format!("{}/stream", self.config.ws_base);
        let mut reconnect_attempts: u32 = 0;
        let mut current_delay = self.config.initial_reconnect_delay;

        loop {
            if *shutdown.borrow() {
                self.set_state(ConnectionState::Draining, None);
                self.set_state(ConnectionState::Disconnected, None);
                return Ok(());
            }

            self.set_state(ConnectionState::Connecting, None);

            match self.connect_and_read(&url, &mut shutdown).await {
                Ok(SessionEnd::Drained) => {
                    info!(shard_id = self.config.shard_id, "Stream client drained");
                    self.set_state(ConnectionState::Disconnected, None);
                    return Ok(());
                }
                Ok(SessionEnd::Disconnected(reason)) => {
                    warn!(
                        shard_id = self.config.shard_id,
                        reason, "Connection ended, will reconnect"
                    );
                    self.set_state(ConnectionState::Reconnecting, Some(reason));
                }
                Err(e) => {
                    warn!(
                        shard_id = self.config.shard_id,
                        error = %e,
                        "Connection attempt failed"
                    );
                    self.set_state(ConnectionState::Reconnecting, Some(e.to_string()));
                }
            }

            reconnect_attempts += 1;
            if reconnect_attempts >= self.config.max_reconnect_attempts {
                error!(
                    shard_id = self.config.shard_id,
                    attempts = reconnect_attempts,
                    "Reconnect budget exhausted"
                );
                self.set_state(
                    ConnectionState::Failed,
                    Some(format!("{} consecutive failures", reconnect_attempts)),
                );
                return Err(VenueError::Connection(format!(
                    "max reconnection attempts ({}) exceeded",
                    self.config.max_reconnect_attempts
                )));
            }

            // Respect the attempts-per-window limit before backing off.
            if self.rate_limiter.check().is_err() {
                warn!(
                    shard_id = self.config.shard_id,
                    window = ?self.config.rate_limit_window,
                    "Reconnection rate limit exceeded, waiting out the window"
                );
                tokio::select! {
                    _ = sleep(self.config.rate_limit_window) => {}
                    _ = shutdown.changed() => continue,
                }
            }

            // Full jitter: sleep a uniform random duration up to the
            // current exponential ceiling.
            let ceiling = current_delay.as_millis() as u64;
            let jittered = Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling));
            debug!(
                shard_id = self.config.shard_id,
                attempt = reconnect_attempts,
                delay_ms = jittered.as_millis() as u64,
                "Backing off before reconnect"
            );
            tokio::select! {
                _ = sleep(jittered) => {}
                _ = shutdown.changed() => continue,
            }
            current_delay = std::cmp::min(current_delay * 2, self.config.max_reconnect_delay);
        }
    }

    /// One connection attempt and its read loop.
    async fn connect_and_read(
        &self,
        url: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> VenueResult<SessionEnd> {
        let connect = tokio::time::timeout(self.config.connect_timeout, connect_async(url));
        let (ws_stream, _) = match connect.await {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => return Err(VenueError::Connection(e.to_string())),
            Err(_) => {
                return Err(VenueError::Connection(format!(
                    "connect timed out after {:?}",
                    self.config.connect_timeout
                )))
            }
        };

        let (mut write, mut read) = ws_stream.split();

        // Subscribe to all streams for this shard in one message.
        let subscribe = SubscribeMessage::new(self.config.streams.clone());
        let subscribe_json = serde_json::to_string(&subscribe)
            .map_err(|e| VenueError::Protocol(format!("failed to serialize subscription: {}", e)))?;
        write
            .send(Message::Text(subscribe_json))
            .await
            .map_err(|e| VenueError::Connection(format!("failed to send subscription: {}", e)))?;

        self.set_state(ConnectionState::Connected, None);
        info!(
            shard_id = self.config.shard_id,
            streams = self.config.streams.len(),
            "Connected and subscribed"
        );

        let mut sequence: u64 = 0;
        let idle = self.config.idle_timeout;

        loop {
            let frame = tokio::select! {
                msg = tokio::time::timeout(idle, read.next()) => msg,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Controlled shutdown: stop reading, close politely.
                        self.set_state(ConnectionState::Draining, None);
                        if let Err(e) = write.send(Message::Close(None)).await {
                            debug!("Close frame not delivered: {}", e);
                        }
                        return Ok(SessionEnd::Drained);
                    }
                    continue;
                }
            };

            let msg = match frame {
                Err(_) => {
                    // No frame inside the idle window: treat as a stall.
                    return Ok(SessionEnd::Disconnected(format!(
                        "no message for {:?}",
                        idle
                    )));
                }
                Ok(None) => return Ok(SessionEnd::Disconnected("stream ended".to_string())),
                Ok(Some(Err(e))) => return Ok(SessionEnd::Disconnected(e.to_string())),
                Ok(Some(Ok(msg))) => msg,
            };

            match msg {
                Message::Text(text) => {
                    sequence += 1;
                    self.messages_received.fetch_add(1, Ordering::Relaxed);

                    let frame = RawFrame {
                        shard_id: self.config.shard_id,
                        sequence,
                        received_at: Utc::now(),
                        payload: text,
                    };

                    // Bounded send: blocks when the normalizer is behind,
                    // pausing reads instead of dropping frames.
                    let send_start = Instant::now();
                    if self.frames_tx.send(frame).await.is_err() {
                        return Err(VenueError::ChannelClosed);
                    }
                    let waited = send_start.elapsed();
                    if waited > BACKPRESSURE_THRESHOLD {
                        warn!(
                            shard_id = self.config.shard_id,
                            wait_ms = waited.as_millis() as u64,
                            "Downstream queue full, reads paused"
                        );
                        self.telemetry.publish(TelemetryEvent::Backpressure {
                            shard_id: self.config.shard_id,
                            wait_ms: waited.as_millis() as u64,
                        });
                    }
                }
                Message::Ping(payload) => {
                    if let Err(e) = write.send(Message::Pong(payload)).await {
                        return Ok(SessionEnd::Disconnected(format!("pong failed: {}", e)));
                    }
                }
                Message::Close(_) => {
                    return Ok(SessionEnd::Disconnected("server closed".to_string()));
                }
                _ => {}
            }
        }
    }
}

/// How a connected session ended.
enum SessionEnd {
    /// Controlled shutdown; in-flight frames were forwarded.
    Drained,
    /// Transport error, stall, or server close; reconnect.
    Disconnected(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VenueSettings;

    fn test_config() -> StreamClientConfig {
        let mut venue = VenueSettings::default();
        venue.reconnection.initial_delay_secs = 1;
        venue.reconnection.max_delay_secs = 8;
        venue.reconnection.max_attempts = 2;
        StreamClientConfig::from_settings(
            0,
            vec!["btcusdt@bookTicker".to_string()],
            &venue,
        )
    }

    #[tokio::test]
    async fn test_client_starts_disconnected() {
        let (tx, _rx) = mpsc::channel(4);
        let (_client, state_rx, _counter) =
            StreamClient::new(test_config(), tx, TelemetryBus::default());
        assert_eq!(*state_rx.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_client_fails_after_reconnect_budget() {
        // Nothing listens on this port; the client must burn its two
        // attempts and report Failed.
        let mut config = test_config();
        config.ws_base = "ws://127.0.0.1:9".to_string();
        config.connect_timeout = Duration::from_millis(200);
        config.initial_reconnect_delay = Duration::from_millis(10);
        config.max_reconnect_delay = Duration::from_millis(20);

        let (tx, _rx) = mpsc::channel(4);
        let (client, state_rx, _counter) =
            StreamClient::new(config, tx, TelemetryBus::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let result = client.run(shutdown_rx).await;
        assert!(result.is_err());
        assert_eq!(*state_rx.borrow(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_client_drains_on_shutdown() {
        let mut config = test_config();
        config.ws_base = "ws://127.0.0.1:9".to_string();
        config.connect_timeout = Duration::from_millis(200);
        config.initial_reconnect_delay = Duration::from_secs(5);
        config.max_reconnect_attempts = 100;

        let (tx, _rx) = mpsc::channel(4);
        let (client, state_rx, _counter) =
            StreamClient::new(config, tx, TelemetryBus::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(client.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("client did not stop in time")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(*state_rx.borrow(), ConnectionState::Disconnected);
    }
}
