//! WebSocket monitoring stream.
//!
//! Pushes a compact status snapshot on connect and then every push
//! interval (5 s default) until the client goes away.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tracing::debug;

use super::routes::ApiState;

pub async fn ws_monitoring(
    State(state): State<Arc<ApiState>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| push_snapshots(socket, state))
}

async fn push_snapshots(mut socket: WebSocket, state: Arc<ApiState>) {
    debug!("Monitoring client connected");
    let mut ticker =
        tokio::time::interval(Duration::from_secs(state.push_interval_secs.max(1)));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = state.engine.status().await;
                let payload = match serde_json::to_string(&snapshot) {
                    Ok(payload) => payload,
                    Err(e) => {
                        debug!("Snapshot serialization failed: {}", e);
                        continue;
                    }
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    // Clients only ever close or ping; anything else is
                    // ignored.
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    debug!("Monitoring client disconnected");
}
