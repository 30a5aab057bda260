//! Control plane routes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use super::ws::ws_monitoring;
use crate::engine::{CollectorEngine, StartConfig, StartOutcome};
use crate::validation::DataValidator;

/// Shared state for all handlers.
pub struct ApiState {
    pub engine: Arc<CollectorEngine>,
    pub validator: Arc<DataValidator>,
    /// Push cadence for /ws/monitoring.
    pub push_interval_secs: u64,
}

/// Assemble the API router.
pub fn api_router() -> Router<Arc<ApiState>> {
    Router::new()
        .route("/api/collector/start", post(start))
        .route("/api/collector/stop", post(stop))
        .route("/api/collector/restart", post(restart))
        .route("/api/collector/status", get(status))
        .route("/api/database/stats", get(database_stats))
        .route("/api/collector/validate", get(validate))
        .route("/ws/monitoring", get(ws_monitoring))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
}

/// Serve the control plane until the shutdown signal flips.
pub async fn serve(
    state: Arc<ApiState>,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = api_router().with_state(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Control plane listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        })
        .await
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn start(
    State(state): State<Arc<ApiState>>,
    Json(config): Json<StartConfig>,
) -> Response {
    let outcome = state.engine.start(config).await;
    let code = match outcome {
        StartOutcome::Accepted | StartOutcome::AlreadyRunning => StatusCode::OK,
        StartOutcome::Invalid(_) => StatusCode::BAD_REQUEST,
    };
    (code, Json(outcome)).into_response()
}

async fn stop(State(state): State<Arc<ApiState>>) -> Response {
    let outcome = state.engine.stop().await;
    (StatusCode::OK, Json(outcome)).into_response()
}

async fn restart(State(state): State<Arc<ApiState>>) -> Response {
    let outcome = state.engine.restart().await;
    let code = match outcome {
        StartOutcome::Accepted | StartOutcome::AlreadyRunning => StatusCode::OK,
        StartOutcome::Invalid(_) => StatusCode::BAD_REQUEST,
    };
    (code, Json(outcome)).into_response()
}

async fn status(State(state): State<Arc<ApiState>>) -> Response {
    let snapshot = state.engine.status().await;
    (StatusCode::OK, Json(snapshot)).into_response()
}

async fn database_stats(State(state): State<Arc<ApiState>>) -> Response {
    match state.engine.repository().database_stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => {
            warn!(error = %e, "Database stats query failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn validate(State(state): State<Arc<ApiState>>) -> Response {
    match state.validator.validate().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => {
            warn!(error = %e, "Validation failed to run");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
