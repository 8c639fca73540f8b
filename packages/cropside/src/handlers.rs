//! HTTP handlers (everything that is not the WebSocket endpoint).

use axum::Json;
use axum::extract::State;

use crate::AppState;

/// Liveness plus a coarse ops snapshot: session count and the counter
/// families from every layer.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.metrics.uptime_secs(),
        "sessions": state.registry.session_count().await,
        "connections": state.metrics.snapshot(),
        "delivery": state.broadcaster.stats().snapshot(),
        "signaling": state.coordinator.metrics().snapshot(),
    }))
}
