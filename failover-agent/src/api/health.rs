//! Health check endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::{response::IntoResponse, Json};
use serde_json::json;

use super::ApiState;

/// GET /health - Health check endpoint
pub async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "server": state.server_name,
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "scheduler": state.triggers.is_some(),
    }))
}

/// GET /version - Version information endpoint
pub async fn version() -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "failover-replication/1",
        "features": ["zstd", "throttle"],
    }))
}
