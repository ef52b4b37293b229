//! HTTP status and trigger API for the failover agent.

pub mod error;
pub mod health;
pub mod targets;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{get, post},
    Router,
};
use failover_store::{Inventory, ReplicationLog};
use tower_http::trace::TraceLayer;

use crate::scheduler::SchedulerHandle;

/// Shared application state
pub struct ApiState {
    pub server_name: String,
    pub inventory: Arc<dyn Inventory>,
    pub log: Arc<dyn ReplicationLog>,
    /// `None` when the scheduler is disabled.
    pub triggers: Option<SchedulerHandle>,
    pub started_at: Instant,
}

/// Create the API router with all endpoints
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        .route("/targets/{id}/runs", get(targets::list_runs))
        .route("/targets/{id}/replicate", post(targets::replicate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
