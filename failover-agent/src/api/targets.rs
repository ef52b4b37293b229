//! Replication history and manual triggers for one target.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use failover_store::{ReplicationRun, ReplicationTarget};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::AppError;
use super::ApiState;
use crate::utils::errors::AgentError;

const MAX_RUNS: usize = 500;

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

async fn find_target(state: &ApiState, id: String) -> Result<ReplicationTarget, AppError> {
    let inventory = state.inventory.clone();
    let target = tokio::task::spawn_blocking(move || inventory.target(&id))
        .await
        .map_err(AgentError::from)?
        .map_err(AgentError::from)?;
    target.ok_or_else(|| AppError::NotFound("Target not found".into()))
}

/// GET /targets/{id}/runs - most recent runs, newest first
pub async fn list_runs(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<ReplicationRun>>, AppError> {
    if query.limit == 0 || query.limit > MAX_RUNS {
        return Err(AppError::BadRequest(format!("limit must be between 1 and {}", MAX_RUNS)));
    }
    let target = find_target(&state, id).await?;

    let log = state.log.clone();
    let runs = tokio::task::spawn_blocking(move || log.recent_runs(&target.id, query.limit))
        .await
        .map_err(AgentError::from)?
        .map_err(AgentError::from)?;
    Ok(Json(runs))
}

/// POST /targets/{id}/replicate - queue a forced run
pub async fn replicate(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let Some(triggers) = state.triggers.clone() else {
        return Err(AppError::Unavailable("Scheduler is disabled on this agent".into()));
    };
    let target = find_target(&state, id).await?;
    if !target.enabled {
        return Err(AppError::BadRequest("Target is disabled".into()));
    }
    if target.source != state.server_name {
        return Err(AppError::BadRequest(format!(
            "Target replicates from {}, not from this server",
            target.source
        )));
    }

    match triggers.trigger(&target.id) {
        Ok(()) => {
            tracing::info!(target_id = %target.id, "Forced replication queued");
            Ok((StatusCode::ACCEPTED, Json(json!({ "queued": target.id }))))
        }
        Err(AgentError::Daemon(m)) => Err(AppError::Unavailable(m)),
        Err(e) => Err(e.into()),
    }
}
