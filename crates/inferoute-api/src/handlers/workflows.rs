use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use inferoute_messaging::WorkflowQueueStats;
use inferoute_workflow::WorkflowStatus;
use serde_json::{json, Value};

use crate::errors::{ApiError, ApiResult};
use crate::state::AppState;

/// `GET /v1/workflows/:workflow_id/status`.
pub async fn status(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<WorkflowStatus>> {
    state
        .workflows()
        .status(&workflow_id)
        .map(Json)
        .ok_or_else(|| ApiError::from(inferoute_types::RouterError::unknown_workflow(workflow_id)))
}

/// `GET /v1/workflows/:workflow_id/messages/stats`.
pub async fn message_stats(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<WorkflowQueueStats>> {
    if !state.workflows().contains(&workflow_id) {
        return Err(inferoute_types::RouterError::unknown_workflow(workflow_id).into());
    }
    Ok(Json(state.messages().stats(&workflow_id)))
}

/// `DELETE /v1/workflows/:workflow_id` — explicit teardown: the context is
/// dropped, queues are destroyed and pending pollers wake with 404.
pub async fn destroy(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if state.workflows().destroy(&workflow_id) {
        Ok((StatusCode::OK, Json(json!({ "destroyed": workflow_id }))))
    } else {
        Err(inferoute_types::RouterError::unknown_workflow(workflow_id).into())
    }
}
