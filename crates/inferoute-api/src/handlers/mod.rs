pub mod health;
pub mod messages;
pub mod models;
pub mod reconfigure;
pub mod workflows;

use axum::extract::State;

use crate::errors::ApiResult;
use crate::state::AppState;

/// `GET /metrics` — Prometheus exposition. Gauges mirroring polled state are
/// refreshed right before rendering so scrapes never lag the refresh task.
pub async fn metrics(State(state): State<AppState>) -> ApiResult<String> {
    state.refresh_gauges();
    state
        .metrics()
        .gather()
        .map_err(|e| crate::errors::ApiError::validation(format!("metrics encoding failed: {e}")))
}
