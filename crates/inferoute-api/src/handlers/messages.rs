use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::Json;
use inferoute_messaging::{Message, PostOutcome};
use serde::Deserialize;
use serde_json::Value;

use crate::errors::{ApiError, ApiResult};
use crate::state::AppState;

fn default_kind() -> String {
    "data".to_string()
}
fn default_ttl() -> u64 {
    300
}

#[derive(Debug, Deserialize)]
pub struct PostMessageBody {
    pub source_agent: String,
    pub target_agent: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,
}

/// `POST /v1/workflows/:workflow_id/messages`.
///
/// Posting registers the source agent in the workflow (creating the workflow
/// if needed), so a broadcast right after sees it as a member.
pub async fn post(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Json(body): Json<PostMessageBody>,
) -> ApiResult<Json<PostOutcome>> {
    if body.source_agent.is_empty() || body.target_agent.is_empty() {
        return Err(ApiError::validation(
            "source_agent and target_agent are required",
        ));
    }

    state
        .workflows()
        .get_or_create(&workflow_id, Some(&body.source_agent));
    let known_agents = state
        .workflows()
        .agents(&workflow_id)
        .unwrap_or_default();

    let outcome = state.messages().post(
        &workflow_id,
        &body.source_agent,
        &body.target_agent,
        &body.kind,
        body.payload,
        body.ttl_seconds,
        &known_agents,
    )?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct PollParams {
    pub max_messages: Option<usize>,
    /// Long-poll deadline in seconds (default 5, capped at 60).
    pub timeout: Option<u64>,
}

/// `GET /v1/workflows/:workflow_id/agents/:agent_id/messages` — long-poll.
pub async fn poll(
    State(state): State<AppState>,
    Path((workflow_id, agent_id)): Path<(String, String)>,
    Query(params): Query<PollParams>,
) -> ApiResult<Json<Vec<Message>>> {
    if !state.workflows().contains(&workflow_id) {
        return Err(inferoute_types::RouterError::unknown_workflow(workflow_id).into());
    }
    // Polling is how an agent subscribes; make it visible to broadcasts.
    state.workflows().touch(&workflow_id, Some(&agent_id));

    let messages = state
        .messages()
        .poll(
            &workflow_id,
            &agent_id,
            params.max_messages.unwrap_or(16),
            params.timeout.map(Duration::from_secs),
        )
        .await?;
    Ok(Json(messages))
}
