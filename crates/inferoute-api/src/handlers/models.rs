use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /v1/models` — OpenAI-compatible union of the model names served by
/// every registered endpoint.
pub async fn list(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.registry().snapshot();
    let data: Vec<Value> = snapshot
        .model_names()
        .into_iter()
        .map(|model| {
            json!({
                "id": model,
                "object": "model",
                "owned_by": "inferoute",
            })
        })
        .collect();
    Json(json!({
        "object": "list",
        "data": data,
    }))
}
