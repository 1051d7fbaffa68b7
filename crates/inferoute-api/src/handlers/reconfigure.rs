use axum::extract::State;
use axum::Json;
use bytes::Bytes;
use inferoute_types::DynamicConfig;
use serde_json::{json, Value};
use tracing::info;

use crate::errors::ApiResult;
use crate::state::AppState;

/// `POST /reconfigure` — apply a full dynamic-config document. The document
/// is validated before anything is swapped; a bad document leaves the
/// running configuration untouched and answers 400.
pub async fn reconfigure(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    let config = DynamicConfig::parse(&body)?;
    state.apply_config(config)?;

    let applied = state.config();
    info!(
        routing_logic = applied.routing_logic.as_str(),
        "reconfigured via API"
    );
    Ok(Json(json!({
        "applied": true,
        "routing_logic": applied.routing_logic.as_str(),
        "service_discovery": applied.service_discovery.as_str(),
    })))
}
