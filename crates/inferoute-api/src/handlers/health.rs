use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /health` and `/healthz`.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let config = state.config();
    Json(json!({
        "status": "ok",
        "uptime_seconds": state.uptime().as_secs(),
        "endpoints": state.registry().snapshot().len(),
        "routing_logic": config.routing_logic.as_str(),
        "service_discovery": config.service_discovery.as_str(),
        "live_workflows": state.workflows().len(),
    }))
}

/// `GET /v1/version`.
pub async fn version(State(state): State<AppState>) -> Json<Value> {
    let config = state.config();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "routing_logic": config.routing_logic.as_str(),
        "service_discovery": config.service_discovery.as_str(),
    }))
}
