use std::time::Duration;

use axum::routing::{any, delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::middleware::require_api_key;
use crate::proxy;
use crate::state::AppState;

/// Assemble the full HTTP surface.
///
/// Management routes get an admission timeout; the proxy routes do not —
/// streamed completions legitimately run for minutes and are bounded by the
/// upstream `request_timeout` instead.
pub fn build_router(state: AppState) -> Router {
    let management = Router::new()
        .route("/health", get(handlers::health::health))
        .route("/healthz", get(handlers::health::health))
        .route("/v1/version", get(handlers::health::version))
        .route("/metrics", get(handlers::metrics))
        .route("/reconfigure", post(handlers::reconfigure::reconfigure))
        .route("/v1/models", get(handlers::models::list))
        .route(
            "/v1/workflows/:workflow_id/status",
            get(handlers::workflows::status),
        )
        .route(
            "/v1/workflows/:workflow_id",
            delete(handlers::workflows::destroy),
        )
        .route(
            "/v1/workflows/:workflow_id/messages",
            post(handlers::messages::post),
        )
        .route(
            "/v1/workflows/:workflow_id/messages/stats",
            get(handlers::workflows::message_stats),
        )
        .layer(TimeoutLayer::new(Duration::from_secs(30)));

    // The long-poll route carries its own deadline (up to 60 s) and must
    // outlive the management admission timeout.
    let polling = Router::new().route(
        "/v1/workflows/:workflow_id/agents/:agent_id/messages",
        get(handlers::messages::poll),
    );

    let inference = Router::new()
        .route("/v1/chat/completions", post(proxy::dispatch))
        .route("/v1/completions", post(proxy::dispatch))
        .route("/v1/embeddings", post(proxy::dispatch))
        .route("/v1/audio/transcriptions", post(proxy::dispatch))
        .route("/v1/*rest", any(proxy::dispatch));

    Router::new()
        .merge(management)
        .merge(polling)
        .merge(inference)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
