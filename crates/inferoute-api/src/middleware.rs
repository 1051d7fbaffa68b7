use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;

use crate::errors::ApiError;
use crate::state::AppState;

/// API-key gate for the `/v1/*` surface.
///
/// Active only when the dynamic config carries an `api_key`. Accepts
/// `Authorization: Bearer <key>` or `x-api-key: <key>`; comparison is
/// constant-time. Health, metrics and reconfigure stay open; reconfigure is
/// expected to sit behind the operator's network boundary.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let config = state.config();
    let Some(expected) = config.api_key.as_deref() else {
        return next.run(request).await;
    };
    if !request.uri().path().starts_with("/v1/") {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| {
            request
                .headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
        });

    match provided {
        Some(provided) if constant_time_eq(provided, expected) => next.run(request).await,
        _ => ApiError::Unauthorized.into_response(),
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}
