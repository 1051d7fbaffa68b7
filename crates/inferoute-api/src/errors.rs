use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use inferoute_types::RouterError;
use serde_json::json;
use thiserror::Error;

/// API-level errors with their HTTP mapping.
///
/// Routing-core errors keep their kind; the handlers add the few shapes the
/// core never produces (validation, auth). Every error renders as the stable
/// body `{"error":{"kind","message"}}`.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Router(#[from] RouterError),

    /// Malformed request body or parameters (400).
    #[error("invalid request: {message}")]
    Validation { message: String },

    /// Resource addressed by the URL does not exist (404).
    #[error("not found: {resource}")]
    NotFound { resource: String },

    /// Missing or wrong API key (401).
    #[error("invalid or missing API key")]
    Unauthorized,
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Router(e) => e.kind(),
            Self::Validation { .. } => "invalid_request",
            Self::NotFound { .. } => "not_found",
            Self::Unauthorized => "unauthorized",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Router(e) => match e {
                RouterError::NoEndpoint { .. } | RouterError::NoBackendForModel { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                RouterError::UpstreamConnect { .. } => StatusCode::SERVICE_UNAVAILABLE,
                RouterError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                RouterError::UpstreamProtocol { .. } => StatusCode::BAD_GATEWAY,
                // Nginx convention: client closed the connection.
                RouterError::ClientCancelled => {
                    StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
                }
                RouterError::MessageTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                RouterError::QueueOverflow { .. } => StatusCode::TOO_MANY_REQUESTS,
                RouterError::UnknownWorkflow { .. } => StatusCode::NOT_FOUND,
                RouterError::ConfigInvalid { .. } => StatusCode::BAD_REQUEST,
                RouterError::OracleUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            },
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let kind = self.kind();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(kind, message = %message, "request failed");
        } else {
            tracing::warn!(kind, message = %message, "request rejected");
        }

        let body = Json(json!({
            "error": {
                "kind": kind,
                "message": message,
            }
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_errors_map_to_documented_statuses() {
        let cases = [
            (
                ApiError::from(RouterError::no_backend_for_model("llama")),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ApiError::from(RouterError::UpstreamTimeout {
                    url: "http://a:8000".into(),
                    timeout_secs: 300,
                }),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                ApiError::from(RouterError::MessageTooLarge { size: 9, limit: 1 }),
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (
                ApiError::from(RouterError::unknown_workflow("wf-1")),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(RouterError::ClientCancelled),
                StatusCode::from_u16(499).unwrap(),
            ),
            (ApiError::validation("nope"), StatusCode::BAD_REQUEST),
            (ApiError::Unauthorized, StatusCode::UNAUTHORIZED),
        ];
        for (error, expected) in cases {
            assert_eq!(error.status_code(), expected, "{error}");
        }
    }
}
