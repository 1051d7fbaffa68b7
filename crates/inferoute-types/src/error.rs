use thiserror::Error;

/// Error kinds produced by the routing core.
///
/// The API layer owns the mapping from these kinds to HTTP status codes and
/// the stable `{"error":{"kind","message"}}` response body; library crates
/// only ever construct and propagate them.
#[derive(Error, Debug)]
pub enum RouterError {
    /// The filtered endpoint set was empty for a reason other than the model
    /// filter (e.g. no endpoint carries the required tag).
    #[error("no endpoint available for model {model:?}: {reason}")]
    NoEndpoint { model: Option<String>, reason: String },

    /// No registered endpoint serves the requested model.
    #[error("no backend serves model {model:?}")]
    NoBackendForModel { model: String },

    /// TCP/TLS level failure establishing the upstream connection.
    #[error("failed to connect to upstream {url}: {message}")]
    UpstreamConnect { url: String, message: String },

    /// The upstream exceeded the configured request timeout.
    #[error("upstream {url} timed out after {timeout_secs}s")]
    UpstreamTimeout { url: String, timeout_secs: u64 },

    /// The upstream produced a response the relay could not carry.
    #[error("upstream protocol error: {message}")]
    UpstreamProtocol { message: String },

    /// The client went away before the response completed.
    #[error("client cancelled the request")]
    ClientCancelled,

    /// A2A message payload exceeded `max_message_size`.
    #[error("message of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    /// Queue full and the overflow policy is reject (non-default).
    #[error("message queue for agent {agent} is full")]
    QueueOverflow { agent: String },

    /// Messaging operation referenced a workflow that does not exist.
    #[error("unknown workflow {workflow_id}")]
    UnknownWorkflow { workflow_id: String },

    /// The dynamic configuration document failed validation.
    #[error("invalid configuration: {message}")]
    ConfigInvalid { message: String },

    /// The KV-cache oracle could not be reached; recovered locally by the
    /// KV-aware strategy's fallback chain.
    #[error("kv oracle unavailable: {message}")]
    OracleUnavailable { message: String },
}

impl RouterError {
    pub fn no_endpoint(model: Option<&str>, reason: impl Into<String>) -> Self {
        Self::NoEndpoint {
            model: model.map(str::to_owned),
            reason: reason.into(),
        }
    }

    pub fn no_backend_for_model(model: impl Into<String>) -> Self {
        Self::NoBackendForModel {
            model: model.into(),
        }
    }

    pub fn upstream_connect(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpstreamConnect {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    pub fn unknown_workflow(workflow_id: impl Into<String>) -> Self {
        Self::UnknownWorkflow {
            workflow_id: workflow_id.into(),
        }
    }

    pub fn oracle_unavailable(message: impl Into<String>) -> Self {
        Self::OracleUnavailable {
            message: message.into(),
        }
    }

    /// Stable kind string used in the JSON error body and in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoEndpoint { .. } => "no_endpoint",
            Self::NoBackendForModel { .. } => "no_backend_for_model",
            Self::UpstreamConnect { .. } => "upstream_connect",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::UpstreamProtocol { .. } => "upstream_protocol",
            Self::ClientCancelled => "client_cancelled",
            Self::MessageTooLarge { .. } => "message_too_large",
            Self::QueueOverflow { .. } => "queue_overflow",
            Self::UnknownWorkflow { .. } => "unknown_workflow",
            Self::ConfigInvalid { .. } => "config_invalid",
            Self::OracleUnavailable { .. } => "oracle_unavailable",
        }
    }
}

pub type RouterResult<T> = Result<T, RouterError>;
