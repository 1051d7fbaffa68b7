//! The Inferoute HTTP service: OpenAI-compatible ingress, streaming reverse
//! proxy to the selected engine, workflow/A2A endpoints, metrics and runtime
//! reconfiguration.

pub mod app;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod proxy;
pub mod state;
pub mod tracks;

pub use app::build_router;
pub use errors::{ApiError, ApiResult};
pub use state::{AppState, RuntimeSettings};
