//! Shared value types for the Inferoute router.
//!
//! Everything that crosses a crate boundary lives here: engine endpoint
//! descriptors and their immutable snapshots, the minimal typed projection of
//! an inference request body, per-request tracking state, the dynamic
//! configuration document, and the router error kinds.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod headers;
pub mod request;
pub mod track;

pub use config::{DiscoveryKind, DynamicConfig, RoutingLogic};
pub use endpoint::{EndpointInfo, EndpointSnapshot};
pub use error::{RouterError, RouterResult};
pub use request::{MessageTurn, RequestPhase, RequestView, WorkflowMetadata};
pub use track::{RequestState, RequestTrack};
