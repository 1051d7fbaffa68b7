//! Engine endpoint discovery.
//!
//! Three variants produce the same thing: a full `Vec<EndpointInfo>` handed
//! to [`EndpointRegistry::replace`]. Static lists resolve once at startup,
//! the file watcher re-reads the dynamic config document on change, and the
//! cluster watcher follows Ready pods matching a label selector.

pub mod file;
#[cfg(feature = "kube-discovery")]
pub mod kube;
pub mod registry;
pub mod static_list;

pub use file::FileDiscovery;
#[cfg(feature = "kube-discovery")]
pub use kube::PodDiscovery;
pub use registry::{EndpointRegistry, RemovalListener};
pub use static_list::static_endpoints;
