use inferoute_types::{DynamicConfig, EndpointInfo, RouterResult};

/// Resolve the static backend lists from a configuration document.
///
/// One-shot: the caller applies the result to the registry and no background
/// task is spawned.
pub fn static_endpoints(config: &DynamicConfig) -> RouterResult<Vec<EndpointInfo>> {
    config.static_endpoints()
}
