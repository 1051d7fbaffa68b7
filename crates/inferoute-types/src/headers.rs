//! Header names the router reads and writes.
//!
//! The priority / expected-output / SLA header names are configurable and
//! these constants are only their defaults; everything else is fixed wire
//! contract.

/// Echoed back on every response; auto-generated when absent.
pub const REQUEST_ID: &str = "x-request-id";

pub const WORKFLOW_ID: &str = "x-workflow-id";
pub const AGENT_ID: &str = "x-agent-id";
pub const PARENT_REQUEST_ID: &str = "x-parent-request-id";

/// Default request priority header, integer `1|2|3` (1 = highest).
pub const PRIORITY: &str = "x-request-priority";
/// Default QoE hint: expected output length in tokens.
pub const EXPECTED_OUTPUT_TOKENS: &str = "x-expected-output-tokens";
/// Default QoE hint: target SLA in milliseconds.
pub const SLA_TARGET_MS: &str = "x-sla-target-ms";

/// Added to every proxied response: URL of the backend that served the
/// final hop.
pub const SERVED_BY: &str = "x-served-by";
/// Disaggregated routing: the endpoint that handled the prefill phase.
pub const PREFILL_BY: &str = "x-prefill-by";
/// Disaggregated routing: the endpoint that handled the decode phase.
pub const DECODE_BY: &str = "x-decode-by";

/// Engine-reported prefix-cache hit sentinel read from response headers.
/// Engines that do not emit it fall back to scraped cache-hit-rate stats.
pub const PREFIX_CACHE_HIT: &str = "x-prefix-cache-hit";
