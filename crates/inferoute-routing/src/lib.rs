//! Pluggable routing strategies.
//!
//! Every strategy answers one question: given the current endpoint snapshot
//! and the stats views, which URL serves this request. Strategies are built
//! by name from the dynamic configuration and swapped atomically on
//! reconfigure; in-flight requests keep the strategy they routed with.
//!
//! Common to all strategies: candidates are filtered to endpoints serving
//! the request's model (and model-type tag for specialized paths), and ties
//! break by lexicographic URL order.

mod builder;
mod disaggregated;
mod kv_aware;
mod oracle;
mod prefix_aware;
mod qoe;
mod ring;
mod round_robin;
mod session;
mod time_tracking;
mod workflow_aware;

use async_trait::async_trait;
use inferoute_stats::{EngineStatsRegistry, RequestStatsRegistry};
use inferoute_types::{
    EndpointInfo, EndpointSnapshot, RequestPhase, RequestView, RouterError, RouterResult,
};

pub use builder::{build_strategy, StrategyContext};
pub use disaggregated::DisaggregatedStrategy;
pub use kv_aware::KvAwareStrategy;
pub use oracle::OracleClient;
pub use prefix_aware::PrefixAwareStrategy;
pub use qoe::QoeStrategy;
pub use ring::HashRing;
pub use round_robin::RoundRobinStrategy;
pub use session::SessionStickyStrategy;
pub use time_tracking::TimeTrackingStrategy;
pub use workflow_aware::WorkflowAwareStrategy;

/// Everything a strategy may consult for one routing decision.
pub struct RouteQuery<'a> {
    pub endpoints: &'a EndpointSnapshot,
    pub engine_stats: &'a EngineStatsRegistry,
    pub request_stats: &'a RequestStatsRegistry,
    pub view: &'a RequestView,
    /// Tag required of candidates on specialized paths (e.g. `transcription`).
    pub model_type: Option<&'a str>,
    /// Value of the configured session-key header, when present.
    pub session_value: Option<&'a str>,
    /// Parsed request priority (1 = highest).
    pub priority: Option<u8>,
    pub workflow_id: Option<&'a str>,
    pub agent_id: Option<&'a str>,
}

/// The outcome of a routing decision. `url` is the dispatch target; the
/// phase-specific fields feed the `x-prefill-by` / `x-decode-by` response
/// headers under disaggregated routing.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub url: String,
    pub phase: RequestPhase,
    pub prefill_url: Option<String>,
    pub decode_url: Option<String>,
}

impl RouteDecision {
    pub fn single(url: impl Into<String>, phase: RequestPhase) -> Self {
        Self {
            url: url.into(),
            phase,
            prefill_url: None,
            decode_url: None,
        }
    }
}

#[async_trait]
pub trait RoutingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick an endpoint, or fail with `NoEndpoint` / `NoBackendForModel`
    /// when the filtered candidate set is empty.
    async fn route(&self, query: &RouteQuery<'_>) -> RouterResult<RouteDecision>;
}

/// Shared precondition: restrict the snapshot to endpoints serving the
/// request's model and carrying the required model-type tag. The returned
/// slice preserves the snapshot's lexicographic URL order.
pub fn filter_candidates<'a>(query: &'a RouteQuery<'_>) -> RouterResult<Vec<&'a EndpointInfo>> {
    if query.endpoints.is_empty() {
        return Err(RouterError::no_endpoint(
            query.view.model.as_deref(),
            "no endpoints registered",
        ));
    }

    let mut candidates: Vec<&EndpointInfo> = query.endpoints.iter().collect();

    if let Some(model_type) = query.model_type {
        candidates.retain(|ep| ep.has_tag(model_type));
        if candidates.is_empty() {
            return Err(RouterError::no_endpoint(
                query.view.model.as_deref(),
                format!("no endpoint tagged {model_type:?}"),
            ));
        }
    }

    if let Some(model) = query.view.model.as_deref() {
        candidates.retain(|ep| ep.serves_model(model));
        if candidates.is_empty() {
            return Err(RouterError::no_backend_for_model(model));
        }
    }

    Ok(candidates)
}

/// Minimum-score pick with the stable lexicographic tie-break: candidates
/// arrive URL-sorted and strict `<` keeps the first of equals.
pub(crate) fn min_by_score<'a>(
    candidates: &[&'a EndpointInfo],
    mut score: impl FnMut(&EndpointInfo) -> f64,
) -> &'a EndpointInfo {
    let mut best = candidates[0];
    let mut best_score = score(best);
    for ep in &candidates[1..] {
        let s = score(ep);
        if s < best_score {
            best = ep;
            best_score = s;
        }
    }
    best
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::time::Duration;

    pub fn snapshot(urls: &[&str]) -> EndpointSnapshot {
        EndpointSnapshot::new(
            urls.iter()
                .map(|u| EndpointInfo::new(*u, "llama"))
                .collect(),
        )
    }

    pub struct QueryParts {
        pub endpoints: EndpointSnapshot,
        pub engine_stats: EngineStatsRegistry,
        pub request_stats: RequestStatsRegistry,
        pub view: RequestView,
    }

    impl QueryParts {
        pub fn new(endpoints: EndpointSnapshot) -> Self {
            Self {
                endpoints,
                engine_stats: EngineStatsRegistry::new(),
                request_stats: RequestStatsRegistry::new(Duration::from_secs(60)),
                view: RequestView {
                    model: Some("llama".to_string()),
                    ..RequestView::default()
                },
            }
        }

        pub fn query(&self) -> RouteQuery<'_> {
            RouteQuery {
                endpoints: &self.endpoints,
                engine_stats: &self.engine_stats,
                request_stats: &self.request_stats,
                view: &self.view,
                model_type: None,
                session_value: None,
                priority: None,
                workflow_id: None,
                agent_id: None,
            }
        }
    }
}
