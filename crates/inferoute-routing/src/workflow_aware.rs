use std::sync::Arc;

use async_trait::async_trait;
use inferoute_types::RouterResult;
use inferoute_workflow::WorkflowManager;
use tracing::debug;

use crate::{filter_candidates, min_by_score, RouteDecision, RouteQuery, RoutingStrategy};

/// Workflow-affine routing.
///
/// Requests carrying a workflow id stick to the workflow's bound endpoint
/// for as long as it stays registered; unbound (or unbound-again after an
/// endpoint removal) workflows pick via the inner strategy and bind the
/// result through `assign_if_absent`, the single point where a binding can
/// be established. Requests without a workflow id pass straight through to
/// the inner strategy.
pub struct WorkflowAwareStrategy {
    inner: Arc<dyn RoutingStrategy>,
    workflows: Arc<WorkflowManager>,
    /// Advisory stickiness weight: with probability `1 − batching_preference`
    /// a *new* workflow ignores the inner strategy's cache-affine pick and
    /// takes the least-loaded candidate instead, spreading workflows out
    /// when batching them together is not preferred. Existing bindings are
    /// never moved by this.
    batching_preference: f64,
}

impl WorkflowAwareStrategy {
    pub fn new(
        inner: Arc<dyn RoutingStrategy>,
        workflows: Arc<WorkflowManager>,
        batching_preference: f64,
    ) -> Self {
        Self {
            inner,
            workflows,
            batching_preference: batching_preference.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl RoutingStrategy for WorkflowAwareStrategy {
    fn name(&self) -> &'static str {
        "workflow_aware"
    }

    async fn route(&self, query: &RouteQuery<'_>) -> RouterResult<RouteDecision> {
        let Some(workflow_id) = query.workflow_id else {
            return self.inner.route(query).await;
        };

        let candidates = filter_candidates(query)?;
        if let Some(bound) = self.workflows.binding(workflow_id) {
            if candidates.iter().any(|ep| ep.url == bound) {
                return Ok(RouteDecision::single(bound, query.view.phase()));
            }
            // Bound endpoint is gone from the candidate set; fall through
            // and let assign_if_absent below re-bind after the unbind that
            // accompanied its removal.
        }

        let spread = self.batching_preference < 1.0
            && rand::random::<f64>() < 1.0 - self.batching_preference;
        let picked = if spread {
            min_by_score(&candidates, |ep| {
                query.request_stats.in_flight(&ep.url) as f64
            })
            .url
            .clone()
        } else {
            self.inner.route(query).await?.url
        };

        let bound = self.workflows.assign_if_absent(workflow_id, &picked);
        if bound != picked {
            debug!(
                workflow_id,
                bound, picked, "concurrent bind won, following established binding"
            );
        }
        Ok(RouteDecision::single(bound, query.view.phase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round_robin::RoundRobinStrategy;
    use crate::test_support::*;
    use inferoute_workflow::WorkflowConfig;

    fn strategy(parts_workflows: &Arc<WorkflowManager>) -> WorkflowAwareStrategy {
        WorkflowAwareStrategy::new(
            Arc::new(RoundRobinStrategy::new()),
            Arc::clone(parts_workflows),
            1.0,
        )
    }

    #[tokio::test]
    async fn workflow_requests_stick_to_one_endpoint() {
        let workflows = Arc::new(WorkflowManager::new(WorkflowConfig::default()));
        let parts = QueryParts::new(snapshot(&["http://a:8000", "http://b:8000"]));
        let s = strategy(&workflows);

        let mut urls = Vec::new();
        for _ in 0..4 {
            let query = RouteQuery {
                workflow_id: Some("wf-1"),
                ..parts.query()
            };
            urls.push(s.route(&query).await.unwrap().url);
        }
        assert!(urls.iter().all(|u| u == &urls[0]), "binding moved: {urls:?}");
    }

    #[tokio::test]
    async fn no_workflow_id_delegates_to_inner() {
        let workflows = Arc::new(WorkflowManager::new(WorkflowConfig::default()));
        let parts = QueryParts::new(snapshot(&["http://a:8000", "http://b:8000"]));
        let s = strategy(&workflows);
        let first = s.route(&parts.query()).await.unwrap().url;
        let second = s.route(&parts.query()).await.unwrap().url;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn rebinds_after_endpoint_removal() {
        let workflows = Arc::new(WorkflowManager::new(WorkflowConfig::default()));
        let parts = QueryParts::new(snapshot(&["http://a:8000", "http://b:8000"]));
        let s = strategy(&workflows);

        let query = RouteQuery {
            workflow_id: Some("wf-1"),
            ..parts.query()
        };
        let bound = s.route(&query).await.unwrap().url;

        // Endpoint removal: registry shrank and the binding was cleared.
        let survivor = if bound == "http://a:8000" {
            "http://b:8000"
        } else {
            "http://a:8000"
        };
        workflows.unbind_endpoint(&bound);
        let shrunk = QueryParts::new(snapshot(&[survivor]));

        let query = RouteQuery {
            workflow_id: Some("wf-1"),
            ..shrunk.query()
        };
        let rebound = s.route(&query).await.unwrap().url;
        assert_eq!(rebound, survivor);
        assert_eq!(workflows.binding("wf-1").as_deref(), Some(survivor));
    }

    #[tokio::test]
    async fn zero_batching_preference_spreads_by_load() {
        let workflows = Arc::new(WorkflowManager::new(WorkflowConfig::default()));
        let parts = QueryParts::new(snapshot(&["http://a:8000", "http://b:8000"]));
        // a is busy, b idle; spread mode must pick b.
        parts.request_stats.begin("http://a:8000");
        parts.request_stats.begin("http://a:8000");

        let s = WorkflowAwareStrategy::new(
            Arc::new(RoundRobinStrategy::new()),
            Arc::clone(&workflows),
            0.0,
        );
        let query = RouteQuery {
            workflow_id: Some("wf-new"),
            ..parts.query()
        };
        assert_eq!(s.route(&query).await.unwrap().url, "http://b:8000");
    }
}
