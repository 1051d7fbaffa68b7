use std::sync::Arc;

use inferoute_types::{DynamicConfig, RoutingLogic};
use inferoute_workflow::WorkflowManager;

use crate::disaggregated::DisaggregatedStrategy;
use crate::kv_aware::KvAwareStrategy;
use crate::oracle::OracleClient;
use crate::prefix_aware::PrefixAwareStrategy;
use crate::qoe::QoeStrategy;
use crate::round_robin::RoundRobinStrategy;
use crate::session::SessionStickyStrategy;
use crate::time_tracking::TimeTrackingStrategy;
use crate::workflow_aware::WorkflowAwareStrategy;
use crate::RoutingStrategy;

/// Process-scoped collaborators a strategy may need. Passed explicitly so
/// strategies never reach for globals.
pub struct StrategyContext {
    pub workflows: Arc<WorkflowManager>,
    pub http: reqwest::Client,
}

/// Build the strategy named by the configuration document. Reconfiguration
/// builds a fresh strategy and swaps it in; per-strategy state (cursors,
/// windows) starts clean on every swap.
pub fn build_strategy(config: &DynamicConfig, ctx: &StrategyContext) -> Arc<dyn RoutingStrategy> {
    let oracle = || {
        config
            .kv_oracle_url
            .as_ref()
            .map(|url| OracleClient::new(ctx.http.clone(), url))
    };

    match config.routing_logic {
        RoutingLogic::RoundRobin => Arc::new(RoundRobinStrategy::new()),
        RoutingLogic::Session => Arc::new(SessionStickyStrategy::new()),
        RoutingLogic::KvAware => {
            Arc::new(KvAwareStrategy::new(oracle(), config.kv_aware_threshold))
        }
        RoutingLogic::PrefixAware => Arc::new(PrefixAwareStrategy::new()),
        RoutingLogic::WorkflowAware => Arc::new(WorkflowAwareStrategy::new(
            Arc::new(KvAwareStrategy::new(oracle(), config.kv_aware_threshold)),
            Arc::clone(&ctx.workflows),
            config.batching_preference,
        )),
        RoutingLogic::QoeCentric => Arc::new(QoeStrategy::new()),
        RoutingLogic::DisaggregatedPrefill => Arc::new(DisaggregatedStrategy::new(
            &config.prefill_tag,
            &config.decoding_tag,
        )),
        RoutingLogic::DisaggregatedQoe => Arc::new(
            DisaggregatedStrategy::new(&config.prefill_tag, &config.decoding_tag)
                .with_qoe_scoring(),
        ),
        RoutingLogic::TimeTracking => Arc::new(TimeTrackingStrategy::new()),
    }
}
