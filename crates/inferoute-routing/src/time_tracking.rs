use async_trait::async_trait;
use inferoute_types::RouterResult;

use crate::{filter_candidates, min_by_score, RouteDecision, RouteQuery, RoutingStrategy};

/// Completion durations considered per endpoint.
const WINDOW: usize = 100;

const DEFAULT_ALPHA: f64 = 1.0;
const DEFAULT_BETA: f64 = 0.2;
const DEFAULT_GAMMA: f64 = 0.5;

/// Routing on observed end-to-end completion time:
/// `α·mean_completion + β·in_flight + γ·stddev_completion` over the last
/// hundred completions per endpoint. Endpoints with no completions yet
/// score 0 and get explored.
pub struct TimeTrackingStrategy {
    alpha: f64,
    beta: f64,
    gamma: f64,
}

impl TimeTrackingStrategy {
    pub fn new() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            beta: DEFAULT_BETA,
            gamma: DEFAULT_GAMMA,
        }
    }
}

impl Default for TimeTrackingStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoutingStrategy for TimeTrackingStrategy {
    fn name(&self) -> &'static str {
        "time_tracking"
    }

    async fn route(&self, query: &RouteQuery<'_>) -> RouterResult<RouteDecision> {
        let candidates = filter_candidates(query)?;
        let chosen = min_by_score(&candidates, |ep| {
            match query.request_stats.completion_stats_last(&ep.url, WINDOW) {
                Some((mean, stddev)) => {
                    self.alpha * mean
                        + self.beta * query.request_stats.in_flight(&ep.url) as f64
                        + self.gamma * stddev
                }
                None => 0.0,
            }
        });
        Ok(RouteDecision::single(&chosen.url, query.view.phase()))
    }
}
