use async_trait::async_trait;
use inferoute_types::RouterResult;

use crate::{filter_candidates, min_by_score, RouteDecision, RouteQuery, RoutingStrategy};

/// Score weights: `α·ttft_ewma + β·in_flight + γ·stddev_completion`.
const DEFAULT_ALPHA: f64 = 1.0;
const DEFAULT_BETA: f64 = 0.1;
const DEFAULT_GAMMA: f64 = 0.5;

/// Quality-of-experience-centric routing: minimize the latency the user
/// will feel, weighing time-to-first-token, current load and latency
/// jitter. Endpoints with no request history score 0 so new capacity gets
/// explored instead of starved.
///
/// Priority-1 requests skip the blend and take the shortest engine queue.
pub struct QoeStrategy {
    alpha: f64,
    beta: f64,
    gamma: f64,
}

impl QoeStrategy {
    pub fn new() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            beta: DEFAULT_BETA,
            gamma: DEFAULT_GAMMA,
        }
    }

    pub fn with_weights(alpha: f64, beta: f64, gamma: f64) -> Self {
        Self { alpha, beta, gamma }
    }
}

impl Default for QoeStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoutingStrategy for QoeStrategy {
    fn name(&self) -> &'static str {
        "qoe_centric"
    }

    async fn route(&self, query: &RouteQuery<'_>) -> RouterResult<RouteDecision> {
        let candidates = filter_candidates(query)?;

        let chosen = if query.priority == Some(1) {
            min_by_score(&candidates, |ep| {
                query.engine_stats.queue_len(&ep.url).unwrap_or(0.0)
            })
        } else {
            min_by_score(&candidates, |ep| {
                let stats = query.request_stats.view(&ep.url);
                if !stats.known {
                    return 0.0;
                }
                self.alpha * stats.ttft_ewma
                    + self.beta * stats.in_flight as f64
                    + self.gamma * stats.stddev_completion
            })
        };
        Ok(RouteDecision::single(&chosen.url, query.view.phase()))
    }
}
