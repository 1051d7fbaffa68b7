use async_trait::async_trait;
use inferoute_types::RouterResult;

use crate::kv_aware::affinity_key;
use crate::ring::{HashRing, DEFAULT_VNODES};
use crate::round_robin::RoundRobinStrategy;
use crate::{filter_candidates, RouteDecision, RouteQuery, RoutingStrategy};

/// Prefix-affine routing without an oracle: requests sharing a prompt prefix
/// (or session key) consistently land on the same endpoint, which keeps that
/// endpoint's KV-cache warm for the shared prefix.
pub struct PrefixAwareStrategy {
    fallback: RoundRobinStrategy,
}

impl PrefixAwareStrategy {
    pub fn new() -> Self {
        Self {
            fallback: RoundRobinStrategy::new(),
        }
    }
}

impl Default for PrefixAwareStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoutingStrategy for PrefixAwareStrategy {
    fn name(&self) -> &'static str {
        "prefixaware"
    }

    async fn route(&self, query: &RouteQuery<'_>) -> RouterResult<RouteDecision> {
        let candidates = filter_candidates(query)?;
        let chosen = match affinity_key(query) {
            Some(key) => {
                let urls: Vec<&str> = candidates.iter().map(|ep| ep.url.as_str()).collect();
                let ring = HashRing::new(&urls, DEFAULT_VNODES);
                candidates[ring.pick(&key).unwrap_or(0)]
            }
            None => self.fallback.pick(&candidates),
        };
        Ok(RouteDecision::single(&chosen.url, query.view.phase()))
    }
}
