use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use inferoute_types::{EndpointInfo, RouterResult};

use crate::{filter_candidates, RouteDecision, RouteQuery, RoutingStrategy};

/// Deterministic rotation over the filtered candidate set.
///
/// The cursor is keyed to a hash of the sorted candidate URLs and resets to
/// the start whenever the set changes, so a scale event cannot leave the
/// rotation pointing mid-sequence at a different set.
pub struct RoundRobinStrategy {
    cursor: AtomicUsize,
    fingerprint: AtomicU64,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            fingerprint: AtomicU64::new(0),
        }
    }

    pub(crate) fn pick<'a>(&self, candidates: &[&'a EndpointInfo]) -> &'a EndpointInfo {
        let mut hasher = DefaultHasher::new();
        for ep in candidates {
            ep.url.hash(&mut hasher);
        }
        let fingerprint = hasher.finish();
        if self.fingerprint.swap(fingerprint, Ordering::AcqRel) != fingerprint {
            self.cursor.store(0, Ordering::Release);
        }
        let index = self.cursor.fetch_add(1, Ordering::AcqRel) % candidates.len();
        candidates[index]
    }
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoutingStrategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        "roundrobin"
    }

    async fn route(&self, query: &RouteQuery<'_>) -> RouterResult<RouteDecision> {
        let candidates = filter_candidates(query)?;
        let chosen = self.pick(&candidates);
        Ok(RouteDecision::single(&chosen.url, query.view.phase()))
    }
}
