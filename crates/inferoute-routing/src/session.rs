use async_trait::async_trait;
use inferoute_types::RouterResult;

use crate::ring::{HashRing, DEFAULT_VNODES};
use crate::round_robin::RoundRobinStrategy;
use crate::{filter_candidates, RouteDecision, RouteQuery, RoutingStrategy};

/// Sticky routing by session key.
///
/// The configured session header's value is consistent-hashed onto the
/// filtered candidate set; requests without the header fall back to
/// round-robin.
pub struct SessionStickyStrategy {
    fallback: RoundRobinStrategy,
}

impl SessionStickyStrategy {
    pub fn new() -> Self {
        Self {
            fallback: RoundRobinStrategy::new(),
        }
    }
}

impl Default for SessionStickyStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoutingStrategy for SessionStickyStrategy {
    fn name(&self) -> &'static str {
        "session"
    }

    async fn route(&self, query: &RouteQuery<'_>) -> RouterResult<RouteDecision> {
        let candidates = filter_candidates(query)?;
        let chosen = match query.session_value {
            Some(key) => {
                let urls: Vec<&str> = candidates.iter().map(|ep| ep.url.as_str()).collect();
                let ring = HashRing::new(&urls, DEFAULT_VNODES);
                let index = ring.pick(key).unwrap_or(0);
                candidates[index]
            }
            None => self.fallback.pick(&candidates),
        };
        Ok(RouteDecision::single(&chosen.url, query.view.phase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    #[tokio::test]
    async fn same_session_sticks() {
        let parts = QueryParts::new(snapshot(&[
            "http://a:8000",
            "http://b:8000",
            "http://c:8000",
        ]));
        let strategy = SessionStickyStrategy::new();
        let query = RouteQuery {
            session_value: Some("user-7"),
            ..parts.query()
        };
        let first = strategy.route(&query).await.unwrap().url;
        for _ in 0..5 {
            let query = RouteQuery {
                session_value: Some("user-7"),
                ..parts.query()
            };
            assert_eq!(strategy.route(&query).await.unwrap().url, first);
        }
    }

    #[tokio::test]
    async fn missing_session_falls_back_to_round_robin() {
        let parts = QueryParts::new(snapshot(&["http://a:8000", "http://b:8000"]));
        let strategy = SessionStickyStrategy::new();
        let first = strategy.route(&parts.query()).await.unwrap().url;
        let second = strategy.route(&parts.query()).await.unwrap().url;
        assert_ne!(first, second);
    }
}
