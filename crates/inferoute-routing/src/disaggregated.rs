use async_trait::async_trait;
use inferoute_types::{EndpointInfo, RequestPhase, RouterError, RouterResult};

use crate::qoe::QoeStrategy;
use crate::{filter_candidates, min_by_score, RouteDecision, RouteQuery, RoutingStrategy};

/// Disaggregated prefill/decode routing.
///
/// Classifies the request's phase from its body (no assistant turn and no
/// parent reference means prefill) and selects only among endpoints tagged
/// for that phase. Prefill placement chases warm caches and short queues;
/// decode placement chases steady token cadence.
pub struct DisaggregatedStrategy {
    prefill_tag: String,
    decoding_tag: String,
    /// When set, score with the QoE blend instead of the phase formulas
    /// (the `disaggregated_qoe` variant).
    qoe: Option<QoeStrategy>,
}

impl DisaggregatedStrategy {
    pub fn new(prefill_tag: impl Into<String>, decoding_tag: impl Into<String>) -> Self {
        Self {
            prefill_tag: prefill_tag.into(),
            decoding_tag: decoding_tag.into(),
            qoe: None,
        }
    }

    pub fn with_qoe_scoring(mut self) -> Self {
        self.qoe = Some(QoeStrategy::new());
        self
    }

    fn phase_candidates<'a>(
        &self,
        query: &'a RouteQuery<'_>,
        phase: RequestPhase,
    ) -> RouterResult<Vec<&'a EndpointInfo>> {
        let tag = match phase {
            RequestPhase::Prefill => &self.prefill_tag,
            RequestPhase::Decode => &self.decoding_tag,
        };
        let mut candidates = filter_candidates(query)?;
        candidates.retain(|ep| ep.has_tag(tag));
        if candidates.is_empty() {
            return Err(RouterError::no_endpoint(
                query.view.model.as_deref(),
                format!("no endpoint tagged {tag:?} for {} phase", phase.as_str()),
            ));
        }
        Ok(candidates)
    }
}

#[async_trait]
impl RoutingStrategy for DisaggregatedStrategy {
    fn name(&self) -> &'static str {
        if self.qoe.is_some() {
            "disaggregated_qoe"
        } else {
            "disaggregated_prefill"
        }
    }

    async fn route(&self, query: &RouteQuery<'_>) -> RouterResult<RouteDecision> {
        let phase = query.view.phase();
        let candidates = self.phase_candidates(query, phase)?;

        let chosen = match (&self.qoe, query.priority) {
            (Some(_), Some(1)) => min_by_score(&candidates, |ep| {
                query.engine_stats.queue_len(&ep.url).unwrap_or(0.0)
            }),
            (Some(_), _) => min_by_score(&candidates, |ep| {
                let stats = query.request_stats.view(&ep.url);
                if !stats.known {
                    return 0.0;
                }
                stats.ttft_ewma + 0.1 * stats.in_flight as f64 + 0.5 * stats.stddev_completion
            }),
            (None, _) => match phase {
                RequestPhase::Prefill => min_by_score(&candidates, |ep| {
                    let req = query.request_stats.view(&ep.url);
                    let engine = query.engine_stats.get(&ep.url).unwrap_or_default();
                    if !req.known && !engine.is_known() {
                        return 0.0;
                    }
                    req.ttft_ewma + engine.queue_len + (1.0 - engine.gpu_cache_hit_rate)
                }),
                RequestPhase::Decode => min_by_score(&candidates, |ep| {
                    let req = query.request_stats.view(&ep.url);
                    let engine = query.engine_stats.get(&ep.url).unwrap_or_default();
                    if !req.known && !engine.is_known() {
                        return 0.0;
                    }
                    let cadence = if req.tokens_per_second > 0.0 {
                        1.0 / req.tokens_per_second
                    } else {
                        0.0
                    };
                    req.itl_mean + engine.queue_len + cadence
                }),
            },
        };

        let mut decision = RouteDecision::single(&chosen.url, phase);
        match phase {
            RequestPhase::Prefill => decision.prefill_url = Some(chosen.url.clone()),
            RequestPhase::Decode => decision.decode_url = Some(chosen.url.clone()),
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::QueryParts;
    use inferoute_types::{EndpointSnapshot, RequestView};

    fn pd_snapshot() -> EndpointSnapshot {
        EndpointSnapshot::new(vec![
            EndpointInfo::new("http://p1:8000", "llama").with_tags(["prefill"]),
            EndpointInfo::new("http://p2:8000", "llama").with_tags(["prefill"]),
            EndpointInfo::new("http://d1:8000", "llama").with_tags(["decoding"]),
            EndpointInfo::new("http://d2:8000", "llama").with_tags(["decoding"]),
        ])
    }

    #[tokio::test]
    async fn prefill_request_lands_on_prefill_pool() {
        let mut parts = QueryParts::new(pd_snapshot());
        parts.view = RequestView::parse_lossy(
            br#"{"model":"llama","messages":[{"role":"user","content":"hi"}]}"#,
        );
        let strategy = DisaggregatedStrategy::new("prefill", "decoding");
        let decision = strategy.route(&parts.query()).await.unwrap();
        assert!(decision.url.starts_with("http://p"));
        assert_eq!(decision.prefill_url.as_deref(), Some(decision.url.as_str()));
        assert!(decision.decode_url.is_none());
    }

    #[tokio::test]
    async fn decode_request_lands_on_decode_pool() {
        let mut parts = QueryParts::new(pd_snapshot());
        parts.view = RequestView::parse_lossy(
            br#"{"model":"llama","messages":[
                {"role":"user","content":"hi"},
                {"role":"assistant","content":"hello"},
                {"role":"user","content":"go on"}]}"#,
        );
        let strategy = DisaggregatedStrategy::new("prefill", "decoding");
        let decision = strategy.route(&parts.query()).await.unwrap();
        assert!(decision.url.starts_with("http://d"));
        assert_eq!(decision.decode_url.as_deref(), Some(decision.url.as_str()));
    }

    #[tokio::test]
    async fn missing_phase_pool_is_no_endpoint() {
        let mut parts = QueryParts::new(EndpointSnapshot::new(vec![EndpointInfo::new(
            "http://d1:8000",
            "llama",
        )
        .with_tags(["decoding"])]));
        parts.view = RequestView::parse_lossy(
            br#"{"model":"llama","messages":[{"role":"user","content":"hi"}]}"#,
        );
        let strategy = DisaggregatedStrategy::new("prefill", "decoding");
        let err = strategy.route(&parts.query()).await.unwrap_err();
        assert_eq!(err.kind(), "no_endpoint");
    }

    #[tokio::test]
    async fn unparsable_body_classifies_as_prefill() {
        let mut parts = QueryParts::new(pd_snapshot());
        parts.view = RequestView::parse_lossy(b"garbage");
        parts.view.model = Some("llama".to_string());
        let strategy = DisaggregatedStrategy::new("prefill", "decoding");
        let decision = strategy.route(&parts.query()).await.unwrap();
        assert_eq!(decision.phase, RequestPhase::Prefill);
    }

    #[tokio::test]
    async fn prefill_prefers_warm_cache_and_short_queue() {
        use inferoute_stats::ScrapedStats;
        let mut parts = QueryParts::new(pd_snapshot());
        parts.view = RequestView::parse_lossy(
            br#"{"model":"llama","messages":[{"role":"user","content":"hi"}]}"#,
        );
        parts.engine_stats.record_success(
            "http://p1:8000",
            ScrapedStats {
                queue_len: 5.0,
                gpu_cache_hit_rate: 0.1,
                ..Default::default()
            },
        );
        parts.engine_stats.record_success(
            "http://p2:8000",
            ScrapedStats {
                queue_len: 1.0,
                gpu_cache_hit_rate: 0.9,
                ..Default::default()
            },
        );
        let strategy = DisaggregatedStrategy::new("prefill", "decoding");
        assert_eq!(
            strategy.route(&parts.query()).await.unwrap().url,
            "http://p2:8000"
        );
    }
}
