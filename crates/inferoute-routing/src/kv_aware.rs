use async_trait::async_trait;
use inferoute_types::{RequestView, RouterResult};
use serde_json::Value;
use tracing::warn;

use crate::oracle::OracleClient;
use crate::ring::{HashRing, DEFAULT_VNODES};
use crate::round_robin::RoundRobinStrategy;
use crate::{filter_candidates, RouteDecision, RouteQuery, RoutingStrategy};

/// Queue depth above which the oracle's advice is ignored: a warm cache is
/// not worth joining a long line.
const DEFAULT_QUEUE_LEN_THRESHOLD: f64 = 8.0;

/// Characters of prompt text hashed into the affinity key.
const PREFIX_KEY_CHARS: usize = 128;

/// KV-cache-aware routing.
///
/// Short prompts (below `kv_aware_threshold` approximate tokens) gain little
/// from cache reuse and round-robin instead of paying the oracle round-trip.
/// Long prompts consult the oracle for a warm endpoint; when the oracle is
/// down, answers nonsense, or points at an overloaded or unregistered
/// endpoint, the decision degrades to consistent hashing and finally to
/// round-robin.
pub struct KvAwareStrategy {
    oracle: Option<OracleClient>,
    token_threshold: usize,
    queue_len_threshold: f64,
    fallback: RoundRobinStrategy,
}

impl KvAwareStrategy {
    pub fn new(oracle: Option<OracleClient>, token_threshold: usize) -> Self {
        Self {
            oracle,
            token_threshold,
            queue_len_threshold: DEFAULT_QUEUE_LEN_THRESHOLD,
            fallback: RoundRobinStrategy::new(),
        }
    }

    pub fn with_queue_len_threshold(mut self, threshold: f64) -> Self {
        self.queue_len_threshold = threshold;
        self
    }
}

/// Stable affinity key for a request: the session header when present,
/// otherwise the leading prompt text, otherwise the workflow id.
pub(crate) fn affinity_key(query: &RouteQuery<'_>) -> Option<String> {
    if let Some(session) = query.session_value {
        return Some(session.to_string());
    }
    let prefix = prompt_prefix(query.view);
    if !prefix.is_empty() {
        return Some(prefix);
    }
    query.workflow_id.map(str::to_owned)
}

fn prompt_prefix(view: &RequestView) -> String {
    let mut prefix = String::new();
    push_text(&view.prompt, &mut prefix);
    for turn in &view.messages {
        if prefix.len() >= PREFIX_KEY_CHARS {
            break;
        }
        push_text(&turn.content, &mut prefix);
    }
    prefix.truncate(PREFIX_KEY_CHARS);
    prefix
}

fn push_text(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => out.push_str(s),
        Value::Array(parts) => {
            for part in parts {
                if let Some(text) = part.as_str().or_else(|| part["text"].as_str()) {
                    out.push_str(text);
                }
                if out.len() >= PREFIX_KEY_CHARS {
                    break;
                }
            }
        }
        _ => {}
    }
}

#[async_trait]
impl RoutingStrategy for KvAwareStrategy {
    fn name(&self) -> &'static str {
        "kvaware"
    }

    async fn route(&self, query: &RouteQuery<'_>) -> RouterResult<RouteDecision> {
        let candidates = filter_candidates(query)?;
        let phase = query.view.phase();

        if query.view.approx_prompt_tokens() < self.token_threshold {
            let chosen = self.fallback.pick(&candidates);
            return Ok(RouteDecision::single(&chosen.url, phase));
        }

        let key = affinity_key(query);

        if let (Some(oracle), Some(key)) = (&self.oracle, key.as_deref()) {
            match oracle.advise(query.view.model.as_deref(), key).await {
                Ok(Some(advised)) => {
                    let in_set = candidates.iter().any(|ep| ep.url == advised);
                    let queue_ok = query
                        .engine_stats
                        .queue_len(&advised)
                        .is_none_or(|q| q <= self.queue_len_threshold);
                    if in_set && queue_ok {
                        return Ok(RouteDecision::single(advised, phase));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    // Recovered locally: consistent hashing still gives
                    // cache-friendly placement without the oracle.
                    warn!(error = %e, "kv oracle unavailable, falling back to consistent hash");
                }
            }
        }

        let chosen = match key {
            Some(key) => {
                let urls: Vec<&str> = candidates.iter().map(|ep| ep.url.as_str()).collect();
                let ring = HashRing::new(&urls, DEFAULT_VNODES);
                candidates[ring.pick(&key).unwrap_or(0)]
            }
            None => self.fallback.pick(&candidates),
        };
        Ok(RouteDecision::single(&chosen.url, phase))
    }
}
