use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName};
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;
use inferoute_routing::RouteQuery;
use inferoute_types::{
    headers, RequestPhase, RequestState, RequestTrack, RequestView, RouterError,
};
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::{ApiError, ApiResult};
use crate::state::AppState;

/// Request bodies are buffered (they are needed for the routing projection
/// anyway); responses are never buffered.
const MAX_REQUEST_BODY: usize = 50 * 1024 * 1024;

/// Upper bound on response bytes retained for `usage` extraction. Streams
/// longer than this fall back to token estimation.
const USAGE_CAPTURE_CAP: usize = 2 * 1024 * 1024;

/// Paths that must carry a well-formed JSON body.
const JSON_BODY_PATHS: &[&str] = &["/v1/chat/completions", "/v1/completions", "/v1/embeddings"];

/// Proxy an inference request: project the body, pick an endpoint, stream
/// the engine's response back chunk-for-chunk, and account the request
/// exactly once whichever way it ends.
pub async fn dispatch(State(state): State<AppState>, req: Request) -> ApiResult<Response> {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    let body_bytes = axum::body::to_bytes(body, MAX_REQUEST_BODY)
        .await
        .map_err(|e| ApiError::validation(format!("unable to read request body: {e}")))?;

    let view = if JSON_BODY_PATHS.contains(&path.as_str()) {
        RequestView::parse(&body_bytes)
            .map_err(|e| ApiError::validation(format!("malformed request body: {e}")))?
    } else {
        RequestView::parse_lossy(&body_bytes)
    };

    let config = state.config();
    let request_id = header_str(&parts.headers, headers::REQUEST_ID)
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let body_meta = view.workflow_metadata.as_ref();
    let workflow_id = header_str(&parts.headers, headers::WORKFLOW_ID)
        .map(str::to_owned)
        .or_else(|| body_meta.and_then(|m| m.workflow_id.clone()));
    let agent_id = header_str(&parts.headers, headers::AGENT_ID)
        .map(str::to_owned)
        .or_else(|| body_meta.and_then(|m| m.agent_id.clone()));
    let parent_request_id = header_str(&parts.headers, headers::PARENT_REQUEST_ID)
        .map(str::to_owned)
        .or_else(|| body_meta.and_then(|m| m.parent_request_id.clone()))
        .or_else(|| view.parent_id.clone())
        .or_else(|| view.previous_message_id.clone());

    let priority = header_str(&parts.headers, &config.priority_header).and_then(|v| v.parse().ok());
    let session_value = header_str(&parts.headers, &config.session_key);
    let model_type = path.ends_with("/audio/transcriptions").then_some("transcription");

    if let Some(wf) = workflow_id.as_deref() {
        state.workflows().get_or_create(wf, agent_id.as_deref());
    }

    // Held for the life of the request: a concurrent reconfigure must not
    // change the strategy a request already admitted under.
    let strategy = state.strategy();
    let snapshot = state.registry().snapshot();
    let decision = {
        let query = RouteQuery {
            endpoints: &snapshot,
            engine_stats: state.engine_stats(),
            request_stats: state.request_stats(),
            view: &view,
            model_type,
            session_value,
            priority,
            workflow_id: workflow_id.as_deref(),
            agent_id: agent_id.as_deref(),
        };
        strategy.route(&query).await?
    };
    let url = decision.url.clone();

    debug!(
        request_id = %request_id,
        url = %url,
        strategy = strategy.name(),
        phase = decision.phase.as_str(),
        workflow_id = workflow_id.as_deref().unwrap_or(""),
        "request routed"
    );

    state
        .metrics()
        .num_incoming_requests_total
        .with_label_values(&[&url])
        .inc();
    if let Some(wf) = workflow_id.as_deref() {
        state
            .metrics()
            .workflow_requests_total
            .with_label_values(&[wf])
            .inc();
    }

    let mut track = RequestTrack::new(request_id.clone(), decision.phase);
    track.workflow_id = workflow_id.clone();
    track.agent_id = agent_id.clone();
    track.prefill_endpoint = decision.prefill_url.clone();
    track.decode_endpoint = decision.decode_url.clone();
    if decision.phase == RequestPhase::Decode && track.prefill_endpoint.is_none() {
        if let Some(parent) = parent_request_id.as_deref() {
            track.prefill_endpoint = state.tracks().prefill_endpoint_of(parent);
        }
    }
    track.advance(RequestState::Routed);
    let prefill_by = track.prefill_endpoint.clone();
    let decode_by = track.decode_endpoint.clone();
    state.tracks().insert(track);

    // From here on the request is accounted in-flight; the hook guarantees
    // exactly one matching decrement on every exit path, including drops.
    state.request_stats().begin(&url);
    let hook = CompletionHook::new(
        state.clone(),
        url.clone(),
        request_id.clone(),
        workflow_id.clone(),
        view.approx_prompt_tokens() as u64,
    );

    let mut upstream = state
        .http()
        .request(
            parts.method.clone(),
            format!("{}{}", url.trim_end_matches('/'), path_and_query),
        )
        .timeout(state.settings().request_timeout);
    for (name, value) in parts.headers.iter() {
        if is_end_to_end(name) {
            upstream = upstream.header(name, value);
        }
    }

    let response = match upstream.body(body_bytes).send().await {
        Ok(response) => response,
        Err(e) => {
            let error = map_upstream_error(e, &url, state.settings().request_timeout.as_secs());
            hook.finish(RequestState::Failed, false);
            return Err(error.into());
        }
    };

    let status = response.status();
    let upstream_headers = response.headers().clone();
    let cache_hit = header_str(&upstream_headers, headers::PREFIX_CACHE_HIT)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    hook.set_cache_hit(cache_hit);
    state
        .tracks()
        .with_mut(&request_id, |t| {
            t.advance(RequestState::Connected);
        });

    let success = status.is_success();
    let body = relay_body(response, hook, success);

    let mut builder = Response::builder().status(status);
    for (name, value) in upstream_headers.iter() {
        if is_end_to_end(name) && name != http::header::CONTENT_LENGTH {
            builder = builder.header(name, value);
        }
    }
    builder = builder
        .header(headers::REQUEST_ID, &request_id)
        .header(headers::SERVED_BY, &url);
    if let Some(prefill) = prefill_by.as_deref() {
        builder = builder.header(headers::PREFILL_BY, prefill);
    }
    if let Some(decode) = decode_by.as_deref() {
        builder = builder.header(headers::DECODE_BY, decode);
    }

    builder
        .body(body)
        .map_err(|e| ApiError::from(RouterError::UpstreamProtocol {
            message: e.to_string(),
        }))
}

/// Relay the upstream body chunk-for-chunk. No intermediate buffering: each
/// chunk is yielded as soon as it arrives, and a slow client backpressures
/// the upstream read through the generator's suspension.
fn relay_body(response: reqwest::Response, hook: CompletionHook, success: bool) -> Body {
    let stream = async_stream::stream! {
        let mut upstream = response.bytes_stream();
        let mut last_chunk_at: Option<Instant> = None;
        let mut capture: Vec<u8> = Vec::new();

        while let Some(next) = upstream.next().await {
            match next {
                Ok(chunk) => {
                    let now = Instant::now();
                    match last_chunk_at {
                        None => hook.record_first_token(),
                        Some(prev) => hook.record_itl(now.duration_since(prev).as_secs_f64()),
                    }
                    last_chunk_at = Some(now);
                    if capture.len() < USAGE_CAPTURE_CAP {
                        capture.extend_from_slice(&chunk);
                    }
                    hook.add_estimated_tokens(count_words(&chunk));
                    yield Ok::<Bytes, std::io::Error>(chunk);
                }
                Err(e) => {
                    hook.finish(RequestState::Failed, false);
                    yield Err(std::io::Error::other(e));
                    return;
                }
            }
        }

        match parse_usage(&capture) {
            Some(usage) => hook.set_reported_usage(usage),
            None => hook.mark_estimated(),
        }
        hook.finish(RequestState::Completed, success);
    };
    Body::from_stream(stream)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Hop-by-hop headers stay on their hop; everything else is forwarded.
fn is_end_to_end(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "host" | "connection" | "transfer-encoding" | "keep-alive" | "upgrade" | "te"
    )
}

fn map_upstream_error(e: reqwest::Error, url: &str, timeout_secs: u64) -> RouterError {
    if e.is_timeout() {
        RouterError::UpstreamTimeout {
            url: url.to_string(),
            timeout_secs,
        }
    } else if e.is_connect() {
        RouterError::upstream_connect(url, e.to_string())
    } else {
        RouterError::UpstreamProtocol {
            message: e.to_string(),
        }
    }
}

fn count_words(chunk: &[u8]) -> u64 {
    String::from_utf8_lossy(chunk).split_whitespace().count() as u64
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub(crate) struct Usage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct UsageEnvelope {
    usage: Option<Usage>,
}

/// Extract the engine-reported `usage` object: either from a plain JSON
/// response or from the last SSE `data:` event that carries one.
pub(crate) fn parse_usage(body: &[u8]) -> Option<Usage> {
    if let Ok(envelope) = serde_json::from_slice::<UsageEnvelope>(body) {
        if let Some(usage) = envelope.usage {
            return Some(usage);
        }
    }
    let text = String::from_utf8_lossy(body);
    for line in text.lines().rev() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data == "[DONE]" {
            continue;
        }
        if let Ok(envelope) = serde_json::from_str::<UsageEnvelope>(data) {
            if let Some(usage) = envelope.usage {
                return Some(usage);
            }
        }
    }
    None
}

/// One-shot completion accounting for a dispatched request.
///
/// Exactly one of the terminal paths fires: normal completion, upstream
/// failure, or — via `Drop` when the client goes away and the body stream
/// is discarded — cancellation. Dropping the hook also drops the upstream
/// response, which closes the engine connection immediately.
struct CompletionHook {
    state: AppState,
    url: String,
    request_id: String,
    workflow_id: Option<String>,
    started: Instant,
    prompt_tokens_estimate: u64,
    estimated_out: AtomicU64,
    reported_in: AtomicU64,
    reported_out: AtomicU64,
    has_reported: AtomicBool,
    cache_hit: AtomicBool,
    saw_first_token: AtomicBool,
    done: AtomicBool,
}

impl CompletionHook {
    fn new(
        state: AppState,
        url: String,
        request_id: String,
        workflow_id: Option<String>,
        prompt_tokens_estimate: u64,
    ) -> Self {
        Self {
            state,
            url,
            request_id,
            workflow_id,
            started: Instant::now(),
            prompt_tokens_estimate,
            estimated_out: AtomicU64::new(0),
            reported_in: AtomicU64::new(0),
            reported_out: AtomicU64::new(0),
            has_reported: AtomicBool::new(false),
            cache_hit: AtomicBool::new(false),
            saw_first_token: AtomicBool::new(false),
            done: AtomicBool::new(false),
        }
    }

    fn set_cache_hit(&self, hit: bool) {
        self.cache_hit.store(hit, Ordering::Release);
    }

    fn record_first_token(&self) {
        if self.saw_first_token.swap(true, Ordering::AcqRel) {
            return;
        }
        let ttft = self.started.elapsed().as_secs_f64();
        self.state.request_stats().record_ttft(&self.url, ttft);
        self.state
            .metrics()
            .ttft_seconds
            .with_label_values(&[&self.url])
            .observe(ttft);
        self.state.tracks().with_mut(&self.request_id, |t| {
            t.first_token_at = Some(Instant::now());
            t.advance(RequestState::Streaming);
        });
    }

    fn record_itl(&self, seconds: f64) {
        self.state.request_stats().record_itl(&self.url, seconds);
    }

    fn add_estimated_tokens(&self, words: u64) {
        self.estimated_out.fetch_add(words, Ordering::AcqRel);
    }

    fn set_reported_usage(&self, usage: Usage) {
        if let Some(prompt) = usage.prompt_tokens {
            self.reported_in.store(prompt, Ordering::Release);
        }
        if let Some(completion) = usage.completion_tokens {
            self.reported_out.store(completion, Ordering::Release);
        }
        self.has_reported.store(
            usage.prompt_tokens.is_some() || usage.completion_tokens.is_some(),
            Ordering::Release,
        );
    }

    fn mark_estimated(&self) {
        self.has_reported.store(false, Ordering::Release);
    }

    fn finish(&self, terminal: RequestState, success: bool) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let duration = self.started.elapsed();
        let reported = self.has_reported.load(Ordering::Acquire);
        let tokens_in = if reported {
            self.reported_in.load(Ordering::Acquire)
        } else {
            self.prompt_tokens_estimate
        };
        let tokens_out = if reported {
            self.reported_out.load(Ordering::Acquire)
        } else {
            self.estimated_out.load(Ordering::Acquire)
        };
        let cache_hit = self.cache_hit.load(Ordering::Acquire);

        self.state
            .request_stats()
            .complete(&self.url, duration, tokens_out, success);
        self.state
            .metrics()
            .request_duration_seconds
            .with_label_values(&[&self.url])
            .observe(duration.as_secs_f64());
        let outcome = match terminal {
            RequestState::Completed if success => "success",
            RequestState::Completed => "upstream_error",
            RequestState::Cancelled => "cancelled",
            _ => "failed",
        };
        self.state
            .metrics()
            .requests_total
            .with_label_values(&[&self.url, outcome])
            .inc();

        if let Some(wf) = self.workflow_id.as_deref() {
            self.state
                .workflows()
                .on_request_complete(wf, success, tokens_out, cache_hit);
        }

        self.state.tracks().with_mut(&self.request_id, |t| {
            if t.state == RequestState::Connected && terminal == RequestState::Completed {
                t.advance(RequestState::Streaming);
            }
            t.advance(terminal);
            t.success = Some(success);
            t.tokens_in = tokens_in;
            t.tokens_out = tokens_out;
            t.tokens_estimated = !reported;
        });

        info!(
            request_id = %self.request_id,
            url = %self.url,
            outcome,
            duration_ms = duration.as_millis() as u64,
            tokens_in,
            tokens_out,
            "request finished"
        );
    }
}

impl Drop for CompletionHook {
    fn drop(&mut self) {
        if !self.done.load(Ordering::Acquire) {
            debug!(request_id = %self.request_id, "client went away, cancelling upstream");
            self.finish(RequestState::Cancelled, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_from_plain_json() {
        let body = br#"{"id":"cmpl-1","usage":{"prompt_tokens":12,"completion_tokens":34}}"#;
        let usage = parse_usage(body).unwrap();
        assert_eq!(usage.prompt_tokens, Some(12));
        assert_eq!(usage.completion_tokens, Some(34));
    }

    #[test]
    fn usage_from_final_sse_event() {
        let body = b"data: {\"choices\":[{}]}\n\n\
data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":9}}\n\n\
data: [DONE]\n\n";
        let usage = parse_usage(body).unwrap();
        assert_eq!(usage.prompt_tokens, Some(5));
        assert_eq!(usage.completion_tokens, Some(9));
    }

    #[test]
    fn no_usage_yields_none() {
        assert!(parse_usage(b"data: [DONE]\n\n").is_none());
        assert!(parse_usage(br#"{"id":"cmpl-1"}"#).is_none());
    }

    #[test]
    fn word_count_is_whitespace_split() {
        assert_eq!(count_words(b"hello brave new world"), 4);
        assert_eq!(count_words(b""), 0);
    }

    #[test]
    fn hop_by_hop_headers_filtered() {
        assert!(!is_end_to_end(&http::header::HOST));
        assert!(!is_end_to_end(&http::header::CONNECTION));
        assert!(is_end_to_end(&http::header::CONTENT_TYPE));
        assert!(is_end_to_end(&HeaderName::from_static("x-request-id")));
    }

    #[test]
    fn upstream_error_mapping() {
        // Only the shape matters here; reqwest errors are hard to fabricate,
        // so exercise the mapping through the public kinds.
        let timeout = RouterError::UpstreamTimeout {
            url: "http://a:8000".into(),
            timeout_secs: 300,
        };
        assert_eq!(timeout.kind(), "upstream_timeout");
    }
}
