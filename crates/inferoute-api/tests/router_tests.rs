//! End-to-end routing scenarios over the assembled axum router, with
//! wiremock engines standing in for the serving backends.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use inferoute_api::{build_router, AppState, RuntimeSettings};
use inferoute_types::{DynamicConfig, RoutingLogic};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mock_engine() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"id":"cmpl-1","choices":[{"text":"ok"}],"usage":{"prompt_tokens":3,"completion_tokens":7}}"#,
        ))
        .mount(&server)
        .await;
    server
}

fn static_config(urls: &[String], logic: RoutingLogic) -> DynamicConfig {
    DynamicConfig {
        routing_logic: logic,
        static_backends: Some(urls.join(",")),
        static_models: Some(urls.iter().map(|_| "llama").collect::<Vec<_>>().join(",")),
        ..DynamicConfig::default()
    }
}

fn state_with(config: DynamicConfig) -> AppState {
    AppState::new(config, RuntimeSettings::default()).unwrap()
}

fn chat_request(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

const SIMPLE_CHAT: &str = r#"{"model":"llama","messages":[{"role":"user","content":"hi"}]}"#;

#[tokio::test]
async fn round_robin_cycles_three_endpoints() {
    let engines = [mock_engine().await, mock_engine().await, mock_engine().await];
    let mut urls: Vec<String> = engines.iter().map(|e| e.uri()).collect();
    urls.sort();

    let app = build_router(state_with(static_config(&urls, RoutingLogic::RoundRobin)));

    let mut served = Vec::new();
    for _ in 0..6 {
        let response = app.clone().oneshot(chat_request(SIMPLE_CHAT)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        served.push(
            response
                .headers()
                .get("x-served-by")
                .unwrap()
                .to_str()
                .unwrap()
                .to_string(),
        );
    }
    let expected: Vec<String> = urls.iter().cycle().take(6).cloned().collect();
    assert_eq!(served, expected);
}

#[tokio::test]
async fn workflow_requests_share_an_endpoint_and_rebind_on_removal() {
    let a = mock_engine().await;
    let b = mock_engine().await;
    let urls = vec![a.uri(), b.uri()];

    let state = state_with(static_config(&urls, RoutingLogic::WorkflowAware));
    let app = build_router(state.clone());

    let mut served = Vec::new();
    for _ in 0..2 {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .header("x-workflow-id", "wf-1")
            .body(Body::from(SIMPLE_CHAT))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        served.push(
            response
                .headers()
                .get("x-served-by")
                .unwrap()
                .to_str()
                .unwrap()
                .to_string(),
        );
    }
    assert_eq!(served[0], served[1], "workflow affinity broken");
    let bound = served[0].clone();

    // Remove the bound endpoint; the next wf-1 request must land on the
    // survivor and re-bind to it.
    let survivor = if bound == a.uri() { b.uri() } else { a.uri() };
    state
        .apply_config(static_config(
            &[survivor.clone()],
            RoutingLogic::WorkflowAware,
        ))
        .unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("x-workflow-id", "wf-1")
        .body(Body::from(SIMPLE_CHAT))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(
        response.headers().get("x-served-by").unwrap(),
        survivor.as_str()
    );
    assert_eq!(state.workflows().binding("wf-1").unwrap(), survivor);
}

#[tokio::test]
async fn disaggregated_phases_use_tagged_pools_and_stamp_headers() {
    let p1 = mock_engine().await;
    let p2 = mock_engine().await;
    let d1 = mock_engine().await;
    let d2 = mock_engine().await;

    let urls = vec![p1.uri(), p2.uri(), d1.uri(), d2.uri()];
    let config = DynamicConfig {
        routing_logic: RoutingLogic::DisaggregatedPrefill,
        static_backends: Some(urls.join(",")),
        static_models: Some("llama,llama,llama,llama".into()),
        static_model_types: Some("prefill,prefill,decoding,decoding".into()),
        ..DynamicConfig::default()
    };
    let app = build_router(state_with(config));

    // Fresh conversation: prefill phase, prefill pool.
    let response = app.clone().oneshot(chat_request(SIMPLE_CHAT)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let prefill_served = response
        .headers()
        .get("x-served-by")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(
        prefill_served == p1.uri() || prefill_served == p2.uri(),
        "prefill request served by {prefill_served}"
    );
    assert_eq!(
        response.headers().get("x-prefill-by").unwrap().to_str().unwrap(),
        prefill_served
    );
    let parent_id = response
        .headers()
        .get("x-request-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    // Follow-up with an assistant turn: decode phase, decode pool, and both
    // phase headers present because the parent traversed this router.
    let follow_up = r#"{"model":"llama","messages":[
        {"role":"user","content":"hi"},
        {"role":"assistant","content":"hello"},
        {"role":"user","content":"more"}]}"#;
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("x-parent-request-id", &parent_id)
        .body(Body::from(follow_up))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let decode_served = response
        .headers()
        .get("x-served-by")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(
        decode_served == d1.uri() || decode_served == d2.uri(),
        "decode request served by {decode_served}"
    );
    assert_eq!(
        response.headers().get("x-decode-by").unwrap().to_str().unwrap(),
        decode_served
    );
    assert_eq!(
        response.headers().get("x-prefill-by").unwrap().to_str().unwrap(),
        prefill_served
    );
}

#[tokio::test]
async fn unknown_model_is_503_with_stable_body() {
    let a = mock_engine().await;
    let app = build_router(state_with(static_config(
        &[a.uri()],
        RoutingLogic::RoundRobin,
    )));

    let response = app
        .oneshot(chat_request(
            r#"{"model":"not-served","messages":[{"role":"user","content":"hi"}]}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value =
        serde_json::from_slice(&response.into_body().collect().await.unwrap().to_bytes()).unwrap();
    assert_eq!(body["error"]["kind"], "no_backend_for_model");
    assert!(body["error"]["message"].is_string());
}

#[tokio::test]
async fn malformed_json_body_is_400() {
    let a = mock_engine().await;
    let app = build_router(state_with(static_config(
        &[a.uri()],
        RoutingLogic::RoundRobin,
    )));
    let response = app.oneshot(chat_request("{not json")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn request_id_is_echoed_or_generated() {
    let a = mock_engine().await;
    let app = build_router(state_with(static_config(
        &[a.uri()],
        RoutingLogic::RoundRobin,
    )));

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("x-request-id", "req-fixed")
        .body(Body::from(SIMPLE_CHAT))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.headers().get("x-request-id").unwrap(), "req-fixed");

    let response = app.oneshot(chat_request(SIMPLE_CHAT)).await.unwrap();
    assert!(!response
        .headers()
        .get("x-request-id")
        .unwrap()
        .to_str()
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn upstream_5xx_passes_through_verbatim() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string(r#"{"engine":"exploded"}"#))
        .mount(&server)
        .await;

    let app = build_router(state_with(static_config(
        &[server.uri()],
        RoutingLogic::RoundRobin,
    )));
    let response = app.oneshot(chat_request(SIMPLE_CHAT)).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], br#"{"engine":"exploded"}"#);
}

#[tokio::test]
async fn response_body_relayed_unchanged() {
    let a = mock_engine().await;
    let app = build_router(state_with(static_config(
        &[a.uri()],
        RoutingLogic::RoundRobin,
    )));
    let response = app.oneshot(chat_request(SIMPLE_CHAT)).await.unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["usage"]["completion_tokens"], 7);
}

#[tokio::test]
async fn in_flight_returns_to_zero_after_requests() {
    let a = mock_engine().await;
    let state = state_with(static_config(&[a.uri()], RoutingLogic::RoundRobin));
    let app = build_router(state.clone());

    for _ in 0..4 {
        let response = app.clone().oneshot(chat_request(SIMPLE_CHAT)).await.unwrap();
        // Drain the body so the completion hook fires.
        response.into_body().collect().await.unwrap();
    }
    assert_eq!(state.request_stats().total_in_flight(), 0);
    assert_eq!(state.request_stats().view(&a.uri()).completed, 4);
}

#[tokio::test]
async fn models_endpoint_lists_union() {
    let a = mock_engine().await;
    let b = mock_engine().await;
    let config = DynamicConfig {
        static_backends: Some(format!("{},{}", a.uri(), b.uri())),
        static_models: Some("llama,qwen".into()),
        ..DynamicConfig::default()
    };
    let app = build_router(state_with(config));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/models")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value =
        serde_json::from_slice(&response.into_body().collect().await.unwrap().to_bytes()).unwrap();
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["llama", "qwen"]);
}

#[tokio::test]
async fn reconfigure_endpoint_swaps_strategy() {
    let a = mock_engine().await;
    let state = state_with(static_config(&[a.uri()], RoutingLogic::RoundRobin));
    let app = build_router(state.clone());

    let document = format!(
        r#"{{"service_discovery":"static","routing_logic":"qoe_centric",
            "static_backends":"{}","static_models":"llama"}}"#,
        a.uri()
    );
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/reconfigure")
                .header("content-type", "application/json")
                .body(Body::from(document))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(state.strategy().name(), "qoe_centric");

    // Invalid documents leave the configuration untouched.
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/reconfigure")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"service_discovery":"static","routing_logic":"bogus"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(state.strategy().name(), "qoe_centric");
}

#[tokio::test]
async fn api_key_required_when_configured() {
    let a = mock_engine().await;
    let mut config = static_config(&[a.uri()], RoutingLogic::RoundRobin);
    config.api_key = Some("sk-test".into());
    let app = build_router(state_with(config));

    let response = app.clone().oneshot(chat_request(SIMPLE_CHAT)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("authorization", "Bearer sk-test")
        .body(Body::from(SIMPLE_CHAT))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Health stays open.
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn metrics_endpoint_exposes_router_series() {
    let a = mock_engine().await;
    let state = state_with(static_config(&[a.uri()], RoutingLogic::RoundRobin));
    let app = build_router(state.clone());

    let response = app.clone().oneshot(chat_request(SIMPLE_CHAT)).await.unwrap();
    response.into_body().collect().await.unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = String::from_utf8(
        response
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec(),
    )
    .unwrap();
    assert!(text.contains("vllm:num_incoming_requests_total"));
    assert!(text.contains("inferoute_request_duration_seconds"));
}

#[tokio::test]
async fn sse_stream_passes_through_with_usage_accounting() {
    let server = MockServer::start().await;
    let sse_body = "data: {\"choices\":[{\"delta\":{\"content\":\"hel\"}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}],\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2}}\n\n\
data: [DONE]\n\n";
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse_body),
        )
        .mount(&server)
        .await;

    let state = state_with(static_config(&[server.uri()], RoutingLogic::RoundRobin));
    let app = build_router(state.clone());
    let response = app
        .oneshot(chat_request(
            r#"{"model":"llama","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], sse_body.as_bytes());

    let view = state.request_stats().view(&server.uri());
    assert_eq!(view.completed, 1);
}
