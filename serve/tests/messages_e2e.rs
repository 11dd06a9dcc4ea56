//! End-to-end tests: a real proxy instance against a scripted
//! OpenAI-compatible mock backend, exercised over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Starts a mock chat/completions backend that replies with the given SSE
/// lines (each a `data: …` payload) and a valid `/v1/models`.
async fn start_mock_backend(sse_payloads: Vec<&'static str>) -> SocketAddr {
    use axum::http::header;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};

    let app = axum::Router::new()
        .route(
            "/v1/models",
            get(|| async { axum::Json(serde_json::json!({"data": [{"id": "mock-model"}]})) }),
        )
        .route(
            "/v1/chat/completions",
            post(move || {
                let payloads = sse_payloads.clone();
                async move {
                    let mut body = String::new();
                    for p in payloads {
                        body.push_str("data: ");
                        body.push_str(p);
                        body.push_str("\n\n");
                    }
                    body.push_str("data: [DONE]\n\n");
                    (
                        [(header::CONTENT_TYPE, "text/event-stream")],
                        body,
                    )
                        .into_response()
                }
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Starts the proxy in local mode pointed at `backend`, returns its base URL
/// and the shutdown token.
async fn start_proxy(backend: Option<SocketAddr>) -> (String, CancellationToken, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config: config::ProxyConfig = serde_json::from_value(serde_json::json!({
        "mode": "local",
        "debug": false,
        "anthropic": {},
        "local": {},
        "openrouter": {},
        "cluster": {}
    }))
    .unwrap();
    config.local.base_url = match backend {
        Some(addr) => format!("http://{addr}/v1"),
        None => {
            // Grab a free port and close it again: connection refused, fast.
            let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = closed.local_addr().unwrap();
            drop(closed);
            format!("http://{addr}/v1")
        }
    };

    let services = serve::build_services_with_paths(
        config,
        Some(dir.path().join("cache-monitor.json")),
        Some(dir.path().join("tool-skills")),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        serve::run_serve_on_listener(listener, services, token)
            .await
            .unwrap();
    });
    (format!("http://{addr}"), shutdown, dir)
}

fn sse_event_names(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|l| l.strip_prefix("event: "))
        .map(str::to_string)
        .collect()
}

fn sse_data_payloads(body: &str) -> Vec<serde_json::Value> {
    body.lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .map(|d| serde_json::from_str(d).unwrap())
        .collect()
}

/// **Scenario**: text-only echo, non-streaming.
#[tokio::test]
async fn non_streaming_text_reply() {
    let backend = start_mock_backend(vec![
        r#"{"id":"c1","choices":[{"index":0,"delta":{"role":"assistant","content":"hello"},"finish_reason":null}]}"#,
        r#"{"id":"c1","choices":[{"index":0,"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":3,"completion_tokens":2}}"#,
    ])
    .await;
    let (proxy, shutdown, _dir) = start_proxy(Some(backend)).await;

    let response = reqwest::Client::new()
        .post(format!("{proxy}/v1/messages"))
        .json(&serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": false
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();

    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert!(body["id"].as_str().unwrap().starts_with("msg_"));
    assert_eq!(body["content"][0]["type"], "text");
    assert_eq!(body["content"][0]["text"], "hello");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 3);
    assert_eq!(body["usage"]["output_tokens"], 2);
    assert_eq!(body["usage"]["cache_creation_input_tokens"], 0);
    assert_eq!(body["usage"]["cache_read_input_tokens"], 0);
    shutdown.cancel();
}

/// **Scenario**: text-only streaming produces the exact frame
/// sequence with one message_start and contiguous block indices.
#[tokio::test]
async fn streaming_text_frames_in_order() {
    let backend = start_mock_backend(vec![
        r#"{"id":"c1","choices":[{"index":0,"delta":{"role":"assistant","content":"he"},"finish_reason":null}]}"#,
        r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"llo"},"finish_reason":null}]}"#,
        r#"{"id":"c1","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
    ])
    .await;
    let (proxy, shutdown, _dir) = start_proxy(Some(backend)).await;

    let response = reqwest::Client::new()
        .post(format!("{proxy}/v1/messages"))
        .json(&serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let body = response.text().await.unwrap();

    assert_eq!(
        sse_event_names(&body),
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
    let payloads = sse_data_payloads(&body);
    assert_eq!(payloads[1]["index"], 0);
    assert_eq!(payloads[1]["content_block"]["type"], "text");
    assert_eq!(payloads[2]["delta"]["text"], "he");
    assert_eq!(payloads[3]["delta"]["text"], "llo");
    assert_eq!(payloads[5]["delta"]["stop_reason"], "end_turn");
    shutdown.cancel();
}

/// **Scenario**: tool-call streaming; concatenated
/// input_json_delta fragments form the full JSON object.
#[tokio::test]
async fn streaming_tool_call_frames() {
    let backend = start_mock_backend(vec![
        r#"{"id":"c1","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"t1","function":{"name":"get_weather","arguments":"{\"c"}}]},"finish_reason":null}]}"#,
        r#"{"id":"c1","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"ity\":"}}]},"finish_reason":null}]}"#,
        r#"{"id":"c1","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"SF\"}"}}]},"finish_reason":null}]}"#,
        r#"{"id":"c1","choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
    ])
    .await;
    let (proxy, shutdown, _dir) = start_proxy(Some(backend)).await;

    let body = reqwest::Client::new()
        .post(format!("{proxy}/v1/messages"))
        .json(&serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "weather in SF?"}],
            "stream": true
        }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert_eq!(
        sse_event_names(&body),
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
    let payloads = sse_data_payloads(&body);
    assert_eq!(payloads[1]["content_block"]["type"], "tool_use");
    assert_eq!(payloads[1]["content_block"]["id"], "t1");
    assert_eq!(payloads[1]["content_block"]["name"], "get_weather");
    let concatenated: String = payloads[2..5]
        .iter()
        .map(|p| p["delta"]["partial_json"].as_str().unwrap())
        .collect();
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&concatenated).unwrap(),
        serde_json::json!({"city": "SF"})
    );
    assert_eq!(payloads[6]["delta"]["stop_reason"], "tool_use");
    shutdown.cancel();
}

/// **Scenario**: malformed JSON body → 400 with the Anthropic error shape.
#[tokio::test]
async fn malformed_body_is_400() {
    let backend = start_mock_backend(vec![]).await;
    let (proxy, shutdown, _dir) = start_proxy(Some(backend)).await;

    let response = reqwest::Client::new()
        .post(format!("{proxy}/v1/messages"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "invalid_request_error");
    shutdown.cancel();
}

/// **Scenario**: unreachable backend → one JSON 503 before any stream bytes.
#[tokio::test]
async fn unreachable_backend_is_pre_stream_503() {
    let (proxy, shutdown, _dir) = start_proxy(None).await;

    let response = reqwest::Client::new()
        .post(format!("{proxy}/v1/messages"))
        .json(&serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "overloaded_error");
    shutdown.cancel();
}

/// **Scenario**: admin endpoints answer with their documented shapes.
#[tokio::test]
async fn admin_endpoints() {
    let backend = start_mock_backend(vec![]).await;
    let (proxy, shutdown, _dir) = start_proxy(Some(backend)).await;
    let client = reqwest::Client::new();

    let live: serde_json::Value = client
        .get(format!("{proxy}/health/live"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(live["status"], "alive");

    let ready = client
        .get(format!("{proxy}/health/ready"))
        .send()
        .await
        .unwrap();
    assert_eq!(ready.status(), 200);

    let breaker: serde_json::Value = client
        .get(format!("{proxy}/v1/circuit-breaker/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(breaker["state"], "CLOSED");

    let metrics = client
        .get(format!("{proxy}/v1/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("anyclaude_circuit_breaker_state"));
    shutdown.cancel();
}

/// **Scenario**: non-messages routes 404 in local mode (pass-through is
/// anthropic-mode only).
#[tokio::test]
async fn unknown_route_404_outside_anthropic_mode() {
    let backend = start_mock_backend(vec![]).await;
    let (proxy, shutdown, _dir) = start_proxy(Some(backend)).await;

    let response = reqwest::Client::new()
        .get(format!("{proxy}/v1/models"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    shutdown.cancel();
}
