//! Integration tests for the provider transport.
//!
//! These tests start a mock upstream provider (a real axum server on a random
//! port) and drive `ProviderTransport` against it.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::StreamExt;
use modelgate::prelude::*;
use serde_json::{Value, json};

// ── Mock upstream ───────────────────────────────────────────────────

struct Seen {
    path: String,
    headers: HeaderMap,
    body: Value,
}

#[derive(Clone, Default)]
struct Upstream {
    seen: Arc<Mutex<Vec<Seen>>>,
    /// Number of upcoming calls answered with 429.
    throttle: Arc<AtomicUsize>,
}

impl Upstream {
    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn last(&self) -> (String, HeaderMap, Value) {
        let seen = self.seen.lock().unwrap();
        let last = seen.last().expect("no upstream call recorded");
        (last.path.clone(), last.headers.clone(), last.body.clone())
    }
}

async fn echo(
    State(up): State<Upstream>,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    up.seen.lock().unwrap().push(Seen {
        path: uri.path().to_string(),
        headers,
        body: body.clone(),
    });
    let throttled = up
        .throttle
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if throttled {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": {"message": "slow down"}})),
        )
            .into_response();
    }
    Json(json!({"id": "resp-1", "echo": body})).into_response()
}

async fn reject(State(up): State<Upstream>, uri: Uri, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    up.seen.lock().unwrap().push(Seen {
        path: uri.path().to_string(),
        headers,
        body,
    });
    (StatusCode::BAD_REQUEST, Json(json!({"error": {"message": "bad input"}}))).into_response()
}

fn sse(body: Body) -> Response {
    Response::builder()
        .header("content-type", "text/event-stream")
        .body(body)
        .unwrap()
}

async fn stream_ok(State(up): State<Upstream>, Json(body): Json<Value>) -> Response {
    up.seen.lock().unwrap().push(Seen {
        path: "/api/chat".into(),
        headers: HeaderMap::new(),
        body,
    });
    let frames = ["data: {\"n\":1}\n\n", "data: {\"n\":2}\n\n", "data: [DONE]\n\n"];
    sse(Body::from_stream(futures::stream::iter(
        frames.map(|f| Ok::<_, Infallible>(f.to_string())),
    )))
}

async fn stream_broken() -> Response {
    let body = async_stream::stream! {
        yield Ok::<_, std::io::Error>("data: {\"n\":1}\n\n".to_string());
        yield Ok("data: {\"n\":2}\n\n".to_string());
        // Fail once the head and both frames are on the wire.
        tokio::time::sleep(Duration::from_millis(50)).await;
        yield Err(std::io::Error::other("upstream crashed"));
    };
    sse(Body::from_stream(body))
}

async fn spawn_upstream() -> (Upstream, String) {
    let upstream = Upstream::default();
    let router = Router::new()
        .route("/v1/chat/completions", post(echo))
        .route("/v1/messages", post(echo))
        .route("/v1/completions", post(reject))
        .route("/api/chat", post(stream_ok))
        .route("/api/generate", post(stream_broken))
        .with_state(upstream.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (upstream, format!("http://{addr}"))
}

// ── Helpers ─────────────────────────────────────────────────────────

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        ..Default::default()
    }
}

fn transport_for(model: ModelConfig, name: &str, policies: GatewayPolicies, retry: RetryPolicy) -> ProviderTransport {
    let mut resolved = ResolvedModel::new(name, &model);
    resolved.retry = retry;
    ProviderTransport::new(resolved, Arc::new(policies)).unwrap()
}

fn complete(reply: Reply) -> UpstreamResponse {
    match reply {
        Reply::Complete(response) => response,
        Reply::Stream(_) => panic!("expected a buffered reply"),
    }
}

// ── Retry ───────────────────────────────────────────────────────────

#[tokio::test]
async fn retries_throttled_calls_then_succeeds() {
    let (upstream, base) = spawn_upstream().await;
    upstream.throttle.store(2, Ordering::SeqCst);

    let t = transport_for(ModelConfig::new("openai", &base), "gpt", GatewayPolicies::default(), fast_retry(3));
    let reply = t
        .send(Operation::ChatCompletion, &json!({"model": "gpt", "messages": []}), false)
        .await
        .unwrap();

    let response = complete(reply);
    assert_eq!(response.status, 200);
    assert_eq!(response.body["id"], "resp-1");
    assert_eq!(upstream.calls(), 3);
}

#[tokio::test]
async fn exhausted_retries_return_last_response() {
    let (upstream, base) = spawn_upstream().await;
    upstream.throttle.store(10, Ordering::SeqCst);

    let t = transport_for(ModelConfig::new("openai", &base), "gpt", GatewayPolicies::default(), fast_retry(2));
    let response = complete(
        t.send(Operation::ChatCompletion, &json!({"model": "gpt"}), false)
            .await
            .unwrap(),
    );

    assert_eq!(response.status, 429);
    assert_eq!(response.body["error"]["message"], "slow down");
    assert_eq!(upstream.calls(), 3);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let (upstream, base) = spawn_upstream().await;

    let t = transport_for(ModelConfig::new("openai", &base), "gpt", GatewayPolicies::default(), fast_retry(3));
    let response = complete(
        t.send(Operation::Completion, &json!({"model": "gpt", "prompt": "hi"}), false)
            .await
            .unwrap(),
    );

    assert_eq!(response.status, 400);
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn unreachable_upstream_is_a_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let t = transport_for(
        ModelConfig::new("openai", format!("http://{addr}")),
        "gpt",
        GatewayPolicies::default(),
        fast_retry(1),
    );
    let err = t
        .send(Operation::ChatCompletion, &json!({"model": "gpt"}), false)
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Network { .. }));
    assert!(err.is_retryable());
}

// ── Headers and body ────────────────────────────────────────────────

#[tokio::test]
async fn anthropic_call_carries_credentials_policy_and_rewrites() {
    let (upstream, base) = spawn_upstream().await;

    let config: GatewayConfig = serde_json::from_value(json!({
        "models": {
            "claude": {
                "provider": "anthropic",
                "endpoint": format!("{base}/"),
                "api_key": "sk-ant-secret",
                "actual_model_name": "claude-sonnet-4-20250514"
            }
        },
        "header_rules": {
            "drop_headers": ["x-stainless-.*"],
            "add_headers": {"x-team": "platform"},
            "force_headers": {"user-agent": "modelgate"}
        },
        "transformations": [
            {"name": "drop-metadata", "type": "jsonpath_drop", "path": "$.metadata"},
            {"name": "pin-temp", "type": "jsonpath_add", "path": "$.temperature", "value": 0.2},
            {"name": "broken", "type": "regex_replace", "pattern": "(", "replacement": ""}
        ]
    }))
    .unwrap();
    let policies = Arc::new(GatewayPolicies::from_config(&config));
    let model = config.resolve("claude").unwrap();
    let t = ProviderTransport::new(model, policies).unwrap();

    let mut extra = HeaderMap::new();
    extra.insert("x-stainless-os", "linux".parse().unwrap());
    extra.insert("authorization", "Bearer client-token".parse().unwrap());
    extra.insert("x-request-id", "req-42".parse().unwrap());

    let body = json!({
        "model": "claude",
        "max_tokens": 16,
        "messages": [{"role": "user", "content": "hi"}],
        "metadata": {"user_id": "u1"}
    });
    let response = complete(
        t.send_with_headers(Operation::Messages, &body, false, &extra)
            .await
            .unwrap(),
    );
    assert_eq!(response.status, 200);

    let (path, headers, sent) = upstream.last();
    assert_eq!(path, "/v1/messages");
    assert_eq!(headers["x-api-key"], "sk-ant-secret");
    assert_eq!(headers["anthropic-version"], "2023-06-01");
    assert_eq!(headers["user-agent"], "modelgate");
    assert_eq!(headers["x-team"], "platform");
    assert_eq!(headers["x-request-id"], "req-42");
    assert!(!headers.contains_key("authorization"));
    assert!(!headers.contains_key("x-stainless-os"));

    assert_eq!(sent["model"], "claude-sonnet-4-20250514");
    assert_eq!(sent["temperature"], 0.2);
    assert!(sent.get("metadata").is_none());
    assert_eq!(sent["messages"][0]["content"], "hi");
}

// ── Streaming ───────────────────────────────────────────────────────

#[tokio::test]
async fn streaming_reply_relays_frames() {
    let (upstream, base) = spawn_upstream().await;
    let t = transport_for(ModelConfig::new("ollama", &base), "llama", GatewayPolicies::default(), fast_retry(0));

    let reply = t
        .send(Operation::OllamaChat, &json!({"model": "llama", "stream": true}), true)
        .await
        .unwrap();
    let Reply::Stream(stream) = reply else {
        panic!("expected a stream");
    };
    assert_eq!(stream.status, 200);

    let text: String = stream.into_relay(None).collect::<Vec<_>>().await.concat();
    let frames = SseFrame::parse_all(&text);
    assert_eq!(
        frames,
        vec![
            SseFrame::data("{\"n\":1}"),
            SseFrame::data("{\"n\":2}"),
            SseFrame::data("[DONE]"),
        ]
    );
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn broken_stream_ends_with_one_error_frame() {
    let (_upstream, base) = spawn_upstream().await;
    let t = transport_for(ModelConfig::new("ollama", &base), "llama", GatewayPolicies::default(), fast_retry(0));

    let Reply::Stream(stream) = t
        .send(Operation::OllamaGenerate, &json!({"model": "llama"}), true)
        .await
        .unwrap()
    else {
        panic!("expected a stream");
    };

    let text: String = stream.into_relay(None).collect::<Vec<_>>().await.concat();
    let frames = SseFrame::parse_all(&text);
    assert_eq!(frames[0], SseFrame::data("{\"n\":1}"));
    assert_eq!(frames[1], SseFrame::data("{\"n\":2}"));
    assert_eq!(frames.len(), 3);
    let errors: Vec<_> = frames.iter().filter(|f| f.data.contains("stream_error")).collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(frames.last(), Some(errors[0]));

    let error: Value = serde_json::from_str(&errors[0].data).unwrap();
    assert!(error["error"]["message"].as_str().unwrap().starts_with("Streaming error: "));
}

#[tokio::test]
async fn throttled_stream_open_returns_buffered_reply() {
    let (upstream, base) = spawn_upstream().await;
    upstream.throttle.store(5, Ordering::SeqCst);

    let t = transport_for(ModelConfig::new("openai", &base), "gpt", GatewayPolicies::default(), fast_retry(1));
    let response = complete(
        t.send(Operation::ChatCompletion, &json!({"model": "gpt", "stream": true}), true)
            .await
            .unwrap(),
    );

    assert_eq!(response.status, 429);
    assert_eq!(upstream.calls(), 2);
}
