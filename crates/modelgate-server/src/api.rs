//! HTTP endpoint handlers.
//!
//! Each handler checks the request shape, resolves the model, builds a
//! per-request [`ProviderTransport`], and turns its [`Reply`] into an axum
//! response: buffered JSON with the upstream status, or an SSE body fed by
//! the relay.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use modelgate::api::provider::{self, Operation};
use modelgate::api::transport::{ProviderTransport, Reply};
use modelgate::config::{GatewayConfig, GatewayPolicies, ResolvedModel};
use modelgate::error::TransportError;
use modelgate::logging::RequestLogger;
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Shared application state passed to all handlers via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub policies: Arc<GatewayPolicies>,
    /// Client shared by all transports. `None` builds one per request.
    pub client: Option<reqwest::Client>,
    /// Cancelled on shutdown; every open stream relay observes a child token.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Arc<GatewayConfig>) -> Self {
        let policies = Arc::new(GatewayPolicies::from_config(&config));
        Self {
            config,
            policies,
            client: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    fn logger(&self) -> RequestLogger {
        RequestLogger::from_server(&self.config.server)
    }

    fn transport(&self, model: ResolvedModel) -> Result<ProviderTransport, ApiError> {
        let transport = match &self.client {
            Some(client) => {
                ProviderTransport::with_client(model, self.policies.clone(), client.clone())
            }
            None => ProviderTransport::new(model, self.policies.clone())?,
        };
        Ok(transport.with_logger(self.logger()))
    }

    fn resolve(&self, name: &str) -> Result<ResolvedModel, ApiError> {
        self.config
            .resolve(name)
            .ok_or_else(|| ApiError::not_found(format!("Model '{name}' not found")))
    }
}

// ── Errors ──────────────────────────────────────────────────────────

/// Body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub message: String,
    pub status_code: u16,
}

/// A failed request, rendered as [`ErrorResponse`].
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid_request", message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "upstream_error", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }
}

impl From<TransportError> for ApiError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Network { .. } => ApiError::upstream(err.to_string()),
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorDetail {
                kind: self.kind,
                message: self.message,
                status_code: self.status.as_u16(),
            },
        };
        (self.status, Json(body)).into_response()
    }
}

// ── Request shape checks ────────────────────────────────────────────

/// Drop top-level `null` fields so unset options are not forwarded.
fn strip_nulls(body: Value) -> Value {
    match body {
        Value::Object(mut map) => {
            map.retain(|_, v| !v.is_null());
            Value::Object(map)
        }
        other => other,
    }
}

fn require_object(body: &Value) -> Result<(), ApiError> {
    if body.is_object() {
        Ok(())
    } else {
        Err(ApiError::unprocessable("request body must be a JSON object"))
    }
}

fn require_model(body: &Value) -> Result<String, ApiError> {
    body.get("model")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ApiError::unprocessable("field 'model' is required and must be a string"))
}

fn require_messages(body: &Value) -> Result<(), ApiError> {
    match body.get("messages").and_then(Value::as_array) {
        Some(messages) if !messages.is_empty() => Ok(()),
        _ => Err(ApiError::unprocessable(
            "field 'messages' is required and must be a non-empty array",
        )),
    }
}

fn require_prompt(body: &Value) -> Result<(), ApiError> {
    match body.get("prompt") {
        Some(Value::String(_) | Value::Array(_)) => Ok(()),
        _ => Err(ApiError::unprocessable(
            "field 'prompt' is required and must be a string or array",
        )),
    }
}

fn require_max_tokens(body: &Value) -> Result<(), ApiError> {
    match body.get("max_tokens").and_then(Value::as_u64) {
        Some(n) if n >= 1 => Ok(()),
        _ => Err(ApiError::unprocessable(
            "field 'max_tokens' is required and must be an integer >= 1",
        )),
    }
}

fn wants_stream(body: &Value) -> bool {
    body.get("stream").and_then(Value::as_bool).unwrap_or(false)
}

// ── Handlers ────────────────────────────────────────────────────────

/// GET /health: liveness plus the configured model names.
pub async fn health(State(app): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "modelgate",
        "version": env!("CARGO_PKG_VERSION"),
        "models": app.config.model_names(),
    }))
}

/// POST /v1/chat/completions: OpenAI-style chat completion.
///
/// Models whose provider is `ollama` are sent to Ollama's native chat path.
pub async fn chat_completions(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    require_object(&body)?;
    let body = strip_nulls(body);
    let name = require_model(&body)?;
    require_messages(&body)?;

    let model = app.resolve(&name)?;
    let operation = if provider::is_ollama(&model.provider) {
        Operation::OllamaChat
    } else {
        Operation::ChatCompletion
    };
    forward(&app, model, operation, &headers, body).await
}

/// POST /v1/completions: OpenAI-style text completion.
pub async fn completions(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    require_object(&body)?;
    let body = strip_nulls(body);
    let name = require_model(&body)?;
    require_prompt(&body)?;

    let model = app.resolve(&name)?;
    let operation = if provider::is_ollama(&model.provider) {
        Operation::OllamaGenerate
    } else {
        Operation::Completion
    };
    forward(&app, model, operation, &headers, body).await
}

/// POST /v1/messages: Anthropic-style message creation.
///
/// Returns 400 when the model is not served by an Anthropic provider.
pub async fn messages(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    require_object(&body)?;
    let body = strip_nulls(body);
    let name = require_model(&body)?;
    require_messages(&body)?;
    require_max_tokens(&body)?;

    let model = app.resolve(&name)?;
    if !provider::is_anthropic(&model.provider) {
        return Err(ApiError::bad_request(format!(
            "Model '{name}' is not an Anthropic model (provider: {})",
            model.provider
        )));
    }
    forward(&app, model, Operation::Messages, &headers, body).await
}

async fn forward(
    app: &AppState,
    model: ResolvedModel,
    operation: Operation,
    headers: &HeaderMap,
    body: Value,
) -> Result<Response, ApiError> {
    let stream = wants_stream(&body);
    info!(
        model = %model.name,
        provider = %model.provider,
        operation = operation.name(),
        stream,
        "forwarding request"
    );

    let transport = app.transport(model)?;
    match transport
        .send_with_headers(operation, &body, stream, headers)
        .await
    {
        Ok(Reply::Complete(response)) => {
            debug!(status = response.status, "upstream replied");
            let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
            Ok((status, Json(response.body)).into_response())
        }
        Ok(Reply::Stream(upstream)) => {
            sse_response(upstream.into_relay(Some(app.shutdown.child_token())))
        }
        Err(err) => {
            let context = if stream { "streaming request" } else { "request" };
            app.logger().log_error(&err, context);
            Err(err.into())
        }
    }
}

/// Wrap relay frames in a `text/event-stream` response. Dropping the body
/// (client disconnect) drops the relay and releases the upstream connection.
fn sse_response<S>(frames: S) -> Result<Response, ApiError>
where
    S: Stream<Item = String> + Send + 'static,
{
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .header(CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(frames.map(Ok::<_, Infallible>)))
        .map_err(|e| ApiError::internal(format!("failed to build streaming response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nulls_are_stripped_at_top_level() {
        let body = strip_nulls(json!({"model": "m", "temperature": null, "meta": {"x": null}}));
        assert_eq!(body, json!({"model": "m", "meta": {"x": null}}));
    }

    #[test]
    fn shape_checks() {
        assert!(require_model(&json!({"model": "m"})).is_ok());
        assert!(require_model(&json!({"model": 1})).is_err());
        assert!(require_messages(&json!({"messages": []})).is_err());
        assert!(require_messages(&json!({"messages": [{"role": "user"}]})).is_ok());
        assert!(require_prompt(&json!({"prompt": ["a", "b"]})).is_ok());
        assert!(require_prompt(&json!({})).is_err());
        assert!(require_max_tokens(&json!({"max_tokens": 0})).is_err());
        assert!(require_max_tokens(&json!({"max_tokens": 1.5})).is_err());
        assert!(require_max_tokens(&json!({"max_tokens": 64})).is_ok());
    }

    #[test]
    fn stream_flag_defaults_to_false() {
        assert!(!wants_stream(&json!({})));
        assert!(wants_stream(&json!({"stream": true})));
    }

    #[test]
    fn error_body_shape() {
        let body = ErrorResponse {
            error: ErrorDetail {
                kind: "not_found",
                message: "Model 'x' not found".into(),
                status_code: 404,
            },
        };
        assert_eq!(
            serde_json::to_value(body).unwrap(),
            json!({"error": {"type": "not_found", "message": "Model 'x' not found", "status_code": 404}})
        );
    }
}
