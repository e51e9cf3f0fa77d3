//! Provider transport: one upstream call per inbound request.
//!
//! The transport builds the outgoing headers (base headers, credentials, then
//! the shared [`HeaderPolicy`](crate::rewrite::HeaderPolicy)), rewrites the
//! body (model substitution, then the shared
//! [`TransformPipeline`](crate::rewrite::TransformPipeline)), and sends it
//! through [`execute_with_retry`]. Streaming calls retry only the connection
//! attempt; once a success status is in hand the body is handed to the
//! [`relay`](super::streaming::relay) untouched.

use std::sync::Arc;

use futures::Stream;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::provider::{self, Operation};
use super::retry::execute_with_retry;
use super::streaming::{self, ConnectionLease};
use crate::config::{GatewayPolicies, ResolvedModel};
use crate::error::TransportError;
use crate::logging::RequestLogger;

/// A buffered upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    /// Parsed JSON body, or the raw text as a JSON string if it did not parse.
    pub body: Value,
}

/// An open upstream stream with a success status, not yet read.
#[derive(Debug)]
pub struct UpstreamStream {
    pub status: u16,
    pub headers: HeaderMap,
    model: String,
    response: reqwest::Response,
}

impl UpstreamStream {
    /// Relay the body as SSE text frames. The connection is released when the
    /// returned stream ends or is dropped.
    pub fn into_relay(
        self,
        cancel: Option<CancellationToken>,
    ) -> impl Stream<Item = String> + Send + 'static {
        let model = self.model;
        let lease = ConnectionLease::new(move || {
            debug!(model = %model, "upstream stream connection released");
        });
        streaming::relay(self.response.bytes_stream(), lease, cancel)
    }
}

/// Outcome of [`ProviderTransport::send`].
#[derive(Debug)]
pub enum Reply {
    /// A buffered response: either a non-streaming call, or a streaming call
    /// the upstream answered with a non-success status.
    Complete(UpstreamResponse),
    Stream(UpstreamStream),
}

/// Sends requests for one resolved model.
pub struct ProviderTransport {
    model: ResolvedModel,
    policies: Arc<GatewayPolicies>,
    client: reqwest::Client,
    logger: RequestLogger,
}

impl ProviderTransport {
    /// Create a transport with its own HTTP client.
    pub fn new(model: ResolvedModel, policies: Arc<GatewayPolicies>) -> Result<Self, TransportError> {
        let client = Self::build_client(&model)?;
        Ok(Self::with_client(model, policies, client))
    }

    /// Create a transport around an externally owned client.
    pub fn with_client(
        model: ResolvedModel,
        policies: Arc<GatewayPolicies>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            model,
            policies,
            client,
            logger: RequestLogger::default(),
        }
    }

    pub fn with_logger(mut self, logger: RequestLogger) -> Self {
        self.logger = logger;
        self
    }

    /// An HTTP client honouring the model's timeouts and TLS setting.
    pub fn build_client(model: &ResolvedModel) -> Result<reqwest::Client, TransportError> {
        reqwest::Client::builder()
            .connect_timeout(model.connect_timeout)
            .read_timeout(model.read_timeout)
            .danger_accept_invalid_certs(!model.ssl_verify)
            .build()
            .map_err(TransportError::Client)
    }

    pub fn model(&self) -> &ResolvedModel {
        &self.model
    }

    pub fn url_for(&self, operation: Operation) -> String {
        provider::join_url(&self.model.endpoint, operation.path())
    }

    /// Outgoing headers: client extras (stripped), base headers, credentials,
    /// then the header policy.
    pub fn prepare_headers(&self, extra: &HeaderMap) -> Result<HeaderMap, TransportError> {
        let mut headers = provider::strip_inbound(extra);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(api_key) = &self.model.api_key {
            provider::attach_credentials(&mut headers, &self.model.provider, api_key)?;
        }
        Ok(self.policies.headers.process(&headers))
    }

    /// Outgoing body: model substitution, then the transform pipeline.
    pub fn prepare_body(&self, body: &Value) -> Value {
        match (&self.model.actual_model_name, body) {
            (Some(actual), Value::Object(map)) => {
                let mut map = map.clone();
                debug!(from = %self.model.name, to = %actual, "substituting upstream model");
                map.insert("model".to_string(), Value::String(actual.clone()));
                self.policies.transforms.apply(&Value::Object(map))
            }
            _ => self.policies.transforms.apply(body),
        }
    }

    pub async fn send(
        &self,
        operation: Operation,
        body: &Value,
        stream: bool,
    ) -> Result<Reply, TransportError> {
        self.send_with_headers(operation, body, stream, &HeaderMap::new())
            .await
    }

    /// Send `body` to the operation's path, forwarding `extra` client headers.
    pub async fn send_with_headers(
        &self,
        operation: Operation,
        body: &Value,
        stream: bool,
        extra: &HeaderMap,
    ) -> Result<Reply, TransportError> {
        let url = self.url_for(operation);
        let headers = self.prepare_headers(extra)?;
        let body = self.prepare_body(body);
        let payload = serde_json::to_vec(&body)?;

        debug!(
            model = %self.model.name,
            provider = %self.model.provider,
            operation = operation.name(),
            stream,
            "sending upstream request"
        );
        self.logger.log_request("POST", &url, &headers, &body);

        let response = execute_with_retry(&self.model.retry, operation.name(), || {
            let request = self
                .client
                .post(&url)
                .headers(headers.clone())
                .body(payload.clone());
            let url = url.clone();
            async move {
                request
                    .send()
                    .await
                    .map_err(|source| TransportError::Network { url, source })
            }
        })
        .await?;

        let status = response.status();
        let response_headers = response.headers().clone();

        if stream && status.is_success() {
            self.logger.log_response(status.as_u16(), &response_headers, None);
            return Ok(Reply::Stream(UpstreamStream {
                status: status.as_u16(),
                headers: response_headers,
                model: self.model.name.clone(),
                response,
            }));
        }

        let raw = response
            .bytes()
            .await
            .map_err(|source| TransportError::Network {
                url: url.clone(),
                source,
            })?;
        let body = match serde_json::from_slice::<Value>(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(status = status.as_u16(), url = %url, "upstream body is not JSON: {e}");
                Value::String(String::from_utf8_lossy(&raw).into_owned())
            }
        };
        self.logger
            .log_response(status.as_u16(), &response_headers, Some(&body));

        Ok(Reply::Complete(UpstreamResponse {
            status: status.as_u16(),
            headers: response_headers,
            body,
        }))
    }
}
