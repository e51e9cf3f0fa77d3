//! Request execution core of an LLM protocol gateway.
//!
//! `modelgate` forwards OpenAI-style and Anthropic-style requests to a
//! configured upstream provider. For each request it rewrites headers and
//! body in flight, sends the call with retry and backoff, and relays the
//! answer back either buffered or as a Server-Sent Events stream.
//!
//! # Getting started
//!
//! ```ignore
//! use std::sync::Arc;
//! use modelgate::prelude::*;
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::load("config.yaml")?;
//! let policies = Arc::new(GatewayPolicies::from_config(&config));
//!
//! let model = config.resolve("gpt-4o").ok_or("unknown model")?;
//! let transport = ProviderTransport::new(model, policies)?;
//!
//! let body = json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]});
//! match transport.send(Operation::ChatCompletion, &body, false).await? {
//!     Reply::Complete(response) => println!("{} {}", response.status, response.body),
//!     Reply::Stream(_) => unreachable!("not a streaming call"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Where to find things
//!
//! - **Retry and backoff:** [`RetryPolicy`](api::retry::RetryPolicy) and
//!   [`execute_with_retry`](api::retry::execute_with_retry).
//! - **Header rewriting:** [`HeaderPolicy`](rewrite::HeaderPolicy), compiled
//!   from [`HeaderRules`](rewrite::HeaderRules).
//! - **Body rewriting:** [`TransformPipeline`](rewrite::TransformPipeline)
//!   over ordered [`TransformRule`](rewrite::TransformRule)s.
//! - **Sending a call:** [`ProviderTransport`](api::transport::ProviderTransport).
//! - **Streaming:** [`relay`](api::streaming::relay) and
//!   [`ConnectionLease`](api::streaming::ConnectionLease).
//! - **Configuration:** [`GatewayConfig`](config::GatewayConfig).
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`api`] | Retry, provider table, transport, SSE relay |
//! | [`rewrite`] | Header policy, JSON path, transform pipeline |
//! | [`config`] | Configuration snapshot and environment overrides |
//! | [`logging`] | Request/response logging with secret masking |
//! | [`error`] | Error types |

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod rewrite;
