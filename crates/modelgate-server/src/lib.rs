//! OpenAI- and Anthropic-compatible HTTP front end for `modelgate`.
//!
//! The server resolves the requested model by name, checks the request
//! shape, and hands the call to a per-request
//! [`ProviderTransport`](modelgate::api::transport::ProviderTransport).
//! Streaming calls are answered with `text/event-stream`; a client that
//! disconnects drops the response body, which ends the relay and releases
//! the upstream connection.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use modelgate::config::GatewayConfig;
//!
//! let config = Arc::new(GatewayConfig::load("config.yaml")?);
//! let addr = modelgate_server::spawn_gateway(config, ([127, 0, 0, 1], 0).into()).await?;
//! println!("gateway: http://{addr}");
//! ```

mod api;
mod server;

pub use api::{ApiError, AppState, ErrorDetail, ErrorResponse};
pub use server::{build_router, serve, start_server};

use std::net::SocketAddr;
use std::sync::Arc;

use modelgate::config::GatewayConfig;

/// Spawn the gateway on a Tokio task and return the bound address.
///
/// The server runs until the Tokio runtime shuts down.
pub async fn spawn_gateway(
    config: Arc<GatewayConfig>,
    bind_addr: SocketAddr,
) -> std::io::Result<SocketAddr> {
    let router = build_router(AppState::new(config));
    start_server(router, bind_addr).await
}
