//! Convenience re-exports for embedding the gateway core.
//!
//! ```ignore
//! use modelgate::prelude::*;
//! ```

pub use crate::api::provider::Operation;
pub use crate::api::retry::{RetryPolicy, RetryableError, StatusCarrier, execute_with_retry};
pub use crate::api::streaming::{ConnectionLease, SseFrame, relay};
pub use crate::api::transport::{ProviderTransport, Reply, UpstreamResponse, UpstreamStream};
pub use crate::config::{GatewayConfig, GatewayPolicies, ModelConfig, ResolvedModel, ServerConfig};
pub use crate::error::{ConfigError, TransformError, TransportError};
pub use crate::logging::RequestLogger;
pub use crate::rewrite::{HeaderPolicy, HeaderRules, TransformPipeline, TransformRule};
