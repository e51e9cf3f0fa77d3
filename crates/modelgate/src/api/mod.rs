//! Upstream interaction: retry, provider conventions, transport, and streaming.
//!
//! - [`retry`]: backoff loop around one network attempt. Retries network
//!   failures and configured status codes; returns the last response when
//!   retries run out.
//! - [`provider`]: upstream path per [`Operation`] and credential headers.
//! - [`transport`]: [`ProviderTransport`], one buffered or streamed call per
//!   request.
//! - [`streaming`]: SSE relay with a scoped [`ConnectionLease`].

pub mod provider;
pub mod retry;
pub mod streaming;
pub mod transport;

pub use provider::Operation;
pub use retry::{RetryPolicy, execute_with_retry};
pub use streaming::{ConnectionLease, SseFrame, relay};
pub use transport::{ProviderTransport, Reply, UpstreamResponse, UpstreamStream};
