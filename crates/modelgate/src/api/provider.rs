//! Provider conventions: upstream paths per operation and credential headers.

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};

use crate::error::TransportError;

/// Protocol version sent to Anthropic-style providers.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Header carrying the Anthropic protocol version.
pub const ANTHROPIC_VERSION_HEADER: &str = "anthropic-version";

/// Header carrying an Anthropic-style API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Headers never forwarded from the inbound request. Hop-by-hop headers are
/// connection-scoped; the rest are recomputed or replaced for the upstream.
pub const STRIPPED_INBOUND_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
    "accept-encoding",
    "authorization",
    "x-api-key",
];

/// An upstream call, which fixes the path it is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// OpenAI-style chat completion.
    ChatCompletion,
    /// OpenAI-style legacy text completion.
    Completion,
    /// Anthropic-style message creation.
    Messages,
    /// Ollama native chat.
    OllamaChat,
    /// Ollama native generate.
    OllamaGenerate,
}

impl Operation {
    pub fn path(self) -> &'static str {
        match self {
            Operation::ChatCompletion => "/v1/chat/completions",
            Operation::Completion => "/v1/completions",
            Operation::Messages => "/v1/messages",
            Operation::OllamaChat => "/api/chat",
            Operation::OllamaGenerate => "/api/generate",
        }
    }

    /// Name used in log lines and retry diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Operation::ChatCompletion => "chat completion",
            Operation::Completion => "completion",
            Operation::Messages => "message creation",
            Operation::OllamaChat => "ollama chat",
            Operation::OllamaGenerate => "ollama generate",
        }
    }
}

pub fn is_anthropic(provider: &str) -> bool {
    provider.to_ascii_lowercase().contains("anthropic")
}

pub fn is_ollama(provider: &str) -> bool {
    provider.eq_ignore_ascii_case("ollama")
}

/// Join an endpoint and a path with exactly one `/` between them.
pub fn join_url(endpoint: &str, path: &str) -> String {
    format!(
        "{}/{}",
        endpoint.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Remove headers that must not reach the upstream from a client-supplied map.
pub fn strip_inbound(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in STRIPPED_INBOUND_HEADERS {
        out.remove(*name);
    }
    out
}

/// Attach the provider's credential headers, replacing any already present.
pub fn attach_credentials(
    headers: &mut HeaderMap,
    provider: &str,
    api_key: &str,
) -> Result<(), TransportError> {
    if is_anthropic(provider) {
        let mut key =
            HeaderValue::from_str(api_key).map_err(|_| TransportError::InvalidCredential)?;
        key.set_sensitive(true);
        headers.insert(HeaderName::from_static(API_KEY_HEADER), key);
        headers.insert(
            HeaderName::from_static(ANTHROPIC_VERSION_HEADER),
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
    } else {
        let mut bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| TransportError::InvalidCredential)?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);
    }
    Ok(())
}
