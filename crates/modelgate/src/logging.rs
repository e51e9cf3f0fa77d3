//! Outgoing request and incoming response logging with secret masking.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use reqwest::header::HeaderMap;
use serde_json::Value;
use tracing::{error, info};

use crate::config::ServerConfig;

/// Header names whose values are always masked.
const SENSITIVE_HEADERS: &[&str] = &["authorization", "x-api-key", "api-key", "apikey"];

static API_KEY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"sk-ant-[a-zA-Z0-9-]{20,}|sk-[a-zA-Z0-9]{20,}").expect("valid API key regex")
});

/// Show the first 8 and last 4 characters of a long secret, `***` otherwise.
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 12 {
        return "***".to_string();
    }
    let head: String = chars.iter().take(8).collect();
    let tail: String = chars.iter().skip(chars.len() - 4).collect();
    format!("{head}...{tail}")
}

/// Mask every API-key-shaped substring in `text`.
pub fn mask_text(text: &str) -> String {
    API_KEY_PATTERN
        .replace_all(text, |caps: &Captures<'_>| mask_secret(&caps[0]))
        .into_owned()
}

/// Logs traffic to and from upstream providers, according to server settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestLogger {
    pub log_requests: bool,
    pub log_responses: bool,
    pub mask_api_keys: bool,
}

impl RequestLogger {
    pub fn from_server(server: &ServerConfig) -> Self {
        Self {
            log_requests: server.log_requests,
            log_responses: server.log_responses,
            mask_api_keys: server.mask_api_keys,
        }
    }

    /// Render headers as `name: value` pairs, masking secrets when enabled.
    pub fn render_headers(&self, headers: &HeaderMap) -> Vec<String> {
        headers
            .iter()
            .map(|(name, value)| {
                let raw = String::from_utf8_lossy(value.as_bytes());
                let shown = if self.mask_api_keys && SENSITIVE_HEADERS.contains(&name.as_str()) {
                    mask_secret(&raw)
                } else {
                    raw.into_owned()
                };
                format!("{name}: {shown}")
            })
            .collect()
    }

    fn render_body(&self, body: &Value) -> String {
        let text = body.to_string();
        if self.mask_api_keys {
            mask_text(&text)
        } else {
            text
        }
    }

    pub fn log_request(&self, method: &str, url: &str, headers: &HeaderMap, body: &Value) {
        if !self.log_requests {
            return;
        }
        info!(
            method,
            url,
            headers = ?self.render_headers(headers),
            body = %self.render_body(body),
            "outgoing request"
        );
    }

    pub fn log_response(&self, status: u16, headers: &HeaderMap, body: Option<&Value>) {
        if !self.log_responses {
            return;
        }
        let body = body.map(|b| self.render_body(b));
        info!(
            status,
            headers = ?self.render_headers(headers),
            body = body.as_deref().unwrap_or("<stream>"),
            "incoming response"
        );
    }

    pub fn log_error(&self, err: &dyn std::error::Error, context: &str) {
        let message = err.to_string();
        let message = if self.mask_api_keys {
            mask_text(&message)
        } else {
            message
        };
        error!(context, "error in {context}: {message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn short_secrets_are_fully_hidden() {
        assert_eq!(mask_secret("short"), "***");
        assert_eq!(mask_secret("exactly12chr"), "***");
    }

    #[test]
    fn long_secrets_keep_head_and_tail() {
        assert_eq!(mask_secret("Bearer sk-1234567890abcdef"), "Bearer s...cdef");
    }

    #[test]
    fn api_keys_in_text_are_masked() {
        let text = r#"{"key":"sk-abcdefghijklmnopqrstuvwxyz","other":"sk-ant-REDACTED"}"#;
        let masked = mask_text(text);
        assert!(masked.contains("sk-abcde...wxyz"));
        assert!(masked.contains("sk-ant-a...qrst"));
        assert!(!masked.contains("klmnop"));
    }

    #[test]
    fn short_sk_strings_are_not_keys() {
        assert_eq!(mask_text("sk-short"), "sk-short");
    }

    #[test]
    fn sensitive_headers_masked_only_when_enabled() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-ant-0123456789abcdef"));
        headers.insert("accept", HeaderValue::from_static("application/json"));

        let masking = RequestLogger {
            mask_api_keys: true,
            ..Default::default()
        };
        let rendered = masking.render_headers(&headers);
        assert!(rendered.contains(&"x-api-key: sk-ant-0...cdef".to_string()));
        assert!(rendered.contains(&"accept: application/json".to_string()));

        let plain = RequestLogger::default();
        assert!(
            plain
                .render_headers(&headers)
                .contains(&"x-api-key: sk-ant-0123456789abcdef".to_string())
        );
    }
}
