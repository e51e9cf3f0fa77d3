//! Error types for configuration loading, upstream transport, and body
//! rewriting.

use std::path::PathBuf;

use thiserror::Error;

use crate::api::retry::RetryableError;

/// Failures while loading or validating the gateway configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to read configuration file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_saphyr::Error),

    #[error("{field} must be {constraint}, got {value}")]
    OutOfRange {
        field: &'static str,
        constraint: &'static str,
        value: String,
    },

    #[error("environment variable {name} has an invalid value '{value}'")]
    InvalidEnv { name: String, value: String },
}

/// Failures while talking to an upstream provider.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("failed to serialize request body: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("configured credential is not a valid header value")]
    InvalidCredential,
}

impl RetryableError for TransportError {
    fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

/// Why a single rewrite stage could not produce a new body.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("invalid regex pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("rewritten body is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("rewritten body is not a JSON object")]
    NotAnObject,

    #[error("invalid JSON path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("cannot descend into '{segment}': existing value is not an object")]
    BlockedPath { segment: String },
}
