//! Gateway configuration.
//!
//! The configuration is a YAML file loaded once at startup, then patched with
//! environment overrides, validated, and frozen. Nothing mutates it afterwards;
//! request handlers share it through an `Arc`. JSON is valid YAML, so a JSON
//! document loads as well.
//!
//! ```yaml
//! server:
//!   port: 8000
//!   mask_api_keys: true
//! models:
//!   claude:
//!     provider: anthropic
//!     endpoint: https://api.anthropic.com
//! header_rules:
//!   drop_headers: ["x-stainless-.*"]
//! transformations:
//!   - name: strip-user
//!     type: jsonpath_drop
//!     path: $.user
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::api::retry::RetryPolicy;
use crate::error::ConfigError;
use crate::rewrite::headers::{HeaderPolicy, HeaderRules};
use crate::rewrite::transform::{TransformPipeline, TransformRule};

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "MODELGATE_";

// ── Server ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Log outgoing upstream requests (method, URL, headers, body).
    pub log_requests: bool,
    /// Log upstream responses (status, headers, body).
    pub log_responses: bool,
    /// Mask credentials in logged headers and bodies.
    pub mask_api_keys: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            log_requests: false,
            log_responses: false,
            mask_api_keys: true,
        }
    }
}

// ── Models ──────────────────────────────────────────────────────────

/// One named upstream model as written in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// `openai`, `anthropic`, `ollama`, or any OpenAI-compatible provider name.
    pub provider: String,
    /// Base URL of the provider.
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Read timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    /// Connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,
    #[serde(default = "default_ssl_verify")]
    pub ssl_verify: bool,
    /// Overrides `default_retry_config` for this model.
    #[serde(default)]
    pub retry_config: Option<RetryPolicy>,
    /// Model name sent upstream in place of the configured key.
    #[serde(default)]
    pub actual_model_name: Option<String>,
}

fn default_timeout() -> f64 {
    60.0
}
fn default_connect_timeout() -> f64 {
    10.0
}
fn default_ssl_verify() -> bool {
    true
}

impl ModelConfig {
    /// A model with default timeouts and no credential.
    pub fn new(provider: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            endpoint: endpoint.into(),
            api_key: None,
            timeout: default_timeout(),
            connect_timeout: default_connect_timeout(),
            ssl_verify: default_ssl_verify(),
            retry_config: None,
            actual_model_name: None,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_seconds("timeout", self.timeout)?;
        check_seconds("connect_timeout", self.connect_timeout)?;
        if let Some(retry) = &self.retry_config {
            retry.validate()?;
        }
        Ok(())
    }
}

fn check_seconds(field: &'static str, secs: f64) -> Result<(), ConfigError> {
    if secs.is_finite() && secs >= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            constraint: ">= 1 second",
            value: secs.to_string(),
        })
    }
}

fn seconds_or(secs: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or_else(|_| Duration::from_secs_f64(fallback))
}

/// Everything the transport needs to call one model, fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedModel {
    /// Externally visible model name.
    pub name: String,
    pub provider: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
    pub ssl_verify: bool,
    pub retry: RetryPolicy,
    pub actual_model_name: Option<String>,
}

impl ResolvedModel {
    /// Resolve with the default retry policy. Mostly useful in tests.
    pub fn new(name: impl Into<String>, model: &ModelConfig) -> Self {
        Self::with_retry(name, model, &RetryPolicy::default())
    }

    fn with_retry(name: impl Into<String>, model: &ModelConfig, default_retry: &RetryPolicy) -> Self {
        Self {
            name: name.into(),
            provider: model.provider.clone(),
            endpoint: model.endpoint.clone(),
            api_key: model.api_key.clone(),
            read_timeout: seconds_or(model.timeout, default_timeout()),
            connect_timeout: seconds_or(model.connect_timeout, default_connect_timeout()),
            ssl_verify: model.ssl_verify,
            retry: model
                .retry_config
                .clone()
                .unwrap_or_else(|| default_retry.clone()),
            actual_model_name: model.actual_model_name.clone(),
        }
    }

    /// The model name to send upstream.
    pub fn upstream_model(&self) -> &str {
        self.actual_model_name.as_deref().unwrap_or(&self.name)
    }
}

// ── Gateway ─────────────────────────────────────────────────────────

/// The complete, immutable configuration snapshot.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub models: BTreeMap<String, ModelConfig>,
    pub header_rules: HeaderRules,
    /// Applied in list order.
    pub transformations: Vec<TransformRule>,
    pub default_retry_config: RetryPolicy,
}

impl GatewayConfig {
    /// Load from `path`, apply process environment overrides, and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml_str(&text)?;
        config.apply_env_overrides_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        info!(
            path = %path.display(),
            models = config.models.len(),
            transformations = config.transformations.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Parse a configuration document without touching the environment.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_saphyr::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default_retry_config.validate()?;
        for model in self.models.values() {
            model.validate()?;
        }
        Ok(())
    }

    /// Apply overrides looked up through `lookup`:
    ///
    /// - `MODELGATE_MODEL_<NAME>_API_KEY` sets a model's key (`<NAME>` is the
    ///   model name upper-cased with `-` and `.` turned into `_`).
    /// - `MODELGATE_SERVER_HOST` and `MODELGATE_SERVER_PORT`.
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        for (name, model) in self.models.iter_mut() {
            let key = format!("{ENV_PREFIX}MODEL_{}_API_KEY", env_fragment(name));
            if let Some(api_key) = lookup(&key) {
                debug!(model = %name, "api key set from {key}");
                model.api_key = Some(api_key);
            }
        }

        if let Some(host) = lookup(&format!("{ENV_PREFIX}SERVER_HOST")) {
            self.server.host = host;
        }

        let port_key = format!("{ENV_PREFIX}SERVER_PORT");
        if let Some(port) = lookup(&port_key) {
            self.server.port = port.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                name: port_key.clone(),
                value: port.clone(),
            })?;
        }
        Ok(())
    }

    /// Resolve a model by its externally visible name.
    pub fn resolve(&self, name: &str) -> Option<ResolvedModel> {
        self.models
            .get(name)
            .map(|model| ResolvedModel::with_retry(name, model, &self.default_retry_config))
    }

    pub fn model_names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }
}

fn env_fragment(model_name: &str) -> String {
    model_name
        .chars()
        .map(|c| match c {
            '-' | '.' => '_',
            other => other.to_ascii_uppercase(),
        })
        .collect()
}

/// Compiled header and body policies shared by every request.
#[derive(Debug)]
pub struct GatewayPolicies {
    pub headers: HeaderPolicy,
    pub transforms: TransformPipeline,
}

impl GatewayPolicies {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            headers: HeaderPolicy::new(&config.header_rules),
            transforms: TransformPipeline::new(&config.transformations),
        }
    }
}

impl Default for GatewayPolicies {
    fn default() -> Self {
        Self {
            headers: HeaderPolicy::default(),
            transforms: TransformPipeline::empty(),
        }
    }
}
