//! Automatic retry with exponential backoff.
//!
//! Retries network-level failures (connect, timeout, transport) and responses
//! whose status is in the policy's retryable set (by default 429, 500, 502,
//! 503, 504). Anything else is handed back on the first attempt. When retries
//! run out on a response, that last response is returned, not turned into an
//! error: the caller sees the upstream's final answer.

use std::collections::BTreeSet;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::{error, warn};

use crate::error::ConfigError;

/// Status codes retried when a policy does not list its own.
pub const DEFAULT_RETRY_STATUS_CODES: [u16; 5] = [429, 500, 502, 503, 504];

/// Retry behaviour for one model.
///
/// Built once from configuration and shared read-only by every request
/// routed to that model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RetrySettings")]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = a single attempt).
    pub max_retries: u32,
    /// Upstream status codes that trigger another attempt.
    pub retry_status_codes: BTreeSet<u16>,
    /// Backoff multiplier, at least 1.0.
    pub backoff_factor: f64,
    /// Delay before the first retry, at least 100ms.
    pub initial_delay: Duration,
    /// Upper bound on any single delay, at least 1s.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_status_codes: DEFAULT_RETRY_STATUS_CODES.into_iter().collect(),
            backoff_factor: 2.0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given number of retries and default timing.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    /// Delay to sleep after a failed attempt (0-indexed).
    ///
    /// `min(initial_delay * backoff_factor^attempt, max_delay)`, with no jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Whether an upstream status code should be retried.
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retry_status_codes.contains(&status)
    }

    /// Check the policy's bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_factor.is_nan() || self.backoff_factor < 1.0 {
            return Err(ConfigError::OutOfRange {
                field: "backoff_factor",
                constraint: ">= 1.0",
                value: self.backoff_factor.to_string(),
            });
        }
        if self.initial_delay < Duration::from_millis(100) {
            return Err(ConfigError::OutOfRange {
                field: "initial_delay",
                constraint: ">= 0.1s",
                value: format!("{:?}", self.initial_delay),
            });
        }
        if self.max_delay < Duration::from_secs(1) {
            return Err(ConfigError::OutOfRange {
                field: "max_delay",
                constraint: ">= 1.0s",
                value: format!("{:?}", self.max_delay),
            });
        }
        Ok(())
    }
}

/// On-disk shape of a retry policy. Delays are in seconds.
#[derive(Debug, Deserialize)]
struct RetrySettings {
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    #[serde(default = "default_retry_status_codes")]
    retry_status_codes: Vec<u16>,
    #[serde(default = "default_backoff_factor")]
    backoff_factor: f64,
    #[serde(default = "default_initial_delay")]
    initial_delay: f64,
    #[serde(default = "default_max_delay")]
    max_delay: f64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_status_codes() -> Vec<u16> {
    DEFAULT_RETRY_STATUS_CODES.to_vec()
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_initial_delay() -> f64 {
    1.0
}
fn default_max_delay() -> f64 {
    60.0
}

fn seconds(field: &'static str, constraint: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::OutOfRange {
        field,
        constraint,
        value: secs.to_string(),
    })
}

impl TryFrom<RetrySettings> for RetryPolicy {
    type Error = ConfigError;

    fn try_from(raw: RetrySettings) -> Result<Self, Self::Error> {
        let policy = RetryPolicy {
            max_retries: raw.max_retries,
            retry_status_codes: raw.retry_status_codes.into_iter().collect(),
            backoff_factor: raw.backoff_factor,
            initial_delay: seconds("initial_delay", ">= 0.1s", raw.initial_delay)?,
            max_delay: seconds("max_delay", ">= 1.0s", raw.max_delay)?,
        };
        policy.validate()?;
        Ok(policy)
    }
}

/// A response-like value that carries an HTTP status code.
pub trait StatusCarrier {
    fn status_code(&self) -> u16;
}

/// An error that knows whether it is a transient, network-level failure.
pub trait RetryableError {
    fn is_retryable(&self) -> bool;
}

impl StatusCarrier for reqwest::Response {
    fn status_code(&self) -> u16 {
        self.status().as_u16()
    }
}

impl RetryableError for reqwest::Error {
    fn is_retryable(&self) -> bool {
        self.is_connect() || self.is_timeout() || self.is_request()
    }
}

/// Run `attempt` until it yields a non-retryable outcome or the policy's
/// retries are used up.
///
/// - Non-retryable errors propagate immediately.
/// - Retryable errors are retried, and the last one is returned on exhaustion.
/// - Responses with a status outside the retry set return immediately.
/// - Responses with a retryable status are retried, and the last one is
///   returned as `Ok` on exhaustion.
pub async fn execute_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut attempt: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    T: StatusCarrier,
    E: RetryableError + Display,
{
    let mut attempt_no: u32 = 0;
    loop {
        match attempt().await {
            Ok(response) => {
                let status = response.status_code();
                if !policy.is_retryable_status(status) {
                    return Ok(response);
                }
                if attempt_no >= policy.max_retries {
                    error!(
                        operation,
                        status,
                        retries = policy.max_retries,
                        "retries exhausted, returning last response"
                    );
                    return Ok(response);
                }
                let delay = policy.delay_for_attempt(attempt_no);
                warn!(
                    operation,
                    status,
                    delay_ms = delay.as_millis() as u64,
                    "{operation} returned {status}, retrying (attempt {}/{})",
                    attempt_no + 1,
                    policy.max_retries
                );
                // Release the connection before sleeping.
                drop(response);
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                if !err.is_retryable() {
                    return Err(err);
                }
                if attempt_no >= policy.max_retries {
                    error!(
                        operation,
                        retries = policy.max_retries,
                        "retries exhausted, last error: {err}"
                    );
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt_no);
                warn!(
                    operation,
                    delay_ms = delay.as_millis() as u64,
                    "{operation} failed: {err}, retrying (attempt {}/{})",
                    attempt_no + 1,
                    policy.max_retries
                );
                tokio::time::sleep(delay).await;
            }
        }
        attempt_no += 1;
    }
}
