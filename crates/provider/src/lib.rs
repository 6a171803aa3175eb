//! Credential provider interface for the host request pipeline
//!
//! The host calls `select_credential` once per outbound request to obtain a
//! bearer token, then `report_outcome` after the upstream call finishes. The
//! account pool implements this trait; the host never depends on how accounts
//! are stored, rotated, or refreshed.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Classification of an upstream failure reported by the host.
///
/// - RateLimited marks the active account and rotates away from it
/// - Unauthorized is recorded on the account; the refresh secret is kept
/// - Transient is recorded only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Network errors, 5xx, anything not attributable to the account
    Transient,
    /// Provider throttled the account (429, quota, resource exhausted)
    RateLimited,
    /// Access token rejected (401/403)
    Unauthorized,
}

/// Bearer credential handed to the host for one outbound request.
#[derive(Debug, Clone, Serialize)]
pub struct BearerCredential {
    /// Display label of the account that was selected
    pub account: String,
    /// Zero-based position of the account in the pool
    pub index: usize,
    pub access_token: String,
    /// Provider-specific fields the host must forward (e.g. `projectId`)
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Result of an outbound call as observed by the host pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure {
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        message: String,
    },
}

impl Outcome {
    /// Failure text used for classification: status code followed by the
    /// provider's error message. `None` for successful calls.
    pub fn failure_text(&self) -> Option<String> {
        match self {
            Outcome::Success => None,
            Outcome::Failure {
                status: Some(status),
                message,
            } => Some(format!("{status} {message}").trim_end().to_string()),
            Outcome::Failure {
                status: None,
                message,
            } => Some(message.clone()),
        }
    }
}

/// Health status reported by a provider for the /health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    /// Overall status: "healthy", "degraded", or "unhealthy"
    pub status: String,
    /// Provider-specific details (pool account counts)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<serde_json::Value>,
}

/// Errors surfaced to the host pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("internal provider error: {0}")]
    Internal(String),
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Source of bearer credentials for the host request pipeline.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn CredentialProvider>`).
pub trait CredentialProvider: Send + Sync {
    /// Identifier for logging and health reporting (e.g. "anthropic")
    fn id(&self) -> &str;

    /// Pick the account for the next outbound request and return a valid
    /// access token for it. `now` is unix milliseconds.
    fn select_credential(
        &self,
        now: u64,
    ) -> Pin<Box<dyn Future<Output = Result<BearerCredential>> + Send + '_>>;

    /// Feed the result of the last outbound call back into rotation state.
    fn report_outcome<'a>(
        &'a self,
        outcome: &'a Outcome,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Provider health for the /health endpoint.
    fn health(&self) -> Pin<Box<dyn Future<Output = ProviderHealth> + Send + '_>>;
}
