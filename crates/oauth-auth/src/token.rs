//! OAuth token refresh
//!
//! The only token endpoint interaction the pool needs: exchange a long-lived
//! refresh secret for a short-lived access token. `TokenRefresher` is the seam
//! the pool depends on; `HttpRefresher` is the production implementation that
//! POSTs a form-encoded refresh-token grant.

use std::future::Future;
use std::pin::Pin;

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Response from the token endpoint for a refresh grant.
///
/// `expires_in` is a delta in seconds from the response time. The caller
/// converts this to an absolute unix millisecond timestamp when caching it.
/// Providers that rotate refresh secrets return a new `refresh_token`; others
/// omit it and the existing secret stays valid.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
}

/// Exchanges refresh secrets for access tokens.
///
/// Uses `Pin<Box<dyn Future>>` so the pool can hold an `Arc<dyn TokenRefresher>`
/// and tests can substitute a scripted implementation.
pub trait TokenRefresher: Send + Sync {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenResponse>> + Send + 'a>>;
}

/// Token endpoint client for a single upstream provider.
pub struct HttpRefresher {
    client: reqwest::Client,
    endpoint: String,
    client_id: String,
    client_secret: Option<Secret<String>>,
}

impl HttpRefresher {
    pub fn new(client: reqwest::Client, endpoint: String, client_id: String) -> Self {
        Self {
            client,
            endpoint,
            client_id,
            client_secret: None,
        }
    }

    /// Attach a confidential client secret, sent as `client_secret`.
    pub fn with_client_secret(mut self, secret: Secret<String>) -> Self {
        self.client_secret = Some(secret);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl TokenRefresher for HttpRefresher {
    fn refresh<'a>(
        &'a self,
        refresh: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenResponse>> + Send + 'a>> {
        Box::pin(refresh_token(
            &self.client,
            &self.endpoint,
            &self.client_id,
            self.client_secret.as_ref().map(|s| s.expose().as_str()),
            refresh,
        ))
    }
}

/// Refresh an access token using a refresh token.
///
/// Non-2xx responses carry the status and body text in the error. 401/403 map
/// to `InvalidCredentials` (revoked or invalid refresh secret); everything else
/// is `TokenRefresh`. Neither variant implies the caller should drop the secret.
pub async fn refresh_token(
    client: &reqwest::Client,
    endpoint: &str,
    client_id: &str,
    client_secret: Option<&str>,
    refresh: &str,
) -> Result<TokenResponse> {
    let mut form = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh),
        ("client_id", client_id),
    ];
    if let Some(secret) = client_secret {
        form.push(("client_secret", secret));
    }

    debug!(endpoint, "requesting token refresh");

    let response = client
        .post(endpoint)
        .form(&form)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenRefresh(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenRefresh(format!("invalid refresh response: {e}")))
}
