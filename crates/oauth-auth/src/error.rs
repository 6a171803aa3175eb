//! Error types for token refresh and the auth store

/// Errors from token refresh and auth-store operations.
///
/// None of these imply the refresh secret is gone for good: callers record
/// the message and keep the secret until a user removes the account.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Token endpoint unreachable or the request never completed
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Non-2xx other than 401/403, or an unreadable success body
    #[error("token refresh failed: {0}")]
    TokenRefresh(String),

    /// Refresh secret revoked or rejected (401/403)
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Auth store or credential entry is not valid JSON of the expected shape
    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
