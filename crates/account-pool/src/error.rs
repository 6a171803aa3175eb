//! Error types for pool and profile operations

/// Errors from pool and profile operations.
///
/// Selector misses and label collisions are reported without mutating
/// anything. `UpstreamAuth` is only surfaced after the one-shot fallback to
/// another account has also failed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pool has no accounts")]
    EmptyPool,

    #[error("no account or profile matches {0:?}")]
    NotFound(String),

    #[error("label already in use: {0}")]
    Duplicate(String),

    #[error("invalid label: {0}")]
    InvalidLabel(String),

    #[error("token refresh failed: {0}")]
    UpstreamAuth(String),

    #[error("failed to persist {path}: {reason}")]
    Persist { path: String, reason: String },

    #[error("auth store error: {0}")]
    AuthStore(#[from] oauth_auth::Error),

    #[error("no live credential for provider {0}")]
    NoLiveCredential(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
