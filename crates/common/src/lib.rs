//! Shared types for the account pool workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;

/// Current wall-clock time as unix milliseconds.
///
/// All persisted instants (token expiry, rate-limit reset, last-used) use this
/// unit so the pool document stays portable across restarts.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
