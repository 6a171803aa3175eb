//! OAuth credential plumbing for the account pool
//!
//! Provides the token-endpoint client, the host authentication store, and
//! identity extraction for OAuth credentials. This crate has no knowledge of
//! pools or rotation; it can be tested and used independently.
//!
//! Credential flow:
//! 1. The host writes its live credential into the auth store
//! 2. The pool imports it via `AuthStore::read()` + `identity::identify()`
//! 3. The pool exchanges refresh secrets through a `TokenRefresher`
//! 4. Activating a stored profile writes it back with `AuthStore::write()`

pub mod auth_store;
pub mod constants;
pub mod error;
pub mod identity;
pub mod token;

pub use auth_store::{AuthStore, OAuthCredential, write_json_atomic};
pub use constants::*;
pub use error::{Error, Result};
pub use identity::{Identity, fingerprint, identify};
pub use token::{HttpRefresher, TokenRefresher, TokenResponse, refresh_token};
