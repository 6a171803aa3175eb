//! Multi-account OAuth credential pool
//!
//! Keeps several accounts for one upstream provider and decides, per outbound
//! request, whose access token to present. Tokens are refreshed lazily (and
//! proactively in the background), provider rate limits park an account until
//! its reset instant, and selection rotates away from parked accounts without
//! failing the caller.
//!
//! Account lifecycle:
//! 1. Imported from the live auth store (or a raw credential) → persisted, labelled
//! 2. Selected per request → token checked, refreshed if stale, usage recorded
//! 3. Failure text mentions 429/rate/quota → parked until `now + parsed delay`
//! 4. Refresh rejected → error recorded, one fallback to the next account
//! 5. Removed only by explicit command
//!
//! `ProfileStore` is the simpler shape: named credential snapshots switched
//! into the auth store by hand.

pub mod codec;
pub mod document;
pub mod error;
pub mod host;
pub mod pool;
pub mod profiles;
pub mod rate_limit;
pub mod refresh;
pub mod resolver;
pub mod selection;
pub mod token_cache;

pub use document::{Account, PoolDocument, Profile, ProfileDocument, RotationMode};
pub use error::{Error, Result};
pub use pool::{
    AccountView, Change, FailureReport, ImportOutcome, PoolManager, PoolOptions, PoolStatus,
    RefreshSummary,
};
pub use profiles::{ProfileStore, ProfileView, SavedProfile};
pub use rate_limit::{is_available, is_rate_limit_error, parse_reset_delay};
pub use refresh::spawn_refresh_task;
pub use resolver::resolve;
pub use selection::next_index;
pub use token_cache::{AccessGrant, TokenCache};
