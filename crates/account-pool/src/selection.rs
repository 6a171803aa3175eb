//! Account selection policy
//!
//! Pure mapping from pool state to the index that should serve the next
//! request. No I/O and no clock reads: `now` is passed in, so identical inputs
//! always produce identical outputs.

use crate::document::{PoolDocument, RotationMode};
use crate::rate_limit::is_available;

/// Pick the account for the next request.
///
/// - empty pool: `None`
/// - every account rate limited: the soonest reset (lowest index on ties)
/// - round-robin or forced: first available scanning forward from just after
///   the active index, wrapping once
/// - otherwise: the active account if available, else the first available
pub fn next_index(pool: &PoolDocument, now: u64, force_switch: bool) -> Option<usize> {
    let accounts = &pool.accounts;
    let n = accounts.len();
    if n == 0 {
        return None;
    }

    if !accounts.iter().any(|a| is_available(a, now)) {
        return soonest_reset(pool);
    }

    if pool.rotation_mode == RotationMode::RoundRobin || force_switch {
        let start = pool.active_index.map_or(0, |i| i + 1);
        return (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&i| is_available(&accounts[i], now));
    }

    if let Some(active) = pool.active_index
        && active < n
        && is_available(&accounts[active], now)
    {
        return Some(active);
    }
    accounts.iter().position(|a| is_available(a, now))
}

/// Index whose rate-limit reset comes first; lowest index breaks ties.
pub fn soonest_reset(pool: &PoolDocument) -> Option<usize> {
    pool.accounts
        .iter()
        .enumerate()
        .min_by_key(|(i, a)| (a.rate_limit_reset_time.unwrap_or(0), *i))
        .map(|(i, _)| i)
}
