//! Rate-limit detection and per-account availability
//!
//! A failure signal whose text mentions 429, rate, quota, or resource
//! exhaustion marks the active account unavailable until a reset instant.
//! The delay comes from the provider's own "retry in ..." hint when one can be
//! parsed, otherwise a fixed 60 second default.

use std::sync::LazyLock;

use provider::ErrorClassification;
use regex::Regex;

use crate::document::Account;

/// Backoff applied when the provider gives no parseable retry hint.
pub const DEFAULT_RESET_DELAY_MS: u64 = 60_000;

/// Case-insensitive fragments that identify a rate-limit failure.
const TRIGGER_PATTERNS: &[&str] = &[
    "429",
    "rate",
    "quota",
    "resource exhausted",
    "resource_exhausted",
];

static HOURS_MINUTES_SECONDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+)h(\d+)m(\d+(?:\.\d+)?)s").expect("valid h/m/s pattern")
});
static MINUTES_SECONDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)m(\d+(?:\.\d+)?)s").expect("valid m/s pattern"));
static SECONDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)s").expect("valid s pattern"));

/// Whether a failure text indicates provider-side rate limiting.
pub fn is_rate_limit_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    TRIGGER_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Classify a failure reported by the host.
///
/// Rate-limit text (or status 429) wins over everything else; 401/403 are
/// account-level auth failures; anything else is transient.
pub fn classify_failure(status: Option<u16>, text: &str) -> ErrorClassification {
    if status == Some(429) || is_rate_limit_error(text) {
        return ErrorClassification::RateLimited;
    }
    match status {
        Some(401) | Some(403) => ErrorClassification::Unauthorized,
        _ => ErrorClassification::Transient,
    }
}

/// Extract the retry delay from a provider error, in milliseconds.
///
/// Most specific pattern wins: `<h>h<m>m<s>s`, then `<m>m<s>s`, then `<n>s`.
/// Fractional seconds round up. No match means `DEFAULT_RESET_DELAY_MS`.
/// Oversized hints saturate at `u64::MAX` instead of overflowing.
pub fn parse_reset_delay(text: &str) -> u64 {
    let int = |caps: &regex::Captures<'_>, i: usize| -> u64 {
        caps.get(i).map(|m| parse_digits(m.as_str())).unwrap_or(0)
    };
    let secs_ms = |caps: &regex::Captures<'_>, i: usize| -> u64 {
        caps.get(i).map(|m| seconds_to_ms(m.as_str())).unwrap_or(0)
    };

    if let Some(caps) = HOURS_MINUTES_SECONDS.captures(text) {
        return int(&caps, 1)
            .saturating_mul(3_600_000)
            .saturating_add(int(&caps, 2).saturating_mul(60_000))
            .saturating_add(secs_ms(&caps, 3));
    }
    if let Some(caps) = MINUTES_SECONDS.captures(text) {
        return int(&caps, 1)
            .saturating_mul(60_000)
            .saturating_add(secs_ms(&caps, 2));
    }
    if let Some(caps) = SECONDS.captures(text) {
        return secs_ms(&caps, 1);
    }
    DEFAULT_RESET_DELAY_MS
}

/// Decimal seconds to milliseconds without going through floats; any
/// sub-millisecond remainder rounds up.
fn seconds_to_ms(value: &str) -> u64 {
    let (whole, frac) = value.split_once('.').unwrap_or((value, ""));
    let whole_ms = parse_digits(whole).saturating_mul(1000);
    let millis: String = frac.chars().chain("000".chars()).take(3).collect();
    let remainder = frac.chars().skip(3).any(|c| c != '0');
    whole_ms
        .saturating_add(millis.parse::<u64>().unwrap_or(0))
        .saturating_add(u64::from(remainder))
}

/// Regex-matched digit run as `u64`; too many digits saturate.
fn parse_digits(digits: &str) -> u64 {
    match digits.parse::<u64>() {
        Ok(n) => n,
        Err(_) if !digits.is_empty() => u64::MAX,
        Err(_) => 0,
    }
}

/// Mark an account unavailable until `now + delay_ms`.
pub fn mark_rate_limited(account: &mut Account, delay_ms: u64, reason: &str, now: u64) {
    account.rate_limit_reset_time = Some(now.saturating_add(delay_ms));
    account.rate_limit_reason = Some(reason.to_string());
}

/// Drop any rate-limit marker. Returns whether one was set.
pub fn clear_rate_limit(account: &mut Account) -> bool {
    let was_limited = account.rate_limit_reset_time.is_some();
    account.rate_limit_reset_time = None;
    account.rate_limit_reason = None;
    was_limited
}

/// True iff no reset instant is set or it has already passed.
pub fn is_available(account: &Account, now: u64) -> bool {
    account.rate_limit_reset_time.is_none_or(|reset| reset <= now)
}

/// Indices of currently available accounts, in pool order.
pub fn available_accounts(accounts: &[Account], now: u64) -> Vec<usize> {
    accounts
        .iter()
        .enumerate()
        .filter(|(_, a)| is_available(a, now))
        .map(|(i, _)| i)
        .collect()
}
