//! Per-account access token cache
//!
//! Hands out the account's cached access token while it is still valid and
//! refreshes it lazily otherwise. Refreshes are serialized per account: each
//! refresh secret gets its own async lock, and a caller that waited behind an
//! in-flight refresh reuses that result instead of issuing a second request.
//! Different accounts refresh concurrently.
//!
//! The cache never writes the pool document itself; it returns an
//! `AccessGrant` and the pool manager applies and persists it.

use std::collections::HashMap;
use std::sync::Arc;

use oauth_auth::{TokenRefresher, fingerprint};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::document::Account;

/// Token produced by a refresh call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Absolute expiry with the safety margin already subtracted
    pub expires_at: u64,
    /// New refresh secret when the provider rotated it
    pub rotated_refresh: Option<String>,
    /// Refresh secret the token was obtained with
    pub refreshed_with: String,
}

/// How a valid access token was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessGrant {
    /// The account's stored token was still valid
    Cached(String),
    /// This call performed the refresh
    Refreshed(RefreshedToken),
    /// A concurrent caller refreshed while this one waited
    Reused(RefreshedToken),
}

impl AccessGrant {
    pub fn access_token(&self) -> &str {
        match self {
            AccessGrant::Cached(token) => token,
            AccessGrant::Refreshed(t) | AccessGrant::Reused(t) => &t.access_token,
        }
    }

    /// The refreshed token to write back, if any.
    pub fn refreshed(&self) -> Option<&RefreshedToken> {
        match self {
            AccessGrant::Cached(_) => None,
            AccessGrant::Refreshed(t) | AccessGrant::Reused(t) => Some(t),
        }
    }
}

type Slot = Arc<Mutex<Option<RefreshedToken>>>;

pub struct TokenCache {
    refresher: Arc<dyn TokenRefresher>,
    margin_ms: u64,
    slots: Mutex<HashMap<String, Slot>>,
}

impl TokenCache {
    pub fn new(refresher: Arc<dyn TokenRefresher>, margin_ms: u64) -> Self {
        Self {
            refresher,
            margin_ms,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn margin_ms(&self) -> u64 {
        self.margin_ms
    }

    /// The account's stored token if it is still valid at `now`.
    pub fn cached_token(account: &Account, now: u64) -> Option<&str> {
        match (&account.access_token, account.access_token_expires) {
            (Some(token), Some(expires)) if !token.is_empty() && expires > now => {
                Some(token.as_str())
            }
            _ => None,
        }
    }

    /// Return a valid access token for `account`, refreshing if needed.
    pub async fn get_valid_access_token(
        &self,
        account: &Account,
        now: u64,
    ) -> oauth_auth::Result<AccessGrant> {
        self.obtain(account, now, 0).await
    }

    /// Like `get_valid_access_token`, but treats tokens expiring within
    /// `min_validity_ms` as already stale. Used by the background refresher.
    pub async fn obtain(
        &self,
        account: &Account,
        now: u64,
        min_validity_ms: u64,
    ) -> oauth_auth::Result<AccessGrant> {
        let horizon = now.saturating_add(min_validity_ms);
        if let Some(token) = Self::cached_token(account, horizon) {
            return Ok(AccessGrant::Cached(token.to_string()));
        }

        let key = fingerprint(&account.refresh_token);
        let slot = {
            let mut slots = self.slots.lock().await;
            slots.entry(key.clone()).or_default().clone()
        };
        let mut in_flight = slot.lock().await;

        if let Some(previous) = in_flight.as_ref()
            && previous.expires_at > horizon
        {
            debug!(account = %account.label, key, "reusing token refreshed by concurrent caller");
            return Ok(AccessGrant::Reused(previous.clone()));
        }

        debug!(account = %account.label, key, "access token stale, refreshing");
        match self.refresher.refresh(&account.refresh_token).await {
            Ok(response) => {
                let ttl_ms = response.expires_in.saturating_mul(1000);
                let token = RefreshedToken {
                    access_token: response.access_token,
                    expires_at: now.saturating_add(ttl_ms).saturating_sub(self.margin_ms),
                    rotated_refresh: response
                        .refresh_token
                        .filter(|r| !r.is_empty() && *r != account.refresh_token),
                    refreshed_with: account.refresh_token.clone(),
                };
                if token.rotated_refresh.is_some() {
                    info!(account = %account.label, key, "provider rotated refresh secret");
                }
                *in_flight = Some(token.clone());
                metrics::counter!("pool_token_refresh_total", "result" => "success").increment(1);
                info!(account = %account.label, key, expires_at = token.expires_at, "access token refreshed");
                Ok(AccessGrant::Refreshed(token))
            }
            Err(e) => {
                metrics::counter!("pool_token_refresh_total", "result" => "failure").increment(1);
                warn!(account = %account.label, key, error = %e, "access token refresh failed");
                Err(e)
            }
        }
    }

    /// Drop the per-account slot (after removal from the pool).
    pub async fn forget(&self, refresh_token: &str) {
        self.slots.lock().await.remove(&fingerprint(refresh_token));
    }

    /// Drop the slot of a refresh secret the provider rotated away, unless a
    /// caller still holds it. The last caller to finish with it retires it.
    pub async fn retire(&self, refresh_token: &str) {
        let key = fingerprint(refresh_token);
        let mut slots = self.slots.lock().await;
        if slots.get(&key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            slots.remove(&key);
            debug!(key, "retired token slot of rotated refresh secret");
        }
    }

    #[cfg(test)]
    pub(crate) async fn slot_count(&self) -> usize {
        self.slots.lock().await.len()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted refresher shared by the pool tests.

    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use oauth_auth::{Error, TokenRefresher, TokenResponse};

    /// Replies from a per-secret script, falling back to a generated token.
    /// Secrets listed in `failing` always fail with `InvalidCredentials`.
    #[derive(Default)]
    pub struct ScriptedRefresher {
        pub calls: AtomicUsize,
        pub failing: StdMutex<Vec<String>>,
        pub script: StdMutex<VecDeque<TokenResponse>>,
        pub delay: Option<Duration>,
        pub ttl_secs: u64,
    }

    impl ScriptedRefresher {
        pub fn new(ttl_secs: u64) -> Self {
            Self {
                ttl_secs,
                ..Default::default()
            }
        }

        pub fn failing(self, secrets: &[&str]) -> Self {
            *self.failing.lock().unwrap() = secrets.iter().map(|s| s.to_string()).collect();
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TokenRefresher for ScriptedRefresher {
        fn refresh<'a>(
            &'a self,
            refresh_token: &'a str,
        ) -> Pin<Box<dyn Future<Output = oauth_auth::Result<TokenResponse>> + Send + 'a>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                if self
                    .failing
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|s| s == refresh_token)
                {
                    return Err(Error::InvalidCredentials(format!(
                        "refresh token rejected (400): invalid_grant for {refresh_token}"
                    )));
                }
                if let Some(scripted) = self.script.lock().unwrap().pop_front() {
                    return Ok(scripted);
                }
                Ok(TokenResponse {
                    access_token: format!("at_{refresh_token}_{n}"),
                    refresh_token: None,
                    expires_in: self.ttl_secs,
                })
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedRefresher;
    use super::*;
    use oauth_auth::TokenResponse;
    use std::time::Duration;

    const NOW: u64 = 1_700_000_000_000;
    const MARGIN: u64 = 5 * 60 * 1000;

    fn account_with_token(expires: Option<u64>) -> Account {
        let mut account = Account::new("work", "rt_work", 0);
        if let Some(expires) = expires {
            account.access_token = Some("at_cached".into());
            account.access_token_expires = Some(expires);
        }
        account
    }

    #[tokio::test]
    async fn valid_cached_token_is_returned_unchanged() {
        let refresher = Arc::new(ScriptedRefresher::new(3600));
        let cache = TokenCache::new(refresher.clone(), MARGIN);

        let grant = cache
            .get_valid_access_token(&account_with_token(Some(NOW + 1)), NOW)
            .await
            .unwrap();
        assert_eq!(grant, AccessGrant::Cached("at_cached".into()));
        assert_eq!(refresher.calls(), 0);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_with_margin() {
        let refresher = Arc::new(ScriptedRefresher::new(3600));
        let cache = TokenCache::new(refresher.clone(), MARGIN);

        let grant = cache
            .get_valid_access_token(&account_with_token(Some(NOW)), NOW)
            .await
            .unwrap();
        let refreshed = grant.refreshed().unwrap();
        assert_eq!(refreshed.access_token, "at_rt_work_1");
        assert_eq!(refreshed.expires_at, NOW + 3_600_000 - MARGIN);
        assert_eq!(refreshed.refreshed_with, "rt_work");
        assert!(refreshed.rotated_refresh.is_none());
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn missing_token_is_refreshed() {
        let refresher = Arc::new(ScriptedRefresher::new(3600));
        let cache = TokenCache::new(refresher.clone(), MARGIN);
        let grant = cache
            .get_valid_access_token(&account_with_token(None), NOW)
            .await
            .unwrap();
        assert!(matches!(grant, AccessGrant::Refreshed(_)));
    }

    #[tokio::test]
    async fn rotated_refresh_secret_is_reported() {
        let refresher = Arc::new(ScriptedRefresher::new(3600));
        refresher.script.lock().unwrap().push_back(TokenResponse {
            access_token: "at_new".into(),
            refresh_token: Some("rt_rotated".into()),
            expires_in: 60 * 60,
        });
        let cache = TokenCache::new(refresher, MARGIN);

        let grant = cache
            .get_valid_access_token(&account_with_token(None), NOW)
            .await
            .unwrap();
        assert_eq!(
            grant.refreshed().unwrap().rotated_refresh.as_deref(),
            Some("rt_rotated")
        );
    }

    #[tokio::test]
    async fn retire_drops_slot_of_rotated_secret() {
        let refresher = Arc::new(ScriptedRefresher::new(3600));
        refresher.script.lock().unwrap().push_back(TokenResponse {
            access_token: "at_new".into(),
            refresh_token: Some("rt_rotated".into()),
            expires_in: 60 * 60,
        });
        let cache = TokenCache::new(refresher, MARGIN);

        let grant = cache
            .get_valid_access_token(&account_with_token(None), NOW)
            .await
            .unwrap();
        assert_eq!(cache.slot_count().await, 1);

        cache.retire(&grant.refreshed().unwrap().refreshed_with).await;
        assert_eq!(cache.slot_count().await, 0);
    }

    #[tokio::test]
    async fn retire_keeps_slot_while_a_caller_holds_it() {
        let refresher = Arc::new(ScriptedRefresher::new(3600));
        let cache = TokenCache::new(refresher, MARGIN);
        cache
            .get_valid_access_token(&account_with_token(None), NOW)
            .await
            .unwrap();

        let held = cache
            .slots
            .lock()
            .await
            .get(&fingerprint("rt_work"))
            .cloned()
            .unwrap();
        cache.retire("rt_work").await;
        assert_eq!(cache.slot_count().await, 1);

        drop(held);
        cache.retire("rt_work").await;
        assert_eq!(cache.slot_count().await, 0);
    }

    #[tokio::test]
    async fn refresh_failure_propagates() {
        let refresher = Arc::new(ScriptedRefresher::new(3600).failing(&["rt_work"]));
        let cache = TokenCache::new(refresher, MARGIN);

        let err = cache
            .get_valid_access_token(&account_with_token(None), NOW)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid_grant"));
    }

    #[tokio::test]
    async fn concurrent_refreshes_for_one_account_coalesce() {
        let refresher =
            Arc::new(ScriptedRefresher::new(3600).with_delay(Duration::from_millis(50)));
        let cache = Arc::new(TokenCache::new(refresher.clone(), MARGIN));
        let account = account_with_token(None);

        let mut handles = vec![];
        for _ in 0..5 {
            let cache = cache.clone();
            let account = account.clone();
            handles.push(tokio::spawn(async move {
                cache.get_valid_access_token(&account, NOW).await.unwrap()
            }));
        }
        let mut grants = vec![];
        for h in handles {
            grants.push(h.await.unwrap());
        }

        assert_eq!(refresher.calls(), 1);
        assert_eq!(
            grants
                .iter()
                .filter(|g| matches!(g, AccessGrant::Refreshed(_)))
                .count(),
            1
        );
        assert!(grants.iter().all(|g| g.access_token() == "at_rt_work_1"));
    }

    #[tokio::test]
    async fn different_accounts_refresh_independently() {
        let refresher = Arc::new(ScriptedRefresher::new(3600));
        let cache = TokenCache::new(refresher.clone(), MARGIN);

        let a = Account::new("a", "rt_a", 0);
        let b = Account::new("b", "rt_b", 0);
        let ga = cache.get_valid_access_token(&a, NOW).await.unwrap();
        let gb = cache.get_valid_access_token(&b, NOW).await.unwrap();
        assert!(matches!(ga, AccessGrant::Refreshed(_)));
        assert!(matches!(gb, AccessGrant::Refreshed(_)));
        assert_eq!(refresher.calls(), 2);
    }

    #[tokio::test]
    async fn obtain_treats_soon_expiring_token_as_stale() {
        let refresher = Arc::new(ScriptedRefresher::new(3600));
        let cache = TokenCache::new(refresher.clone(), MARGIN);
        let account = account_with_token(Some(NOW + 60_000));

        let grant = cache.obtain(&account, NOW, 900_000).await.unwrap();
        assert!(matches!(grant, AccessGrant::Refreshed(_)));
        assert_eq!(refresher.calls(), 1);
    }

    #[test]
    fn empty_cached_token_is_not_valid() {
        let mut account = account_with_token(Some(NOW + 10));
        account.access_token = Some(String::new());
        assert!(TokenCache::cached_token(&account, NOW).is_none());
    }
}
