//! Pool manager: the stateful owner of one provider's account pool
//!
//! Holds the in-memory `PoolDocument` behind a single async mutex that guards
//! every read-modify-persist sequence, plus the token cache. The mutex is never
//! held across a token refresh; after a refresh the account is located again by
//! its refresh secret because indices may have shifted meanwhile.
//!
//! Every mutation follows the same commit pattern: mutate a copy, save it, and
//! only then replace the in-memory document. A failed write leaves both the
//! file and memory untouched. Command operations reload the document from disk
//! before mutating; the hot path works from memory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use oauth_auth::{AuthStore, OAuthCredential, TokenRefresher, fingerprint};
use provider::{BearerCredential, ErrorClassification};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::codec;
use crate::document::{Account, PoolDocument, RotationMode};
use crate::error::{Error, Result};
use crate::rate_limit::{
    classify_failure, clear_rate_limit, is_available, mark_rate_limited, parse_reset_delay,
};
use crate::resolver::{derive_label, label_taken, resolve, unique_label};
use crate::selection::next_index;
use crate::token_cache::{AccessGrant, TokenCache};

/// Construction options for `PoolManager`.
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Rotation mode for a pool whose document does not exist yet
    pub default_mode: RotationMode,
    /// Safety margin subtracted from every access token expiry
    pub refresh_margin_ms: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            default_mode: RotationMode::default(),
            refresh_margin_ms: oauth_auth::DEFAULT_REFRESH_MARGIN_MS,
        }
    }
}

/// Result of importing a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ImportOutcome {
    Added { index: usize, label: String },
    /// The refresh secret was already pooled; nothing new was added
    Existing { index: usize, label: String },
}

impl ImportOutcome {
    pub fn label(&self) -> &str {
        match self {
            ImportOutcome::Added { label, .. } | ImportOutcome::Existing { label, .. } => label,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            ImportOutcome::Added { index, .. } | ImportOutcome::Existing { index, .. } => *index,
        }
    }
}

/// Prior and resulting state of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change {
    pub target: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

/// What `report_failure` did with a failure signal.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    #[serde(skip)]
    pub classification: ErrorClassification,
    pub rate_limited: bool,
    /// Account the failure was attributed to
    pub account: Option<String>,
    pub reset_at: Option<u64>,
    /// New active account after a rate-limit rotation
    pub switched_to: Option<String>,
}

/// One account as shown to the command surface. Never carries secrets.
#[derive(Debug, Clone, Serialize)]
pub struct AccountView {
    /// 1-based, as accepted by selectors
    pub position: usize,
    pub label: String,
    pub identity: Option<String>,
    pub active: bool,
    pub available: bool,
    pub token_valid: bool,
    pub access_token_expires: Option<u64>,
    pub rate_limit_reset_time: Option<u64>,
    pub rate_limit_reason: Option<String>,
    pub last_used: Option<u64>,
    pub last_error: Option<String>,
    pub request_count: u64,
    pub added_at: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub mode: RotationMode,
    pub active: Option<String>,
    pub active_position: Option<usize>,
    pub total: usize,
    pub available: usize,
    pub rate_limited: usize,
    /// Earliest pending rate-limit reset
    pub next_reset: Option<u64>,
}

/// Counts from one proactive refresh pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub refreshed: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct PoolManager {
    path: PathBuf,
    state: Mutex<PoolDocument>,
    tokens: TokenCache,
}

impl PoolManager {
    /// Load the pool at `path`. A missing document starts empty in
    /// `options.default_mode`; a corrupt one starts empty (logged by the codec).
    pub async fn load(
        path: PathBuf,
        refresher: Arc<dyn TokenRefresher>,
        options: PoolOptions,
    ) -> Self {
        let doc = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            codec::load(&path).await
        } else {
            PoolDocument {
                rotation_mode: options.default_mode,
                ..Default::default()
            }
        };
        info!(
            path = %path.display(),
            accounts = doc.accounts.len(),
            mode = %doc.rotation_mode,
            "account pool loaded"
        );
        Self {
            path,
            state: Mutex::new(doc),
            tokens: TokenCache::new(refresher, options.refresh_margin_ms),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush the in-memory document to disk.
    pub async fn shutdown(&self) -> Result<()> {
        let state = self.state.lock().await;
        codec::save(&self.path, &*state).await?;
        info!(path = %self.path.display(), accounts = state.accounts.len(), "account pool flushed");
        Ok(())
    }

    /// Re-read the document from disk. Before the first write there is no
    /// file, so the in-memory copy is authoritative.
    async fn reload(&self, state: &MutexGuard<'_, PoolDocument>) -> PoolDocument {
        match tokio::fs::try_exists(&self.path).await {
            Ok(true) => codec::load(&self.path).await,
            _ => (**state).clone(),
        }
    }

    async fn commit(&self, state: &mut MutexGuard<'_, PoolDocument>, doc: PoolDocument) -> Result<()> {
        codec::save(&self.path, &doc).await?;
        **state = doc;
        Ok(())
    }

    /// Add a raw credential to the pool.
    ///
    /// A refresh secret that is already pooled reports `Existing` and only
    /// refreshes identity fields and a newer access token in place.
    pub async fn import(
        &self,
        raw: &OAuthCredential,
        label_hint: Option<&str>,
        now: u64,
    ) -> Result<ImportOutcome> {
        if raw.refresh.trim().is_empty() {
            return Err(Error::AuthStore(oauth_auth::Error::CredentialParse(
                "credential has no refresh secret".into(),
            )));
        }

        let mut state = self.state.lock().await;
        let mut doc = self.reload(&state).await;
        let incoming =
            Account::from_credential(raw, String::new(), now, self.tokens.margin_ms());

        if let Some(index) = doc.position_of(&raw.refresh) {
            let changed = merge_existing(&mut doc.accounts[index], incoming);
            let label = doc.accounts[index].label.clone();
            if changed {
                self.commit(&mut state, doc).await?;
            }
            info!(account = %label, index, changed, "credential already pooled");
            return Ok(ImportOutcome::Existing { index, label });
        }

        let base = match label_hint.map(str::trim).filter(|l| !l.is_empty()) {
            Some(hint) => hint.to_string(),
            None => derive_label(&oauth_auth::identify(raw), "account", doc.accounts.len() + 1),
        };
        let label = unique_label(&base, doc.accounts.iter().map(|a| a.label.as_str()));

        let mut account = incoming;
        account.label = label.clone();
        doc.accounts.push(account);
        let index = doc.accounts.len() - 1;
        if doc.active_index.is_none() {
            doc.active_index = Some(index);
        }
        self.commit(&mut state, doc).await?;

        info!(account = %label, index, key = %fingerprint(&raw.refresh), "account imported");
        Ok(ImportOutcome::Added { index, label })
    }

    /// Import whatever credential is currently live in the auth store.
    pub async fn import_live(
        &self,
        store: &AuthStore,
        provider: &str,
        label_hint: Option<&str>,
        now: u64,
    ) -> Result<ImportOutcome> {
        let credential = store
            .read(provider)
            .await?
            .ok_or_else(|| Error::NoLiveCredential(provider.to_string()))?;
        self.import(&credential, label_hint, now).await
    }

    /// Hot path: choose the account for the next outbound request and return
    /// a valid bearer credential for it.
    ///
    /// A token failure is recorded on the account and triggers exactly one
    /// fallback to the next available account. If that fails too, the first
    /// error is returned.
    pub async fn get_credential_for_request(&self, now: u64) -> Result<BearerCredential> {
        let first = self.select(now, None).await?;
        let original = match self.tokens.get_valid_access_token(&first, now).await {
            Ok(grant) => return self.finish(&first, grant, now).await,
            Err(e) => e.to_string(),
        };
        self.record_error(&first.refresh_token, &original).await;

        let second = self.select(now, Some(true)).await?;
        if second.refresh_token == first.refresh_token {
            warn!(account = %first.label, "no other account to fall back to");
            return Err(Error::UpstreamAuth(original));
        }
        metrics::counter!("pool_fallbacks_total").increment(1);
        warn!(from = %first.label, to = %second.label, error = %original, "falling back to next account");

        match self.tokens.get_valid_access_token(&second, now).await {
            Ok(grant) => self.finish(&second, grant, now).await,
            Err(e) => {
                self.record_error(&second.refresh_token, &e.to_string()).await;
                Err(Error::UpstreamAuth(original))
            }
        }
    }

    /// Run selection under the lock and persist the moved active pointer
    /// before the lock is released. `force` overrides the mode-derived force
    /// flag.
    async fn select(&self, now: u64, force: Option<bool>) -> Result<Account> {
        let mut state = self.state.lock().await;
        let force = force.unwrap_or(state.rotation_mode == RotationMode::RoundRobin);
        let index = next_index(&state, now, force).ok_or(Error::EmptyPool)?;

        let account = state.accounts[index].clone();
        if !is_available(&account, now) {
            warn!(
                account = %account.label,
                reset_at = account.rate_limit_reset_time,
                "every account is rate limited, using the soonest to reset"
            );
        }
        if state.active_index != Some(index) {
            debug!(from = ?state.active_index, to = index, "active account moved");
            let mut doc = (*state).clone();
            doc.active_index = Some(index);
            self.commit(&mut state, doc).await?;
        }
        Ok(account)
    }

    /// Apply the grant and usage counters, persist, build the credential.
    async fn finish(
        &self,
        selected: &Account,
        grant: AccessGrant,
        now: u64,
    ) -> Result<BearerCredential> {
        let mut state = self.state.lock().await;
        let Some(index) = locate(&state, &selected.refresh_token, &grant) else {
            drop(state);
            self.retire_rotated(&grant).await;
            warn!(account = %selected.label, "account removed while its token was fetched");
            return Err(Error::NotFound(selected.label.clone()));
        };

        let mut doc = (*state).clone();
        let account = &mut doc.accounts[index];
        apply_grant(account, &grant);
        account.request_count += 1;
        account.last_used = Some(now);
        let credential = bearer(account, index, grant.access_token());
        self.commit(&mut state, doc).await?;
        drop(state);
        self.retire_rotated(&grant).await;

        metrics::counter!("pool_selections_total", "account" => credential.account.clone())
            .increment(1);
        debug!(account = %credential.account, index, "credential selected");
        Ok(credential)
    }

    /// Once a rotated refresh secret is stored, the slot keyed by the old
    /// secret is dead.
    async fn retire_rotated(&self, grant: &AccessGrant) {
        if let Some(token) = grant.refreshed()
            && token.rotated_refresh.is_some()
        {
            self.tokens.retire(&token.refreshed_with).await;
        }
    }

    /// Store `text` as the last error of the account holding `refresh_token`.
    /// Best effort: a failed write is logged, never surfaced.
    async fn record_error(&self, refresh_token: &str, text: &str) {
        let mut state = self.state.lock().await;
        let Some(index) = state.position_of(refresh_token) else {
            return;
        };
        let mut doc = (*state).clone();
        doc.accounts[index].last_error = Some(text.to_string());
        if let Err(e) = self.commit(&mut state, doc).await {
            warn!(error = %e, "failed to persist account error");
        }
    }

    /// Classify a failure text and apply it to the active account.
    pub async fn report_failure(&self, text: &str, now: u64) -> Result<FailureReport> {
        self.report_classified(classify_failure(None, text), text, now)
            .await
    }

    /// Apply an already classified failure to the active account.
    ///
    /// Rate limits mark the account until the parsed reset instant and
    /// force-advance selection so the next request already uses another
    /// account. Anything else is recorded as `lastError`.
    pub async fn report_classified(
        &self,
        classification: ErrorClassification,
        text: &str,
        now: u64,
    ) -> Result<FailureReport> {
        let mut state = self.state.lock().await;
        let mut report = FailureReport {
            classification,
            rate_limited: classification == ErrorClassification::RateLimited,
            account: None,
            reset_at: None,
            switched_to: None,
        };
        let Some(active) = state.active_index.filter(|&i| i < state.accounts.len()) else {
            debug!("failure reported with no active account");
            return Ok(report);
        };

        let mut doc = (*state).clone();
        let label = doc.accounts[active].label.clone();
        report.account = Some(label.clone());

        if report.rate_limited {
            let delay = parse_reset_delay(text);
            mark_rate_limited(&mut doc.accounts[active], delay, text, now);
            report.reset_at = doc.accounts[active].rate_limit_reset_time;
            doc.active_index = next_index(&doc, now, true);
            report.switched_to = doc.active_label();
            metrics::counter!("pool_rate_limited_total", "account" => label.clone()).increment(1);
            warn!(
                account = %label,
                delay_ms = delay,
                switched_to = report.switched_to.as_deref().unwrap_or(""),
                "account rate limited"
            );
        } else {
            doc.accounts[active].last_error = Some(text.to_string());
            info!(account = %label, ?classification, error = text, "failure recorded");
        }

        self.commit(&mut state, doc).await?;
        Ok(report)
    }

    /// Clear the active account's last error after a successful call.
    pub async fn report_success(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(active) = state.active_index.filter(|&i| i < state.accounts.len()) else {
            return Ok(());
        };
        if state.accounts[active].last_error.is_none() {
            return Ok(());
        }
        let mut doc = (*state).clone();
        doc.accounts[active].last_error = None;
        self.commit(&mut state, doc).await
    }

    /// Remove an account. Removing the active one moves the pointer to the
    /// first remaining account; removing one before it keeps the pointer on
    /// the same account.
    pub async fn remove(&self, selector: &str) -> Result<Change> {
        let mut state = self.state.lock().await;
        let mut doc = self.reload(&state).await;
        let index = resolve(&doc.accounts, selector)
            .ok_or_else(|| Error::NotFound(selector.to_string()))?;

        let before = doc.active_label();
        let removed = doc.accounts.remove(index);
        doc.active_index = match doc.active_index {
            _ if doc.accounts.is_empty() => None,
            Some(active) if active == index => Some(0),
            Some(active) if active > index => Some(active - 1),
            other => other,
        };
        let after = doc.active_label();
        self.commit(&mut state, doc).await?;
        drop(state);

        self.tokens.forget(&removed.refresh_token).await;
        info!(account = %removed.label, index, "account removed");
        Ok(Change {
            target: removed.label,
            before,
            after,
        })
    }

    /// Make the selected account active.
    pub async fn switch_to(&self, selector: &str) -> Result<Change> {
        let mut state = self.state.lock().await;
        let mut doc = self.reload(&state).await;
        let index = resolve(&doc.accounts, selector)
            .ok_or_else(|| Error::NotFound(selector.to_string()))?;

        let before = doc.active_label();
        doc.active_index = Some(index);
        let target = doc.accounts[index].label.clone();
        self.commit(&mut state, doc).await?;

        info!(account = %target, index, "active account switched");
        Ok(Change {
            after: Some(target.clone()),
            target,
            before,
        })
    }

    pub async fn rename(&self, selector: &str, label: &str) -> Result<Change> {
        let label = label.trim();
        if label.is_empty() {
            return Err(Error::InvalidLabel("label must not be empty".into()));
        }

        let mut state = self.state.lock().await;
        let mut doc = self.reload(&state).await;
        let index = resolve(&doc.accounts, selector)
            .ok_or_else(|| Error::NotFound(selector.to_string()))?;
        if label_taken(&doc.accounts, label, Some(index)) {
            return Err(Error::Duplicate(label.to_string()));
        }

        let before = std::mem::replace(&mut doc.accounts[index].label, label.to_string());
        self.commit(&mut state, doc).await?;

        info!(from = %before, to = label, "account renamed");
        Ok(Change {
            target: before.clone(),
            before: Some(before),
            after: Some(label.to_string()),
        })
    }

    pub async fn set_mode(&self, mode: RotationMode) -> Result<Change> {
        let mut state = self.state.lock().await;
        let mut doc = self.reload(&state).await;
        let before = std::mem::replace(&mut doc.rotation_mode, mode);
        self.commit(&mut state, doc).await?;

        info!(from = %before, to = %mode, "rotation mode changed");
        Ok(Change {
            target: "mode".into(),
            before: Some(before.to_string()),
            after: Some(mode.to_string()),
        })
    }

    /// Drop every rate-limit marker. Returns how many accounts were limited.
    pub async fn clear_rate_limits(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut doc = self.reload(&state).await;
        let cleared = doc
            .accounts
            .iter_mut()
            .map(clear_rate_limit)
            .filter(|was_limited| *was_limited)
            .count();
        self.commit(&mut state, doc).await?;

        info!(cleared, "rate limits cleared");
        Ok(cleared)
    }

    /// Advance the active pointer as if the active account were exhausted.
    pub async fn force_next(&self, now: u64) -> Result<Change> {
        let mut state = self.state.lock().await;
        let mut doc = self.reload(&state).await;
        let before = doc.active_label();
        doc.active_index = Some(next_index(&doc, now, true).ok_or(Error::EmptyPool)?);
        let after = doc.active_label();
        self.commit(&mut state, doc).await?;

        info!(from = before.as_deref().unwrap_or(""), to = after.as_deref().unwrap_or(""), "forced rotation");
        Ok(Change {
            target: "active".into(),
            before,
            after,
        })
    }

    /// Read the document as it is on disk. Memory is left alone; the next
    /// command reloads anyway.
    async fn snapshot(&self) -> PoolDocument {
        let state = self.state.lock().await;
        self.reload(&state).await
    }

    pub async fn list(&self, now: u64) -> Vec<AccountView> {
        let doc = self.snapshot().await;
        doc.accounts
            .iter()
            .enumerate()
            .map(|(i, a)| AccountView {
                position: i + 1,
                label: a.label.clone(),
                identity: a.identity().map(str::to_string),
                active: doc.active_index == Some(i),
                available: is_available(a, now),
                token_valid: TokenCache::cached_token(a, now).is_some(),
                access_token_expires: a.access_token_expires,
                rate_limit_reset_time: a.rate_limit_reset_time.filter(|&r| r > now),
                rate_limit_reason: a.rate_limit_reason.clone(),
                last_used: a.last_used,
                last_error: a.last_error.clone(),
                request_count: a.request_count,
                added_at: a.added_at,
            })
            .collect()
    }

    pub async fn status(&self, now: u64) -> PoolStatus {
        let doc = self.snapshot().await;
        summarize(&doc, now)
    }

    /// Pool health for the `/health` endpoint: healthy when every account is
    /// available, degraded when some are, unhealthy when none are.
    pub async fn health(&self, now: u64) -> serde_json::Value {
        let state = self.state.lock().await;
        let summary = summarize(&state, now);
        let status = if summary.total > 0 && summary.available == summary.total {
            "healthy"
        } else if summary.available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        let accounts: Vec<serde_json::Value> = state
            .accounts
            .iter()
            .map(|a| match a.rate_limit_reset_time.filter(|&r| r > now) {
                None => serde_json::json!({ "label": a.label, "status": "available" }),
                Some(reset) => serde_json::json!({
                    "label": a.label,
                    "status": "rate_limited",
                    "reset_in_secs": (reset - now).div_ceil(1000),
                }),
            })
            .collect();

        serde_json::json!({
            "status": status,
            "mode": summary.mode,
            "active": summary.active,
            "accounts_total": summary.total,
            "accounts_available": summary.available,
            "accounts_rate_limited": summary.rate_limited,
            "accounts": accounts,
        })
    }

    /// Refresh every token that expires within `threshold_ms` of `now`.
    ///
    /// Goes through the token cache, so it serializes with request-time
    /// refreshes of the same account. Failures are recorded as `lastError`.
    pub async fn refresh_expiring(&self, now: u64, threshold_ms: u64) -> RefreshSummary {
        let accounts = self.state.lock().await.accounts.clone();
        let horizon = now.saturating_add(threshold_ms);
        let mut summary = RefreshSummary::default();

        for account in &accounts {
            if TokenCache::cached_token(account, horizon).is_some() {
                summary.skipped += 1;
                continue;
            }
            match self.tokens.obtain(account, now, threshold_ms).await {
                Ok(grant) => {
                    if let Err(e) = self.store_grant(account, &grant).await {
                        warn!(account = %account.label, error = %e, "failed to persist refreshed token");
                        summary.failed += 1;
                    } else {
                        summary.refreshed += 1;
                    }
                }
                Err(e) => {
                    self.record_error(&account.refresh_token, &e.to_string()).await;
                    summary.failed += 1;
                }
            }
        }

        if summary.refreshed + summary.failed > 0 {
            info!(
                refreshed = summary.refreshed,
                failed = summary.failed,
                skipped = summary.skipped,
                "proactive refresh pass complete"
            );
        }
        summary
    }

    async fn store_grant(&self, account: &Account, grant: &AccessGrant) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(index) = locate(&state, &account.refresh_token, grant) else {
            drop(state);
            self.retire_rotated(grant).await;
            return Ok(());
        };
        let mut doc = (*state).clone();
        apply_grant(&mut doc.accounts[index], grant);
        self.commit(&mut state, doc).await?;
        drop(state);
        self.retire_rotated(grant).await;
        Ok(())
    }
}

/// Find the account a grant belongs to, following a rotated refresh secret
/// that another caller may already have written back.
fn locate(doc: &PoolDocument, refresh_token: &str, grant: &AccessGrant) -> Option<usize> {
    doc.position_of(refresh_token).or_else(|| {
        grant
            .refreshed()
            .and_then(|t| t.rotated_refresh.as_deref())
            .and_then(|rotated| doc.position_of(rotated))
    })
}

fn apply_grant(account: &mut Account, grant: &AccessGrant) {
    let Some(token) = grant.refreshed() else {
        return;
    };
    account.access_token = Some(token.access_token.clone());
    account.access_token_expires = Some(token.expires_at);
    account.last_error = None;
    if let Some(rotated) = &token.rotated_refresh {
        account.refresh_token = rotated.clone();
    }
}

/// Fold a re-imported credential into the pooled account. Returns whether
/// anything changed.
fn merge_existing(existing: &mut Account, incoming: Account) -> bool {
    let before = existing.clone();
    if incoming.email.is_some() {
        existing.email = incoming.email;
    }
    if incoming.account_id.is_some() {
        existing.account_id = incoming.account_id;
    }
    if incoming.project_id.is_some() {
        existing.project_id = incoming.project_id;
    }
    existing.extra.extend(incoming.extra);
    if incoming.access_token_expires > existing.access_token_expires {
        existing.access_token = incoming.access_token;
        existing.access_token_expires = incoming.access_token_expires;
    }
    *existing != before
}

fn bearer(account: &Account, index: usize, access_token: &str) -> BearerCredential {
    let mut extra = account.extra.clone();
    if let Some(project) = &account.project_id {
        extra.insert("projectId".into(), project.clone().into());
    }
    BearerCredential {
        account: account.label.clone(),
        index,
        access_token: access_token.to_string(),
        extra,
    }
}

fn summarize(doc: &PoolDocument, now: u64) -> PoolStatus {
    let available = doc.accounts.iter().filter(|a| is_available(a, now)).count();
    PoolStatus {
        mode: doc.rotation_mode,
        active: doc.active_label(),
        active_position: doc.active_index.map(|i| i + 1),
        total: doc.accounts.len(),
        available,
        rate_limited: doc.accounts.len() - available,
        next_reset: doc
            .accounts
            .iter()
            .filter_map(|a| a.rate_limit_reset_time)
            .filter(|&r| r > now)
            .min(),
    }
}
