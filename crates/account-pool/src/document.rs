//! Persisted document shapes
//!
//! Two current shapes share the same lifecycle: `PoolDocument` for the
//! rotation pool and `ProfileDocument` for the profile switcher. Both are
//! version 2. `LegacyDocument` is the version-1 two-slot shape; it only ever
//! exists inside the codec on its way to one of the current shapes.

use oauth_auth::OAuthCredential;
use serde::{Deserialize, Serialize};

/// Schema version written by this crate.
pub const CURRENT_VERSION: u32 = 2;

fn current_version() -> u32 {
    CURRENT_VERSION
}

/// Policy governing when the active account pointer advances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotationMode {
    /// Advance on every selection
    #[default]
    RoundRobin,
    /// Stay on the active account until it is rate limited
    UseUntilExhausted,
    /// Only explicit user action moves the pointer (plus escape from an unusable account)
    Manual,
}

impl RotationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationMode::RoundRobin => "round-robin",
            RotationMode::UseUntilExhausted => "use-until-exhausted",
            RotationMode::Manual => "manual",
        }
    }
}

impl std::fmt::Display for RotationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RotationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round-robin" | "round_robin" | "roundrobin" => Ok(RotationMode::RoundRobin),
            "use-until-exhausted" | "use_until_exhausted" | "sticky" => {
                Ok(RotationMode::UseUntilExhausted)
            }
            "manual" => Ok(RotationMode::Manual),
            other => Err(format!(
                "unknown rotation mode {other:?} (expected round-robin, use-until-exhausted, or manual)"
            )),
        }
    }
}

/// Credential extras that are promoted to typed `Account` fields or would
/// collide with them when flattened.
const ACCOUNT_KEYS: &[&str] = &[
    "email",
    "accountId",
    "account_id",
    "label",
    "refreshToken",
    "projectId",
    "project_id",
    "accessToken",
    "accessTokenExpires",
    "addedAt",
    "lastUsed",
    "lastError",
    "rateLimitResetTime",
    "rateLimitReason",
    "requestCount",
];

/// One stored credential in the rotation pool.
///
/// All instants are unix milliseconds. `access_token_expires` already has the
/// refresh safety margin subtracted. Unknown fields survive in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default)]
    pub label: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token_expires: Option<u64>,
    #[serde(default)]
    pub added_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_reset_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_reason: Option<String>,
    #[serde(default)]
    pub request_count: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Account {
    /// Fresh account holding only a refresh secret.
    pub fn new(label: impl Into<String>, refresh_token: impl Into<String>, added_at: u64) -> Self {
        Self {
            email: None,
            account_id: None,
            label: label.into(),
            refresh_token: refresh_token.into(),
            project_id: None,
            access_token: None,
            access_token_expires: None,
            added_at,
            last_used: None,
            last_error: None,
            rate_limit_reset_time: None,
            rate_limit_reason: None,
            request_count: 0,
            extra: serde_json::Map::new(),
        }
    }

    /// Build an account from a raw credential.
    ///
    /// The credential's absolute expiry has `margin_ms` subtracted so the
    /// cached token is treated exactly like one fetched by the token cache.
    pub fn from_credential(
        credential: &OAuthCredential,
        label: String,
        added_at: u64,
        margin_ms: u64,
    ) -> Self {
        let identity = oauth_auth::identify(credential);
        let mut account = Self::new(label, credential.refresh.clone(), added_at);
        account.email = identity.email;
        account.account_id = identity.account_id;
        account.project_id = identity.project_id;
        account.extra = credential
            .extra
            .iter()
            .filter(|(key, _)| !ACCOUNT_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if !credential.access.is_empty() {
            account.access_token = Some(credential.access.clone());
            account.access_token_expires = Some(credential.expires.saturating_sub(margin_ms));
        }
        account
    }

    /// Email if known, else the opaque account id.
    pub fn identity(&self) -> Option<&str> {
        self.email.as_deref().or(self.account_id.as_deref())
    }
}

/// One provider's account set plus rotation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolDocument {
    #[serde(default = "current_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_index: Option<usize>,
    #[serde(default)]
    pub rotation_mode: RotationMode,
    #[serde(default)]
    pub accounts: Vec<Account>,
}

impl Default for PoolDocument {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            active_index: None,
            rotation_mode: RotationMode::default(),
            accounts: Vec::new(),
        }
    }
}

impl PoolDocument {
    pub fn active(&self) -> Option<&Account> {
        self.active_index.and_then(|i| self.accounts.get(i))
    }

    pub fn active_label(&self) -> Option<String> {
        self.active().map(|a| a.label.clone())
    }

    /// Position of the account holding `refresh_token`.
    pub fn position_of(&self, refresh_token: &str) -> Option<usize> {
        self.accounts
            .iter()
            .position(|a| a.refresh_token == refresh_token)
    }
}

/// Stored credential for the profile switcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub oauth: OAuthCredential,
}

/// Profile switcher store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDocument {
    #[serde(default = "current_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_profile_id: Option<String>,
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

impl Default for ProfileDocument {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            active_profile_id: None,
            profiles: Vec::new(),
        }
    }
}

impl ProfileDocument {
    pub fn active_position(&self) -> Option<usize> {
        let id = self.active_profile_id.as_deref()?;
        self.profiles.iter().position(|p| p.id == id)
    }

    pub fn active_label(&self) -> Option<String> {
        self.active_position().map(|i| self.profiles[i].label.clone())
    }
}

/// Which legacy slot was active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegacySlotName {
    Current,
    Previous,
}

/// One populated slot of the version-1 document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacySlot {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub saved_at: u64,
    pub oauth: OAuthCredential,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LegacySlots {
    #[serde(default)]
    pub current: Option<LegacySlot>,
    #[serde(default)]
    pub previous: Option<LegacySlot>,
}

/// Version-1 two-slot document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyDocument {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub active_slot: Option<LegacySlotName>,
    #[serde(default)]
    pub slots: LegacySlots,
}

impl LegacyDocument {
    /// Populated slots in migration order (current first), tagged with
    /// whether each one was active.
    pub fn populated(self) -> Vec<(LegacySlot, bool)> {
        let active = self.active_slot;
        [
            (self.slots.current, LegacySlotName::Current),
            (self.slots.previous, LegacySlotName::Previous),
        ]
        .into_iter()
        .filter_map(|(slot, name)| slot.map(|s| (s, active == Some(name))))
        .collect()
    }
}
