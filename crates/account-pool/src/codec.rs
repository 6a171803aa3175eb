//! Credential codec: load, save, and migrate persisted documents
//!
//! `load` never fails. A missing, unreadable, or malformed file yields the
//! empty default document (logged), so a broken file degrades to "no
//! accounts" instead of taking the service down. Version-1 two-slot documents
//! are upgraded in memory on read; callers only ever see current shapes.

use std::path::Path;

use oauth_auth::{DEFAULT_REFRESH_MARGIN_MS, identify};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::document::{
    Account, CURRENT_VERSION, LegacyDocument, PoolDocument, Profile, ProfileDocument,
};
use crate::error::{Error, Result};
use crate::resolver::{derive_label, unique_label};

/// A persisted document shape with a legacy upgrade path.
pub trait Document: Default + Serialize + DeserializeOwned {
    /// Name used in log events
    const KIND: &'static str;

    /// Build the current shape from a version-1 document.
    fn from_legacy(legacy: LegacyDocument) -> Self;

    /// Repair invariants after decoding: version, labels, active pointer.
    fn normalize(&mut self);
}

impl Document for PoolDocument {
    const KIND: &'static str = "pool";

    fn from_legacy(legacy: LegacyDocument) -> Self {
        let mut doc = PoolDocument::default();
        for (slot, was_active) in legacy.populated() {
            if let Some(existing) = doc.position_of(&slot.oauth.refresh) {
                if was_active {
                    doc.active_index = Some(existing);
                }
                continue;
            }
            let base = match slot.label.trim() {
                "" => derive_label(&identify(&slot.oauth), "account", doc.accounts.len() + 1),
                label => label.to_string(),
            };
            let label = unique_label(&base, doc.accounts.iter().map(|a| a.label.as_str()));
            doc.accounts.push(Account::from_credential(
                &slot.oauth,
                label,
                slot.saved_at,
                DEFAULT_REFRESH_MARGIN_MS,
            ));
            if was_active {
                doc.active_index = Some(doc.accounts.len() - 1);
            }
        }
        doc
    }

    fn normalize(&mut self) {
        self.version = CURRENT_VERSION;
        for i in 0..self.accounts.len() {
            if !self.accounts[i].label.trim().is_empty() {
                continue;
            }
            let identity = oauth_auth::Identity {
                email: self.accounts[i].email.clone(),
                account_id: self.accounts[i].account_id.clone(),
                project_id: None,
            };
            let base = derive_label(&identity, "account", i + 1);
            let label = unique_label(&base, self.accounts.iter().map(|a| a.label.as_str()));
            self.accounts[i].label = label;
        }
        self.active_index = match self.active_index {
            _ if self.accounts.is_empty() => None,
            Some(i) if i < self.accounts.len() => Some(i),
            _ => Some(0),
        };
    }
}

impl Document for ProfileDocument {
    const KIND: &'static str = "profiles";

    fn from_legacy(legacy: LegacyDocument) -> Self {
        let mut doc = ProfileDocument::default();
        for (slot, was_active) in legacy.populated() {
            if let Some(existing) = doc
                .profiles
                .iter()
                .find(|p| p.oauth.refresh == slot.oauth.refresh)
            {
                if was_active {
                    doc.active_profile_id = Some(existing.id.clone());
                }
                continue;
            }
            let identity = identify(&slot.oauth);
            let base = match slot.label.trim() {
                "" => derive_label(&identity, "profile", doc.profiles.len() + 1),
                label => label.to_string(),
            };
            let label = unique_label(&base, doc.profiles.iter().map(|p| p.label.as_str()));
            let id = uuid::Uuid::new_v4().to_string();
            if was_active {
                doc.active_profile_id = Some(id.clone());
            }
            doc.profiles.push(Profile {
                id,
                label,
                created_at: slot.saved_at,
                email: identity.email,
                oauth: slot.oauth,
            });
        }
        doc
    }

    fn normalize(&mut self) {
        self.version = CURRENT_VERSION;
        for i in 0..self.profiles.len() {
            if !self.profiles[i].label.trim().is_empty() {
                continue;
            }
            let identity = oauth_auth::Identity {
                email: self.profiles[i].email.clone(),
                ..Default::default()
            };
            let base = derive_label(&identity, "profile", i + 1);
            let label = unique_label(&base, self.profiles.iter().map(|p| p.label.as_str()));
            self.profiles[i].label = label;
        }
        if self.active_position().is_none() {
            self.active_profile_id = self.profiles.first().map(|p| p.id.clone());
        }
    }
}

/// Load a document, falling back to the empty default on any failure.
pub async fn load<D: Document>(path: &Path) -> D {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(kind = D::KIND, path = %path.display(), "document not found, starting empty");
            return D::default();
        }
        Err(e) => {
            warn!(kind = D::KIND, path = %path.display(), error = %e, "document unreadable, starting empty");
            return D::default();
        }
    };

    match decode::<D>(&contents) {
        Ok(doc) => {
            debug!(kind = D::KIND, path = %path.display(), "document loaded");
            doc
        }
        Err(e) => {
            warn!(kind = D::KIND, path = %path.display(), error = %e, "document malformed, starting empty");
            D::default()
        }
    }
}

/// Decode document text, upgrading the legacy shape when present.
pub fn decode<D: Document>(contents: &str) -> serde_json::Result<D> {
    let value: serde_json::Value = serde_json::from_str(contents)?;
    if is_legacy(&value) {
        let legacy: LegacyDocument = serde_json::from_value(value)?;
        info!(kind = D::KIND, "upgrading legacy two-slot document");
        return Ok(migrate(legacy));
    }
    let mut doc: D = serde_json::from_value(value)?;
    doc.normalize();
    Ok(doc)
}

/// Upgrade a version-1 document to the current shape.
///
/// Slots are taken current-first; a slot whose refresh secret was already
/// taken is skipped, and if it was the active slot the retained entry with
/// the same secret becomes active instead.
pub fn migrate<D: Document>(legacy: LegacyDocument) -> D {
    let mut doc = D::from_legacy(legacy);
    doc.normalize();
    doc
}

/// Persist a document atomically.
pub async fn save<D: Document>(path: &Path, doc: &D) -> Result<()> {
    oauth_auth::write_json_atomic(path, doc)
        .await
        .map_err(|e| Error::Persist {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

fn is_legacy(value: &serde_json::Value) -> bool {
    value.get("slots").is_some_and(|s| s.is_object())
        && value
            .get("version")
            .and_then(|v| v.as_u64())
            .is_none_or(|v| v < u64::from(CURRENT_VERSION))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::RotationMode;

    fn legacy_json(active: &str, current: Option<&str>, previous: Option<&str>) -> String {
        let slot = |label: &str, refresh: &str| {
            serde_json::json!({
                "label": label,
                "savedAt": 1_700_000_000_000u64,
                "oauth": {"type": "oauth", "refresh": refresh, "access": "at", "expires": 1_700_000_900_000u64}
            })
        };
        let mut slots = serde_json::Map::new();
        if let Some(rt) = current {
            slots.insert("current".into(), slot("work", rt));
        }
        if let Some(rt) = previous {
            slots.insert("previous".into(), slot("personal", rt));
        }
        serde_json::json!({"version": 1, "activeSlot": active, "slots": slots}).to_string()
    }

    #[tokio::test]
    async fn missing_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let doc: PoolDocument = load(&dir.path().join("pool.json")).await;
        assert_eq!(doc, PoolDocument::default());
    }

    #[tokio::test]
    async fn malformed_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");
        tokio::fs::write(&path, "{ definitely not json").await.unwrap();
        let doc: PoolDocument = load(&path).await;
        assert!(doc.accounts.is_empty());
        assert_eq!(doc.active_index, None);
    }

    #[tokio::test]
    async fn wrong_shape_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");
        tokio::fs::write(&path, r#"{"accounts": "nope"}"#).await.unwrap();
        let doc: PoolDocument = load(&path).await;
        assert!(doc.accounts.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");

        let mut doc = PoolDocument {
            rotation_mode: RotationMode::UseUntilExhausted,
            ..Default::default()
        };
        let mut a = Account::new("work", "rt_work", 10);
        a.email = Some("work@x.dev".into());
        a.access_token = Some("at".into());
        a.access_token_expires = Some(99);
        a.rate_limit_reset_time = Some(1234);
        a.rate_limit_reason = Some("429".into());
        a.request_count = 7;
        a.extra.insert("tier".into(), "max".into());
        doc.accounts.push(a);
        doc.accounts.push(Account::new("home", "rt_home", 11));
        doc.active_index = Some(1);

        save(&path, &doc).await.unwrap();
        let loaded: PoolDocument = load(&path).await;
        assert_eq!(loaded, doc);
    }

    #[test]
    fn decode_current_document_is_not_migrated() {
        let mut doc = ProfileDocument::default();
        doc.profiles.push(Profile {
            id: "fixed-id".into(),
            label: "work".into(),
            created_at: 1,
            email: None,
            oauth: oauth_auth::OAuthCredential::from_refresh("rt"),
        });
        doc.active_profile_id = Some("fixed-id".into());

        let text = serde_json::to_string(&doc).unwrap();
        let once: ProfileDocument = decode(&text).unwrap();
        let twice: ProfileDocument = decode(&serde_json::to_string(&once).unwrap()).unwrap();
        assert_eq!(once, doc);
        assert_eq!(twice, doc);
    }

    #[test]
    fn legacy_previous_only_migrates_to_one_active_profile() {
        let doc: ProfileDocument = decode(&legacy_json("previous", None, Some("rt_p"))).unwrap();
        assert_eq!(doc.version, CURRENT_VERSION);
        assert_eq!(doc.profiles.len(), 1);
        assert_eq!(doc.profiles[0].label, "personal");
        assert_eq!(doc.profiles[0].created_at, 1_700_000_000_000);
        assert_eq!(
            doc.active_profile_id.as_deref(),
            Some(doc.profiles[0].id.as_str())
        );
    }

    #[test]
    fn legacy_duplicate_secret_is_skipped_and_active_carried() {
        let doc: ProfileDocument =
            decode(&legacy_json("previous", Some("rt_same"), Some("rt_same"))).unwrap();
        assert_eq!(doc.profiles.len(), 1);
        assert_eq!(doc.profiles[0].label, "work");
        assert_eq!(
            doc.active_profile_id.as_deref(),
            Some(doc.profiles[0].id.as_str())
        );
    }

    #[test]
    fn legacy_migrates_to_pool_preserving_active_slot() {
        let doc: PoolDocument = decode(&legacy_json("previous", Some("rt_c"), Some("rt_p"))).unwrap();
        assert_eq!(doc.accounts.len(), 2);
        assert_eq!(doc.accounts[0].refresh_token, "rt_c");
        assert_eq!(doc.accounts[1].refresh_token, "rt_p");
        assert_eq!(doc.active_index, Some(1));
        assert_eq!(doc.accounts[1].added_at, 1_700_000_000_000);
        assert_eq!(
            doc.accounts[1].access_token_expires,
            Some(1_700_000_900_000 - DEFAULT_REFRESH_MARGIN_MS)
        );
    }

    #[test]
    fn legacy_same_labels_are_deduplicated() {
        let json = serde_json::json!({
            "version": 1,
            "activeSlot": "current",
            "slots": {
                "current": {"label": "work", "savedAt": 1, "oauth": {"refresh": "rt_1"}},
                "previous": {"label": "Work", "savedAt": 2, "oauth": {"refresh": "rt_2"}}
            }
        })
        .to_string();
        let doc: PoolDocument = decode(&json).unwrap();
        assert_eq!(doc.accounts[0].label, "work");
        assert_eq!(doc.accounts[1].label, "Work 2");
        assert_eq!(doc.active_index, Some(0));
    }

    #[test]
    fn normalize_repairs_dangling_active_index() {
        let json = r#"{"version":2,"activeIndex":5,"rotationMode":"manual",
            "accounts":[{"label":"a","refreshToken":"rt_a"}]}"#;
        let doc: PoolDocument = decode(json).unwrap();
        assert_eq!(doc.active_index, Some(0));
        assert_eq!(doc.rotation_mode, RotationMode::Manual);
    }

    #[test]
    fn normalize_fills_missing_labels() {
        let json = r#"{"accounts":[{"email":"ops@corp.dev","refreshToken":"rt_a"},
            {"refreshToken":"rt_b"}]}"#;
        let doc: PoolDocument = decode(json).unwrap();
        assert_eq!(doc.accounts[0].label, "ops");
        assert_eq!(doc.accounts[1].label, "account 2");
        assert_eq!(doc.active_index, Some(0));
    }

    #[test]
    fn normalize_clears_active_on_empty_pool() {
        let doc: PoolDocument = decode(r#"{"activeIndex":0,"accounts":[]}"#).unwrap();
        assert_eq!(doc.active_index, None);
    }

    #[tokio::test]
    async fn save_to_unwritable_path_is_persist_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        tokio::fs::write(&blocker, "x").await.unwrap();
        let err = save(&blocker.join("pool.json"), &PoolDocument::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Persist { .. }), "got: {err:?}");
    }
}
