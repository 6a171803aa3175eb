//! Profile switcher: named snapshots of the live credential
//!
//! The simpler sibling of the rotation pool. Each profile stores a complete
//! credential payload; switching writes that payload into the auth store so
//! whatever reads the store picks up the other login. There is no selection
//! policy, only explicit switching and cycling.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use oauth_auth::{AuthStore, OAuthCredential, identify};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::codec;
use crate::document::{Profile, ProfileDocument};
use crate::error::{Error, Result};
use crate::pool::Change;
use crate::resolver::{derive_label, label_taken, resolve, unique_label};

/// Result of `save_current`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedProfile {
    pub id: String,
    pub label: String,
    /// False when an existing profile with the same refresh secret was updated
    pub created: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileView {
    pub position: usize,
    pub id: String,
    pub label: String,
    pub email: Option<String>,
    pub active: bool,
    pub created_at: u64,
}

pub struct ProfileStore {
    path: PathBuf,
    auth: Arc<AuthStore>,
    provider: String,
    state: Mutex<ProfileDocument>,
}

impl ProfileStore {
    pub async fn load(path: PathBuf, auth: Arc<AuthStore>, provider: impl Into<String>) -> Self {
        let doc: ProfileDocument = codec::load(&path).await;
        info!(path = %path.display(), profiles = doc.profiles.len(), "profile store loaded");
        Self {
            path,
            auth,
            provider: provider.into(),
            state: Mutex::new(doc),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn reload(&self, state: &MutexGuard<'_, ProfileDocument>) -> ProfileDocument {
        match tokio::fs::try_exists(&self.path).await {
            Ok(true) => codec::load(&self.path).await,
            _ => (**state).clone(),
        }
    }

    async fn commit(
        &self,
        state: &mut MutexGuard<'_, ProfileDocument>,
        doc: ProfileDocument,
    ) -> Result<()> {
        codec::save(&self.path, &doc).await?;
        **state = doc;
        Ok(())
    }

    async fn live_credential(&self) -> Result<OAuthCredential> {
        self.auth
            .read(&self.provider)
            .await?
            .ok_or_else(|| Error::NoLiveCredential(self.provider.clone()))
    }

    /// Save the live credential as a profile and make it active.
    ///
    /// A profile with the same refresh secret is updated in place. An
    /// explicit label must be unique; a derived one is suffixed until it is.
    pub async fn save_current(&self, label: Option<&str>, now: u64) -> Result<SavedProfile> {
        let live = self.live_credential().await?;
        let label = label.map(str::trim).filter(|l| !l.is_empty());

        let mut state = self.state.lock().await;
        let mut doc = self.reload(&state).await;
        let existing = doc
            .profiles
            .iter()
            .position(|p| p.oauth.refresh == live.refresh);

        if let Some(label) = label
            && label_taken(&doc.profiles, label, existing)
        {
            return Err(Error::Duplicate(label.to_string()));
        }

        let identity = identify(&live);
        let saved = match existing {
            Some(index) => {
                let profile = &mut doc.profiles[index];
                profile.oauth = live;
                if identity.email.is_some() {
                    profile.email = identity.email;
                }
                if let Some(label) = label {
                    profile.label = label.to_string();
                }
                SavedProfile {
                    id: profile.id.clone(),
                    label: profile.label.clone(),
                    created: false,
                }
            }
            None => {
                let label = match label {
                    Some(label) => label.to_string(),
                    None => unique_label(
                        &derive_label(&identity, "profile", doc.profiles.len() + 1),
                        doc.profiles.iter().map(|p| p.label.as_str()),
                    ),
                };
                let profile = Profile {
                    id: uuid::Uuid::new_v4().to_string(),
                    label,
                    created_at: now,
                    email: identity.email,
                    oauth: live,
                };
                let saved = SavedProfile {
                    id: profile.id.clone(),
                    label: profile.label.clone(),
                    created: true,
                };
                doc.profiles.push(profile);
                saved
            }
        };
        doc.active_profile_id = Some(saved.id.clone());
        self.commit(&mut state, doc).await?;

        info!(profile = %saved.label, created = saved.created, "profile saved");
        Ok(saved)
    }

    /// Write the selected profile into the auth store and mark it active.
    pub async fn switch_to(&self, selector: &str) -> Result<Change> {
        let mut state = self.state.lock().await;
        let mut doc = self.reload(&state).await;
        let index = resolve(&doc.profiles, selector)
            .ok_or_else(|| Error::NotFound(selector.to_string()))?;
        self.activate(&mut state, &mut doc, index).await
    }

    /// Activate the profile after the active one, wrapping around.
    pub async fn cycle(&self) -> Result<Change> {
        let mut state = self.state.lock().await;
        let mut doc = self.reload(&state).await;
        if doc.profiles.is_empty() {
            return Err(Error::EmptyPool);
        }
        let next = doc
            .active_position()
            .map_or(0, |i| (i + 1) % doc.profiles.len());
        self.activate(&mut state, &mut doc, next).await
    }

    async fn activate(
        &self,
        state: &mut MutexGuard<'_, ProfileDocument>,
        doc: &mut ProfileDocument,
        index: usize,
    ) -> Result<Change> {
        let before = doc.active_label();
        let previous = doc.clone();

        // The live credential may hold tokens newer than the saved copy.
        if let Some(live) = self.auth.read(&self.provider).await?
            && let Some(saved) = doc
                .profiles
                .iter_mut()
                .find(|p| p.oauth.refresh == live.refresh)
        {
            debug!(profile = %saved.label, "syncing live credential into profile");
            saved.oauth = live;
        }

        // Profile document first: a failed save must not switch the live login.
        let target = doc.profiles[index].clone();
        doc.active_profile_id = Some(target.id.clone());
        self.commit(state, doc.clone()).await?;

        if let Err(e) = self.auth.write(&self.provider, &target.oauth).await {
            if let Err(rollback) = self.commit(state, previous).await {
                warn!(error = %rollback, "failed to roll back profile document");
            }
            return Err(e.into());
        }

        info!(profile = %target.label, "switched profile");
        Ok(Change {
            target: target.label.clone(),
            before,
            after: Some(target.label),
        })
    }

    /// Delete a profile. The auth store is left as is.
    pub async fn remove(&self, selector: &str) -> Result<Change> {
        let mut state = self.state.lock().await;
        let mut doc = self.reload(&state).await;
        let index = resolve(&doc.profiles, selector)
            .ok_or_else(|| Error::NotFound(selector.to_string()))?;

        let before = doc.active_label();
        let removed = doc.profiles.remove(index);
        if doc.active_profile_id.as_deref() == Some(removed.id.as_str()) {
            doc.active_profile_id = doc.profiles.first().map(|p| p.id.clone());
        }
        let after = doc.active_label();
        self.commit(&mut state, doc).await?;

        info!(profile = %removed.label, "profile removed");
        Ok(Change {
            target: removed.label,
            before,
            after,
        })
    }

    pub async fn rename(&self, selector: &str, label: &str) -> Result<Change> {
        let label = label.trim();
        if label.is_empty() {
            return Err(Error::InvalidLabel("label must not be empty".into()));
        }

        let mut state = self.state.lock().await;
        let mut doc = self.reload(&state).await;
        let index = resolve(&doc.profiles, selector)
            .ok_or_else(|| Error::NotFound(selector.to_string()))?;
        if label_taken(&doc.profiles, label, Some(index)) {
            return Err(Error::Duplicate(label.to_string()));
        }

        let before = std::mem::replace(&mut doc.profiles[index].label, label.to_string());
        self.commit(&mut state, doc).await?;

        info!(from = %before, to = label, "profile renamed");
        Ok(Change {
            target: before.clone(),
            before: Some(before),
            after: Some(label.to_string()),
        })
    }

    pub async fn list(&self) -> Vec<ProfileView> {
        let mut state = self.state.lock().await;
        let doc = self.reload(&state).await;
        *state = doc.clone();

        let active = doc.active_position();
        doc.profiles
            .iter()
            .enumerate()
            .map(|(i, p)| ProfileView {
                position: i + 1,
                id: p.id.clone(),
                label: p.label.clone(),
                email: p.email.clone(),
                active: active == Some(i),
                created_at: p.created_at,
            })
            .collect()
    }
}
