//! Host authentication store
//!
//! The host keeps one JSON document mapping provider keys to the single
//! credential it currently uses for that provider. The pool reads the live
//! credential from here on import and overwrites it when a profile is
//! activated. Keys belonging to other providers are preserved untouched.
//!
//! All writes use atomic temp-file + rename with 0600 permissions.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::constants::CREDENTIAL_TYPE_OAUTH;
use crate::error::{Error, Result};

/// One provider's OAuth credential as stored by the host.
///
/// `expires` is a unix timestamp in milliseconds (absolute, not a delta).
/// Unknown fields (email, account id, project id, ...) ride along in `extra`
/// so a credential survives a read/write cycle unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthCredential {
    #[serde(rename = "type", default = "default_credential_type")]
    pub credential_type: String,
    /// Refresh secret for obtaining new access tokens
    pub refresh: String,
    /// Current access token, empty when the host never fetched one
    #[serde(default)]
    pub access: String,
    /// Expiration as unix timestamp in milliseconds
    #[serde(default)]
    pub expires: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_credential_type() -> String {
    CREDENTIAL_TYPE_OAUTH.to_string()
}

impl OAuthCredential {
    /// Credential carrying only a refresh secret.
    pub fn from_refresh(refresh: impl Into<String>) -> Self {
        Self {
            credential_type: default_credential_type(),
            refresh: refresh.into(),
            access: String::new(),
            expires: 0,
            extra: serde_json::Map::new(),
        }
    }

    /// String-valued extra field, trying each key in order.
    pub fn extra_str(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .find_map(|k| self.extra.get(*k).and_then(|v| v.as_str()))
            .filter(|s| !s.is_empty())
    }
}

/// Serialized access to the host's auth file.
pub struct AuthStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AuthStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the live credential for `provider`.
    ///
    /// A missing file or missing key is `Ok(None)`. A malformed document is an
    /// error: the caller asked for a specific credential and should see why it
    /// could not be read.
    pub async fn read(&self, provider: &str) -> Result<Option<OAuthCredential>> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read_document().await?;
        match doc.remove(provider) {
            Some(value) => {
                let credential = serde_json::from_value(value).map_err(|e| {
                    Error::CredentialParse(format!("auth entry for {provider}: {e}"))
                })?;
                Ok(Some(credential))
            }
            None => Ok(None),
        }
    }

    /// Overwrite the live credential for `provider`, keeping other entries.
    pub async fn write(&self, provider: &str, credential: &OAuthCredential) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read_document().await?;
        let value = serde_json::to_value(credential)
            .map_err(|e| Error::CredentialParse(format!("serializing credential: {e}")))?;
        doc.insert(provider.to_string(), value);
        write_json_atomic(&self.path, &doc).await?;
        info!(provider, path = %self.path.display(), "live credential updated");
        Ok(())
    }

    async fn read_document(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(serde_json::Map::new());
        }
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Io(format!("reading auth file: {e}")))?;
        if contents.trim().is_empty() {
            return Ok(serde_json::Map::new());
        }
        serde_json::from_str(&contents)
            .map_err(|e| Error::CredentialParse(format!("parsing auth file: {e}")))
    }
}

/// Write a JSON document to `path` atomically.
///
/// Writes to a temporary sibling file, then renames it over the target so a
/// reader never observes a half-written document. Missing parent directories
/// are created. Permissions are 0600 on unix since every document this
/// workspace writes contains refresh secrets.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| Error::CredentialParse(format!("serializing document: {e}")))?;

    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| Error::Io(format!("creating {}: {e}", dir.display())))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::Io(format!("{} has no file name", path.display())))?;
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options
        .open(&tmp_path)
        .await
        .map_err(|e| Error::Io(format!("creating temp file: {e}")))?;

    // A stale temp file from a crashed run keeps its old mode.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| Error::Io(format!("setting file permissions: {e}")))?;
    }

    file.write_all(json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp file: {e}")))?;
    file.sync_all()
        .await
        .map_err(|e| Error::Io(format!("syncing temp file: {e}")))?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp file: {e}")))?;

    debug!(path = %path.display(), "persisted document");
    Ok(())
}
