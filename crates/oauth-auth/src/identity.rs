//! Account identity extraction
//!
//! Credentials rarely carry a clean identity field. Resolution order for the
//! email: an explicit `email` extra field, then the `email` /
//! `preferred_username` / `sub` claims of a JWT access or id token. The opaque
//! account id comes from `accountId` / `account_id` extras or the token's `sub`.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::auth_store::OAuthCredential;

/// Who a credential belongs to, as far as it can be told.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub email: Option<String>,
    pub account_id: Option<String>,
    pub project_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwtClaims {
    email: Option<String>,
    preferred_username: Option<String>,
    sub: Option<String>,
}

/// Derive the identity of a credential without any network calls.
pub fn identify(credential: &OAuthCredential) -> Identity {
    let claims = credential
        .extra_str(&["id_token", "idToken"])
        .and_then(decode_claims)
        .or_else(|| decode_claims(&credential.access));

    let email = credential
        .extra_str(&["email"])
        .map(str::to_string)
        .or_else(|| claims.as_ref().and_then(email_from_claims));

    let account_id = credential
        .extra_str(&["accountId", "account_id"])
        .map(str::to_string)
        .or_else(|| {
            claims
                .as_ref()
                .and_then(|c| c.sub.clone())
                .filter(|sub| !sub.contains('@'))
        });

    let project_id = credential
        .extra_str(&["projectId", "project_id"])
        .map(str::to_string);

    Identity {
        email,
        account_id,
        project_id,
    }
}

/// Short, stable, non-reversible tag for a refresh secret.
///
/// Used as the per-account lock key and in log fields so the secret itself
/// never leaves the credential documents.
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    digest.iter().take(6).map(|b| format!("{b:02x}")).collect()
}

fn decode_claims(token: &str) -> Option<JwtClaims> {
    let mut parts = token.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&decoded).ok()
}

fn email_from_claims(claims: &JwtClaims) -> Option<String> {
    if let Some(email) = claims.email.as_deref().filter(|e| !e.is_empty()) {
        return Some(email.to_string());
    }
    [&claims.preferred_username, &claims.sub]
        .into_iter()
        .flatten()
        .find(|v| v.contains('@'))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt(payload: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
        format!("{header}.{body}.sig")
    }

    #[test]
    fn explicit_email_wins() {
        let mut cred = OAuthCredential::from_refresh("rt");
        cred.extra.insert("email".into(), "me@work.dev".into());
        cred.access = jwt(serde_json::json!({"email": "other@x.dev"}));
        assert_eq!(identify(&cred).email.as_deref(), Some("me@work.dev"));
    }

    #[test]
    fn email_from_access_token_claims() {
        let mut cred = OAuthCredential::from_refresh("rt");
        cred.access = jwt(serde_json::json!({"sub": "user-123", "email": "jwt@x.dev"}));
        let id = identify(&cred);
        assert_eq!(id.email.as_deref(), Some("jwt@x.dev"));
        assert_eq!(id.account_id.as_deref(), Some("user-123"));
    }

    #[test]
    fn preferred_username_with_at_is_email() {
        let mut cred = OAuthCredential::from_refresh("rt");
        cred.extra.insert(
            "id_token".into(),
            jwt(serde_json::json!({"preferred_username": "pu@x.dev"})).into(),
        );
        assert_eq!(identify(&cred).email.as_deref(), Some("pu@x.dev"));
    }

    #[test]
    fn opaque_token_yields_extras_only() {
        let mut cred = OAuthCredential::from_refresh("rt");
        cred.access = "sk-ant-oat01-opaque".into();
        cred.extra.insert("accountId".into(), "acct_9f8e7d6c5b".into());
        cred.extra.insert("projectId".into(), "proj-42".into());
        let id = identify(&cred);
        assert!(id.email.is_none());
        assert_eq!(id.account_id.as_deref(), Some("acct_9f8e7d6c5b"));
        assert_eq!(id.project_id.as_deref(), Some("proj-42"));
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        assert_eq!(fingerprint("rt_a"), fingerprint("rt_a"));
        assert_ne!(fingerprint("rt_a"), fingerprint("rt_b"));
        assert_eq!(fingerprint("rt_a").len(), 12);
        assert!(!fingerprint("rt_secret").contains("secret"));
    }
}
