//! Admin API for the account pool and saved profiles
//!
//! Every command reloads the pool document before mutating, so edits made by
//! another process sharing the file are never overwritten. Responses never
//! carry refresh secrets or access tokens; only `/credential` hands out a
//! bearer token, to the host pipeline.
//!
//! Endpoints:
//! - GET    /admin/accounts                     list accounts with status
//! - POST   /admin/accounts/import              import the live credential
//! - DELETE /admin/accounts/{selector}          remove an account
//! - POST   /admin/accounts/{selector}/switch   make an account active
//! - POST   /admin/accounts/{selector}/rename   relabel an account
//! - PUT    /admin/mode                         set the rotation mode
//! - POST   /admin/next                         force rotation
//! - GET    /admin/status                       pool summary
//! - POST   /admin/rate-limits/clear            drop every rate-limit marker
//! - GET    /admin/profiles                     list saved profiles
//! - POST   /admin/profiles/save                save the live credential
//! - POST   /admin/profiles/next                activate the next profile
//! - POST   /admin/profiles/{selector}/switch   activate a profile
//! - POST   /admin/profiles/{selector}/rename   relabel a profile
//! - DELETE /admin/profiles/{selector}          delete a profile
//! - POST   /credential                         select a bearer credential
//! - POST   /outcome                            report an upstream outcome

use std::sync::Arc;

use account_pool::{ImportOutcome, PoolManager, ProfileStore, RotationMode};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use common::now_millis;
use oauth_auth::AuthStore;
use provider::{CredentialProvider, Outcome};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::metrics::record_command;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<PoolManager>,
    profiles: Arc<ProfileStore>,
    auth: Arc<AuthStore>,
    provider_id: String,
}

impl AdminState {
    pub fn new(
        pool: Arc<PoolManager>,
        profiles: Arc<ProfileStore>,
        auth: Arc<AuthStore>,
        provider_id: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            profiles,
            auth,
            provider_id: provider_id.into(),
        }
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }
}

/// Build the admin router with the account, profile and host pipeline routes.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/accounts", get(list_accounts))
        .route("/admin/accounts/import", post(import_account))
        .route("/admin/accounts/{selector}", delete(remove_account))
        .route("/admin/accounts/{selector}/switch", post(switch_account))
        .route("/admin/accounts/{selector}/rename", post(rename_account))
        .route("/admin/mode", put(set_mode))
        .route("/admin/next", post(force_next))
        .route("/admin/status", get(pool_status))
        .route("/admin/rate-limits/clear", post(clear_rate_limits))
        .route("/admin/profiles", get(list_profiles))
        .route("/admin/profiles/save", post(save_profile))
        .route("/admin/profiles/next", post(cycle_profile))
        .route("/admin/profiles/{selector}", delete(remove_profile))
        .route("/admin/profiles/{selector}/switch", post(switch_profile))
        .route("/admin/profiles/{selector}/rename", post(rename_profile))
        .route("/credential", post(select_credential))
        .route("/outcome", post(report_outcome))
        .with_state(state)
}

#[derive(Deserialize)]
struct LabelRequest {
    #[serde(default)]
    label: Option<String>,
}

#[derive(Deserialize)]
struct RenameRequest {
    label: String,
}

#[derive(Deserialize)]
struct ModeRequest {
    mode: RotationMode,
}

/// Serialize `body` as a JSON response.
fn json<T: Serialize>(status: StatusCode, body: &T) -> Response {
    match serde_json::to_string(body) {
        Ok(text) => (status, [(CONTENT_TYPE, "application/json")], text).into_response(),
        Err(e) => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to serialize response: {e}"),
        )
        .into_response(),
    }
}

/// Turn a command result into a response and count it.
fn respond<T: Serialize, E: Into<ApiError>>(
    command: &'static str,
    status: StatusCode,
    result: Result<T, E>,
) -> Response {
    let response = match result {
        Ok(body) => json(status, &body),
        Err(e) => e.into().into_response(),
    };
    record_command(command, response.status().as_u16());
    response
}

/// GET /admin/accounts
async fn list_accounts(State(state): State<AdminState>) -> Response {
    let accounts = state.pool.list(now_millis()).await;
    respond::<_, ApiError>(
        "list",
        StatusCode::OK,
        Ok(serde_json::json!({ "accounts": accounts })),
    )
}

/// POST /admin/accounts/import: add the credential currently in the auth
/// store. 201 when a new account was added, 200 when it was already pooled.
async fn import_account(
    State(state): State<AdminState>,
    Json(body): Json<LabelRequest>,
) -> Response {
    let result = state
        .pool
        .import_live(
            &state.auth,
            &state.provider_id,
            body.label.as_deref(),
            now_millis(),
        )
        .await;
    let status = match &result {
        Ok(ImportOutcome::Added { .. }) => StatusCode::CREATED,
        _ => StatusCode::OK,
    };
    respond("import", status, result)
}

/// DELETE /admin/accounts/{selector}
async fn remove_account(
    State(state): State<AdminState>,
    Path(selector): Path<String>,
) -> Response {
    respond("remove", StatusCode::OK, state.pool.remove(&selector).await)
}

/// POST /admin/accounts/{selector}/switch
async fn switch_account(
    State(state): State<AdminState>,
    Path(selector): Path<String>,
) -> Response {
    respond("switch", StatusCode::OK, state.pool.switch_to(&selector).await)
}

/// POST /admin/accounts/{selector}/rename
async fn rename_account(
    State(state): State<AdminState>,
    Path(selector): Path<String>,
    Json(body): Json<RenameRequest>,
) -> Response {
    respond(
        "rename",
        StatusCode::OK,
        state.pool.rename(&selector, &body.label).await,
    )
}

/// PUT /admin/mode: an unknown mode is rejected by the JSON extractor (422).
async fn set_mode(State(state): State<AdminState>, Json(body): Json<ModeRequest>) -> Response {
    respond("mode", StatusCode::OK, state.pool.set_mode(body.mode).await)
}

/// POST /admin/next
async fn force_next(State(state): State<AdminState>) -> Response {
    respond("next", StatusCode::OK, state.pool.force_next(now_millis()).await)
}

/// GET /admin/status
async fn pool_status(State(state): State<AdminState>) -> Response {
    let status = state.pool.status(now_millis()).await;
    respond::<_, ApiError>("status", StatusCode::OK, Ok(status))
}

/// POST /admin/rate-limits/clear
async fn clear_rate_limits(State(state): State<AdminState>) -> Response {
    let result = state
        .pool
        .clear_rate_limits()
        .await
        .map(|cleared| serde_json::json!({ "cleared": cleared }));
    respond("clear-rate-limits", StatusCode::OK, result)
}

/// GET /admin/profiles
async fn list_profiles(State(state): State<AdminState>) -> Response {
    let profiles = state.profiles.list().await;
    respond::<_, ApiError>(
        "profiles",
        StatusCode::OK,
        Ok(serde_json::json!({ "profiles": profiles })),
    )
}

/// POST /admin/profiles/save
async fn save_profile(
    State(state): State<AdminState>,
    Json(body): Json<LabelRequest>,
) -> Response {
    let result = state
        .profiles
        .save_current(body.label.as_deref(), now_millis())
        .await;
    let status = match &result {
        Ok(saved) if saved.created => StatusCode::CREATED,
        _ => StatusCode::OK,
    };
    respond("profile-save", status, result)
}

/// POST /admin/profiles/next
async fn cycle_profile(State(state): State<AdminState>) -> Response {
    respond("profile-next", StatusCode::OK, state.profiles.cycle().await)
}

/// POST /admin/profiles/{selector}/switch
async fn switch_profile(
    State(state): State<AdminState>,
    Path(selector): Path<String>,
) -> Response {
    respond(
        "profile-switch",
        StatusCode::OK,
        state.profiles.switch_to(&selector).await,
    )
}

/// POST /admin/profiles/{selector}/rename
async fn rename_profile(
    State(state): State<AdminState>,
    Path(selector): Path<String>,
    Json(body): Json<RenameRequest>,
) -> Response {
    respond(
        "profile-rename",
        StatusCode::OK,
        state.profiles.rename(&selector, &body.label).await,
    )
}

/// DELETE /admin/profiles/{selector}
async fn remove_profile(
    State(state): State<AdminState>,
    Path(selector): Path<String>,
) -> Response {
    respond(
        "profile-remove",
        StatusCode::OK,
        state.profiles.remove(&selector).await,
    )
}

/// POST /credential: bearer credential for the host's next outbound call.
async fn select_credential(State(state): State<AdminState>) -> Response {
    let result = CredentialProvider::select_credential(state.pool.as_ref(), now_millis()).await;
    respond("credential", StatusCode::OK, result)
}

/// POST /outcome: result of the host's last outbound call.
async fn report_outcome(
    State(state): State<AdminState>,
    Json(outcome): Json<Outcome>,
) -> Response {
    let result = CredentialProvider::report_outcome(state.pool.as_ref(), &outcome)
        .await
        .map(|()| serde_json::json!({ "status": "recorded" }));
    respond("outcome", StatusCode::OK, result)
}


#[cfg(test)]
mod tests {
    use super::testing::{live_refresh, set_live, test_state};
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    async fn call(
        state: &AdminState,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let app = build_admin_router(state.clone());
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header(CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, json)
    }

    /// Import each secret through the API with the secret as its label.
    async fn import_all(state: &AdminState, secrets: &[&str]) {
        for secret in secrets {
            set_live(state, secret).await;
            let (status, _) = call(
                state,
                Method::POST,
                "/admin/accounts/import",
                Some(serde_json::json!({ "label": secret })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }
    }

    #[tokio::test]
    async fn list_accounts_empty_pool() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), &[]).await;

        let (status, json) = call(&state, Method::GET, "/admin/accounts", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["accounts"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn import_is_idempotent_and_hides_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), &[]).await;
        set_live(&state, "rt_secret_work").await;

        let (status, json) = call(
            &state,
            Method::POST,
            "/admin/accounts/import",
            Some(serde_json::json!({ "label": "work" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["outcome"], "added");
        assert_eq!(json["label"], "work");

        let (status, json) = call(
            &state,
            Method::POST,
            "/admin/accounts/import",
            Some(serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["outcome"], "existing");

        let (_, json) = call(&state, Method::GET, "/admin/accounts", None).await;
        let accounts = json["accounts"].as_array().unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0]["label"], "work");
        assert_eq!(accounts[0]["active"], true);
        assert!(
            !json.to_string().contains("rt_secret_work"),
            "refresh secret must never be listed"
        );
    }

    #[tokio::test]
    async fn import_without_live_credential_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), &[]).await;

        let (status, json) = call(
            &state,
            Method::POST,
            "/admin/accounts/import",
            Some(serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].as_str().unwrap().contains("anthropic"));
    }

    #[tokio::test]
    async fn switch_rename_and_remove_by_selector() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), &[]).await;
        import_all(&state, &["work", "home"]).await;

        let (status, json) =
            call(&state, Method::POST, "/admin/accounts/home/switch", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["before"], "work");
        assert_eq!(json["after"], "home");

        let (status, json) = call(
            &state,
            Method::POST,
            "/admin/accounts/1/rename",
            Some(serde_json::json!({ "label": "office" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["after"], "office");

        let (status, _) = call(&state, Method::DELETE, "/admin/accounts/office", None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, json) = call(&state, Method::GET, "/admin/status", None).await;
        assert_eq!(json["total"], 1);
        assert_eq!(json["active"], "home");
    }

    #[tokio::test]
    async fn selector_errors_map_to_status_codes() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), &[]).await;
        import_all(&state, &["work", "home"]).await;

        let (status, _) = call(&state, Method::POST, "/admin/accounts/nope/switch", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &state,
            Method::POST,
            "/admin/accounts/work/rename",
            Some(serde_json::json!({ "label": "home" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(
            &state,
            Method::POST,
            "/admin/accounts/work/rename",
            Some(serde_json::json!({ "label": "  " })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = call(&state, Method::DELETE, "/admin/accounts/9", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn set_mode_accepts_known_modes_only() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), &[]).await;

        let (status, json) = call(
            &state,
            Method::PUT,
            "/admin/mode",
            Some(serde_json::json!({ "mode": "manual" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["before"], "use-until-exhausted");
        assert_eq!(json["after"], "manual");

        let (status, _) = call(
            &state,
            Method::PUT,
            "/admin/mode",
            Some(serde_json::json!({ "mode": "fastest" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (_, json) = call(&state, Method::GET, "/admin/status", None).await;
        assert_eq!(json["mode"], "manual");
    }

    #[tokio::test]
    async fn force_next_on_empty_pool_is_503() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), &[]).await;

        let (status, _) = call(&state, Method::POST, "/admin/next", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _) = call(&state, Method::POST, "/credential", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn force_next_rotates_active_account() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), &[]).await;
        import_all(&state, &["work", "home"]).await;

        let (status, json) = call(&state, Method::POST, "/admin/next", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["before"], "work");
        assert_eq!(json["after"], "home");
    }

    #[tokio::test]
    async fn credential_and_outcome_drive_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), &[]).await;
        import_all(&state, &["work", "home"]).await;

        let (status, json) = call(&state, Method::POST, "/credential", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["account"], "work");
        assert_eq!(json["access_token"], "at_work");

        let (status, json) = call(
            &state,
            Method::POST,
            "/outcome",
            Some(serde_json::json!({
                "result": "failure",
                "status": 429,
                "message": "rate limited, retry in 30s"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "recorded");

        let (_, json) = call(&state, Method::POST, "/credential", None).await;
        assert_eq!(json["account"], "home");

        let (_, json) = call(&state, Method::GET, "/admin/status", None).await;
        assert_eq!(json["rate_limited"], 1);

        let (status, json) = call(&state, Method::POST, "/admin/rate-limits/clear", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["cleared"], 1);

        let (_, json) = call(&state, Method::GET, "/admin/status", None).await;
        assert_eq!(json["rate_limited"], 0);
    }

    #[tokio::test]
    async fn rejected_refresh_everywhere_is_502() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), &["work", "home"]).await;
        import_all(&state, &["work", "home"]).await;

        let (status, json) = call(&state, Method::POST, "/credential", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(json["error"].as_str().unwrap().contains("invalid_grant"));

        let (_, json) = call(&state, Method::GET, "/admin/accounts", None).await;
        for account in json["accounts"].as_array().unwrap() {
            assert!(account["last_error"].is_string());
        }
    }

    #[tokio::test]
    async fn rejected_refresh_falls_back_to_next_account() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), &["work"]).await;
        import_all(&state, &["work", "home"]).await;

        let (status, json) = call(&state, Method::POST, "/credential", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["account"], "home");
    }

    #[tokio::test]
    async fn outcome_with_bad_body_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), &[]).await;

        let (status, _) = call(
            &state,
            Method::POST,
            "/outcome",
            Some(serde_json::json!({ "result": "maybe" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn profiles_save_cycle_and_switch() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), &[]).await;

        set_live(&state, "rt_work").await;
        let (status, json) = call(
            &state,
            Method::POST,
            "/admin/profiles/save",
            Some(serde_json::json!({ "label": "work" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["created"], true);

        set_live(&state, "rt_home").await;
        let (status, _) = call(
            &state,
            Method::POST,
            "/admin/profiles/save",
            Some(serde_json::json!({ "label": "home" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, json) = call(&state, Method::POST, "/admin/profiles/next", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["after"], "work");
        assert_eq!(live_refresh(&state).await.as_deref(), Some("rt_work"));

        let (status, _) =
            call(&state, Method::POST, "/admin/profiles/home/switch", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(live_refresh(&state).await.as_deref(), Some("rt_home"));

        let (_, json) = call(&state, Method::GET, "/admin/profiles", None).await;
        let profiles = json["profiles"].as_array().unwrap();
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[1]["active"], true);
        assert!(!json.to_string().contains("rt_home"));
    }

    #[tokio::test]
    async fn profile_rename_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), &[]).await;
        set_live(&state, "rt_work").await;
        call(
            &state,
            Method::POST,
            "/admin/profiles/save",
            Some(serde_json::json!({ "label": "work" })),
        )
        .await;

        let (status, json) = call(
            &state,
            Method::POST,
            "/admin/profiles/work/rename",
            Some(serde_json::json!({ "label": "office" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["after"], "office");

        let (status, _) = call(&state, Method::DELETE, "/admin/profiles/office", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&state, Method::DELETE, "/admin/profiles/office", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&state, Method::POST, "/admin/profiles/next", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        // The auth store is left untouched by profile removal
        assert_eq!(live_refresh(&state).await.as_deref(), Some("rt_work"));
    }
}
