//! Admin API error responses
//!
//! Pool and provider errors are mapped to HTTP status codes here so handlers
//! can use `?` and still answer with a JSON `{"error": ...}` body.

use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use provider::ProviderError;
use tracing::warn;

/// Error returned by admin and host-pipeline handlers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<account_pool::Error> for ApiError {
    fn from(e: account_pool::Error) -> Self {
        use account_pool::Error;
        let status = match &e {
            Error::NotFound(_) | Error::NoLiveCredential(_) => StatusCode::NOT_FOUND,
            Error::Duplicate(_) => StatusCode::CONFLICT,
            Error::InvalidLabel(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::EmptyPool => StatusCode::SERVICE_UNAVAILABLE,
            Error::UpstreamAuth(_) => StatusCode::BAD_GATEWAY,
            Error::Persist { .. } | Error::AuthStore(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<ProviderError> for ApiError {
    fn from(e: ProviderError) -> Self {
        let status = match &e {
            ProviderError::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProviderError::Auth(_) => StatusCode::BAD_GATEWAY,
            ProviderError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self.message, "admin request failed");
        }
        (
            status,
            [(CONTENT_TYPE, "application/json")],
            serde_json::json!({ "error": self.message }).to_string(),
        )
            .into_response()
    }
}
