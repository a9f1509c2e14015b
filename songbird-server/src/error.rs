//! `ApiError` (§7): the ingress-facing error taxonomy, mapped deterministically
//! to HTTP responses through a single `IntoResponse` impl — the same "one
//! error enum, one response mapping" shape the example pack's axum services
//! use for their app-error wrappers.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use songbird_core::repository::RepoError;
use songbird_core::store::StoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing credentials")]
    AuthMissing,

    #[error("invalid credentials")]
    AuthInvalid,

    #[error("device not owned by authenticated user")]
    NotOwned,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("unsupported media type")]
    UnsupportedMedia,

    #[error("rate limited")]
    RateLimited { retry_after_secs: u64 },

    #[error("dispatcher busy")]
    Busy { retry_after_secs: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match self {
            ApiError::AuthMissing => "auth_missing",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::NotOwned => "not_owned",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::PayloadTooLarge => "payload_too_large",
            ApiError::UnsupportedMedia => "unsupported_media",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::Busy { .. } => "busy",
            ApiError::NotFound(_) => "not_found",
            ApiError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::AuthMissing | ApiError::AuthInvalid => StatusCode::UNAUTHORIZED,
            ApiError::NotOwned => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::UnsupportedMedia => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Busy { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self, ApiError::Internal(_)) {
            tracing::error!(error = %self, "internal error serving request");
        }
        let status = self.status();
        let retry_after = match &self {
            ApiError::RateLimited { retry_after_secs } | ApiError::Busy { retry_after_secs } => {
                Some(*retry_after_secs)
            }
            _ => None,
        };
        let body = Json(json!(ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        }));
        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = header::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Repository errors surfaced during ingress operations where no more
/// specific mapping applies (`DuplicateSequence` is handled by the caller
/// before this conversion ever runs, per §4.6 step 6).
impl From<RepoError> for ApiError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::DeviceNotFound(id) => ApiError::NotFound(format!("device {id}")),
            RepoError::CaptureNotFound(id) => ApiError::NotFound(format!("capture {id}")),
            RepoError::SpeciesNotFound(code) => ApiError::NotFound(format!("species {code}")),
            RepoError::NotOwned => ApiError::NotOwned,
            RepoError::DuplicateSequence | RepoError::InvalidTransition => {
                ApiError::Internal(anyhow::anyhow!(err))
            }
            RepoError::Backend(msg) => ApiError::Internal(anyhow::anyhow!(msg)),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Internal(anyhow::anyhow!(err))
    }
}
