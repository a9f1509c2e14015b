//! Capture upload, list, and detail (§4.6 step "uploadCapture", §6). The
//! upload handler is the critical path: admission, size/media checks, rate
//! limiting, content-addressed storage, idempotent creation, and dispatch —
//! each step maps directly onto §4.6's eight numbered steps.

use axum::extract::multipart::Field;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use songbird_core::dispatcher::SubmitOutcome;
use songbird_core::model::{clamp_list_limit, Capture, CaptureCursor, CapturePatch, CaptureStatus};
use songbird_core::repository::{CreateCaptureOutcome, RepoError};
use songbird_core::store::content_hash;

use crate::auth::AuthenticatedUser;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub capture_id: String,
    pub status: CaptureStatus,
}

#[derive(Default)]
struct ParsedUpload {
    device_id: Option<String>,
    device_sequence: Option<i64>,
    audio_bytes: Option<Vec<u8>>,
    content_type: Option<String>,
}

const ALLOWED_CONTENT_TYPE_PREFIXES: [&str; 2] = ["audio/", "application/octet-stream"];

/// Step 1: admission — the device must exist and be owned by this user.
/// Checked as soon as `device_id` is known, before any `audio_file` bytes
/// are read off the wire.
async fn check_device_ownership(
    state: &AppState,
    user_id: &str,
    device_id: &str,
) -> Result<(), ApiError> {
    let device = match state.repository.get_device(device_id).await {
        Ok(device) => device,
        Err(RepoError::DeviceNotFound(_)) => return Err(ApiError::NotOwned),
        Err(err) => return Err(err.into()),
    };
    if device.owner_user_id != user_id {
        return Err(ApiError::NotOwned);
    }
    Ok(())
}

/// Reads `field` in chunks, rejecting as soon as the running total crosses
/// `max_bytes` instead of buffering the whole (possibly oversized) body
/// first.
async fn read_bounded(mut field: Field<'_>, max_bytes: usize) -> Result<Vec<u8>, ApiError> {
    let mut buf = Vec::new();
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if buf.len() + chunk.len() > max_bytes {
            return Err(ApiError::PayloadTooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

pub async fn upload(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let mut parsed = ParsedUpload::default();
    let mut device_checked = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        match field.name().unwrap_or("") {
            "device_id" => {
                let device_id = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                check_device_ownership(&state, &user_id, &device_id).await?;
                device_checked = true;
                parsed.device_id = Some(device_id);
            }
            "device_sequence" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                parsed.device_sequence = Some(
                    raw.trim()
                        .parse()
                        .map_err(|_| ApiError::BadRequest("device_sequence must be an integer".to_string()))?,
                );
            }
            "audio_file" => {
                // `device_id` must arrive first in the multipart body — the
                // whole point of admission is to refuse a payload before it
                // is read, not after it has been buffered into memory.
                if !device_checked {
                    return Err(ApiError::BadRequest(
                        "device_id must precede audio_file in the multipart body".to_string(),
                    ));
                }
                parsed.content_type = field.content_type().map(str::to_string);
                parsed.audio_bytes = Some(read_bounded(field, state.max_upload_bytes).await?);
            }
            // `timestamp` is accepted per §6 but the received time of record
            // is the coordinator's own clock, not a client-supplied value —
            // a misbehaving or clock-skewed device must not be able to
            // forge `received_at` ordering used by pagination/the reaper.
            _ => {}
        }
    }

    let device_id = parsed
        .device_id
        .ok_or_else(|| ApiError::BadRequest("device_id is required".to_string()))?;
    let device_sequence = parsed
        .device_sequence
        .ok_or_else(|| ApiError::BadRequest("device_sequence is required".to_string()))?;
    let audio_bytes = parsed
        .audio_bytes
        .ok_or_else(|| ApiError::BadRequest("audio_file is required".to_string()))?;
    let content_type = parsed.content_type.unwrap_or_default();

    // Step 3: content-type check.
    if !ALLOWED_CONTENT_TYPE_PREFIXES
        .iter()
        .any(|prefix| content_type.starts_with(prefix))
    {
        return Err(ApiError::UnsupportedMedia);
    }

    // Step 4: per-device rate limit.
    if !state.rate_limiter.check(&device_id, state.clock.as_ref()) {
        return Err(ApiError::RateLimited {
            retry_after_secs: state.rate_limit_retry_after_secs,
        });
    }

    // Step 5: content-addressed clip storage.
    let hash = content_hash(&audio_bytes);
    state.clip_store.put(&hash, audio_bytes, &content_type).await?;

    // Step 6: idempotent capture creation.
    let received_at = state.clock.now();
    let outcome = state
        .repository
        .create_capture(&user_id, &device_id, &hash, device_sequence, received_at)
        .await?;

    let capture = match outcome {
        CreateCaptureOutcome::Created(capture) => capture,
        CreateCaptureOutcome::Duplicate(capture) => {
            return Ok((
                StatusCode::OK,
                Json(UploadResponse {
                    capture_id: capture.id,
                    status: capture.status,
                }),
            ));
        }
    };

    // Step 7: hand off to the dispatcher.
    match state.dispatcher.submit(capture.id.clone()) {
        SubmitOutcome::Accepted => Ok((
            StatusCode::ACCEPTED,
            Json(UploadResponse {
                capture_id: capture.id,
                status: CaptureStatus::Pending,
            }),
        )),
        SubmitOutcome::Busy => {
            let _ = state
                .repository
                .transition_capture(
                    &capture.id,
                    &[CaptureStatus::Pending],
                    CaptureStatus::Failed,
                    CapturePatch::failed("Busy"),
                )
                .await;
            Err(ApiError::Busy {
                retry_after_secs: 1,
            })
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub cursor: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub captures: Vec<Capture>,
    pub next_cursor: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let cursor = match query.cursor {
        Some(raw) => Some(
            CaptureCursor::decode(&raw).ok_or_else(|| ApiError::BadRequest("invalid cursor".to_string()))?,
        ),
        None => None,
    };
    let limit = clamp_list_limit(query.limit);

    let page = state.repository.list_captures(&user_id, cursor, limit).await?;
    Ok(Json(ListResponse {
        captures: page.captures,
        next_cursor: page.next_cursor.map(|c| c.encode()),
    }))
}

pub async fn get_one(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(capture_id): Path<String>,
) -> Result<Json<Capture>, ApiError> {
    let capture = match state.repository.get_capture(&capture_id).await {
        Ok(capture) => capture,
        Err(RepoError::CaptureNotFound(id)) => return Err(ApiError::NotFound(format!("capture {id}"))),
        Err(err) => return Err(err.into()),
    };
    if capture.user_id != user_id {
        return Err(ApiError::NotFound(format!("capture {capture_id}")));
    }
    Ok(Json(capture))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_response_serializes_camel_case() {
        let body = UploadResponse {
            capture_id: "cap-1".to_string(),
            status: CaptureStatus::Pending,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["captureId"], "cap-1");
        assert_eq!(json["status"], "pending");
    }

    #[test]
    fn content_type_allowlist_accepts_audio_and_rejects_others() {
        let ok = |ct: &str| ALLOWED_CONTENT_TYPE_PREFIXES.iter().any(|p| ct.starts_with(p));
        assert!(ok("audio/wav"));
        assert!(ok("application/octet-stream"));
        assert!(!ok("image/png"));
    }
}
