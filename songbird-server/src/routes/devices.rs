//! Device registration + heartbeat (§4.6). Both operations are idempotent;
//! the interesting behavior lives in `Repository::register_or_update_device`
//! / `touch_device`, not here — these handlers are thin admission + mapping
//! shims, the same shape the teacher's Tauri commands use over `storage`.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use songbird_core::model::Device;
use songbird_core::repository::RepoError;

use crate::auth::AuthenticatedUser;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub device_id: String,
    pub firmware_version: String,
    #[serde(default)]
    pub capabilities: HashMap<String, serde_json::Value>,
}

pub async fn register(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<Device>), ApiError> {
    if body.device_id.trim().is_empty() {
        return Err(ApiError::BadRequest("device_id is required".to_string()));
    }

    let existed = matches!(state.repository.get_device(&body.device_id).await, Ok(_));

    let device = state
        .repository
        .register_or_update_device(
            &body.device_id,
            &user_id,
            &body.firmware_version,
            body.capabilities,
            state.clock.now(),
        )
        .await?;

    let status = if existed { StatusCode::OK } else { StatusCode::CREATED };
    Ok((status, Json(device)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub battery_voltage: Option<f32>,
    pub rssi: Option<i32>,
}

pub async fn heartbeat(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(device_id): Path<String>,
    Json(body): Json<HeartbeatRequest>,
) -> Result<Json<Device>, ApiError> {
    let device = match state.repository.get_device(&device_id).await {
        Ok(device) => device,
        Err(RepoError::DeviceNotFound(id)) => return Err(ApiError::NotFound(format!("device {id}"))),
        Err(err) => return Err(err.into()),
    };
    if device.owner_user_id != user_id {
        return Err(ApiError::NotOwned);
    }

    let updated = state
        .repository
        .touch_device(&device_id, body.timestamp, body.battery_voltage, body.rssi)
        .await?;
    Ok(Json(updated))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_request_parses_camel_case_body() {
        let raw = r#"{"deviceId":"d1","firmwareVersion":"1.0","capabilities":{"mic":true}}"#;
        let parsed: RegisterRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.device_id, "d1");
        assert_eq!(parsed.firmware_version, "1.0");
        assert_eq!(parsed.capabilities.get("mic"), Some(&serde_json::Value::Bool(true)));
    }

    #[test]
    fn register_request_defaults_capabilities_when_absent() {
        let raw = r#"{"deviceId":"d1","firmwareVersion":"1.0"}"#;
        let parsed: RegisterRequest = serde_json::from_str(raw).unwrap();
        assert!(parsed.capabilities.is_empty());
    }
}
