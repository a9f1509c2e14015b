//! Data model (§3): `User`, `Device`, `Species`, `Capture`.
//!
//! Rows are independent, joined by id — no in-memory back-references (the
//! teacher's cyclic `Device ↔ Capture ↔ Species` graph is exactly the
//! pattern the design notes call out for re-architecture). Any traversal is
//! an explicit `Repository` query.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a clip owner. Immutable after creation except credential
/// rotation, both of which are out of scope (registration/auth are external
/// collaborators) — the Coordinator core only ever reads `User::id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub handle: String,
}

/// A physical capture endpoint, registered-on-first-use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub owner_user_id: String,
    pub firmware_version: String,
    pub capabilities: HashMap<String, serde_json::Value>,
    pub last_seen: DateTime<Utc>,
    pub last_battery_voltage: Option<f32>,
    pub last_rssi: Option<i32>,
    /// Highest `device_sequence` accepted so far; used only for observability —
    /// deduplication itself is enforced by the repository's unique constraint.
    pub last_sequence: i64,
}

/// A classifier output identity, unique by `code`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Species {
    pub code: String,
    pub common_name: String,
    pub scientific_name: String,
    pub image_url: Option<String>,
    pub gif_url: Option<String>,
}

impl Species {
    pub fn has_asset(&self) -> bool {
        self.image_url.is_some() || self.gif_url.is_some()
    }
}

/// Capture lifecycle state (§4.4). Terminal: `Processed`, `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStatus {
    Pending,
    Classifying,
    Classified,
    Generating,
    Processed,
    Failed,
}

impl CaptureStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CaptureStatus::Processed | CaptureStatus::Failed)
    }
}

/// The top-level record of one uploaded clip.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capture {
    pub id: String,
    pub user_id: String,
    pub device_id: String,
    pub device_sequence: i64,
    pub clip_key: String,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub status: CaptureStatus,
    pub species_id: Option<String>,
    pub confidence: Option<f32>,
    pub failure_reason: Option<String>,
    pub note: Option<String>,
    pub attempt: i32,
}

impl Capture {
    pub fn new_pending(
        id: String,
        user_id: String,
        device_id: String,
        device_sequence: i64,
        clip_key: String,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            device_id,
            device_sequence,
            clip_key,
            received_at,
            processed_at: None,
            status: CaptureStatus::Pending,
            species_id: None,
            confidence: None,
            failure_reason: None,
            note: None,
            attempt: 0,
        }
    }
}

/// A patch applied by `Repository::transition_capture`. Only non-`None`
/// fields are written; this keeps the conditional write (the sole
/// concurrency-control mechanism per §4.2) a single, narrow statement.
#[derive(Debug, Clone, Default)]
pub struct CapturePatch {
    pub attempt_increment: bool,
    pub species_id: Option<String>,
    pub confidence: Option<f32>,
    pub failure_reason: Option<String>,
    pub note: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl CapturePatch {
    pub fn claim() -> Self {
        Self {
            attempt_increment: true,
            ..Default::default()
        }
    }

    pub fn classified(species_id: String, confidence: f32) -> Self {
        Self {
            species_id: Some(species_id),
            confidence: Some(confidence),
            ..Default::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn processed(at: DateTime<Utc>) -> Self {
        Self {
            processed_at: Some(at),
            ..Default::default()
        }
    }

    pub fn processed_with_note(at: DateTime<Utc>, note: impl Into<String>) -> Self {
        Self {
            processed_at: Some(at),
            note: Some(note.into()),
            ..Default::default()
        }
    }
}

/// Opaque pagination cursor for `Repository::list_captures` / `GET /v1/captures`.
///
/// Encodes `(received_at, capture_id)` so pagination remains stable even if
/// new captures are inserted between pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureCursor {
    pub received_at: DateTime<Utc>,
    pub capture_id: String,
}

impl CaptureCursor {
    pub fn encode(&self) -> String {
        let raw = serde_json::to_vec(self).expect("CaptureCursor always serializes");
        base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, raw)
    }

    pub fn decode(token: &str) -> Option<Self> {
        let raw = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, token)
            .ok()?;
        serde_json::from_slice(&raw).ok()
    }
}

pub const DEFAULT_LIST_LIMIT: u32 = 50;
pub const MAX_LIST_LIMIT: u32 = 200;

pub fn clamp_list_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}
