//! Self-describing completion/progress events published on the Event Bus
//! (§4.7/§6). Shape mirrors the teacher's `ipc::events` module: camelCase
//! wire format, a `kind` tag distinguishing message shapes, serde round-trip
//! tests alongside the types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureEventType {
    Progress,
    Processed,
    Failed,
}

/// Emitted on topic `user:<id>` for every capture state transition. Every
/// terminal transition publishes `processed`/`failed`; every non-terminal
/// transition publishes `progress` (best-effort — subscribers may miss
/// these, per §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureEvent {
    #[serde(rename = "type")]
    pub kind: CaptureEventType,
    pub capture_id: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub species_code: Option<String>,
    pub common_name: Option<String>,
    pub confidence: Option<f32>,
    pub asset_url: Option<String>,
    pub reason: Option<String>,
    pub note: Option<String>,
}

impl CaptureEvent {
    pub fn progress(capture_id: impl Into<String>, status: &str, at: DateTime<Utc>) -> Self {
        Self {
            kind: CaptureEventType::Progress,
            capture_id: capture_id.into(),
            status: status.to_string(),
            timestamp: at,
            species_code: None,
            common_name: None,
            confidence: None,
            asset_url: None,
            reason: None,
            note: None,
        }
    }

    pub fn failed(capture_id: impl Into<String>, reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            kind: CaptureEventType::Failed,
            capture_id: capture_id.into(),
            status: "failed".to_string(),
            timestamp: at,
            species_code: None,
            common_name: None,
            confidence: None,
            asset_url: None,
            reason: Some(reason.into()),
            note: None,
        }
    }
}

/// Topic key for the Event Bus: always `user:<id>`.
pub fn user_topic(user_id: &str) -> String {
    format!("user:{user_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_camel_case_and_type_tag() {
        let event = CaptureEvent::progress("cap-1", "classifying", Utc::now());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["captureId"], "cap-1");
        assert_eq!(json["status"], "classifying");
    }

    #[test]
    fn user_topic_format() {
        assert_eq!(user_topic("u1"), "user:u1");
    }
}
