//! Repository (C3): coarse-grained transactional operations, per §4.2.
//!
//! This is a trait boundary, not a generic ORM — exactly the re-architecture
//! called out in §9 ("global database session objects scoped per request";
//! replace with an explicit Repository interface). Every mutating operation
//! is conceptually wrapped in a single transaction; the `from_states` guard
//! on `transition_capture` is the sole concurrency-control mechanism (no
//! in-process locks on Capture rows).

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{Capture, CaptureCursor, CapturePatch, CaptureStatus, Device, Species};

#[derive(Debug, Error, Clone)]
pub enum RepoError {
    #[error("duplicate device sequence")]
    DuplicateSequence,

    #[error("invalid transition: capture not in expected state")]
    InvalidTransition,

    #[error("capture not found: {0}")]
    CaptureNotFound(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device registered to a different user")]
    NotOwned,

    #[error("species not found: {0}")]
    SpeciesNotFound(String),

    #[error("backend error: {0}")]
    Backend(String),
}

pub type RepoResult<T> = std::result::Result<T, RepoError>;

/// Outcome of `create_capture`: either the new row, or (idempotently) the
/// pre-existing row for a duplicate `(device_id, device_sequence)` per the
/// invariant in §3.
pub enum CreateCaptureOutcome {
    Created(Capture),
    Duplicate(Capture),
}

pub struct ListCapturesPage {
    pub captures: Vec<Capture>,
    pub next_cursor: Option<CaptureCursor>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn create_capture(
        &self,
        user_id: &str,
        device_id: &str,
        clip_key: &str,
        device_sequence: i64,
        received_at: DateTime<Utc>,
    ) -> RepoResult<CreateCaptureOutcome>;

    /// Conditional write: succeeds only if the capture is currently in one
    /// of `from_states`. This is the distributed lock substitute described
    /// in §5 — between suspension points a worker owns the capture purely
    /// because it holds a non-terminal state no other worker's guard will
    /// match.
    async fn transition_capture(
        &self,
        capture_id: &str,
        from_states: &[CaptureStatus],
        to_state: CaptureStatus,
        patch: CapturePatch,
    ) -> RepoResult<Capture>;

    async fn get_capture(&self, capture_id: &str) -> RepoResult<Capture>;

    async fn list_captures(
        &self,
        user_id: &str,
        cursor: Option<CaptureCursor>,
        limit: u32,
    ) -> RepoResult<ListCapturesPage>;

    /// Idempotent on `code`; never overwrites an existing asset URL.
    async fn upsert_species(
        &self,
        code: &str,
        common_name: &str,
        scientific_name: &str,
    ) -> RepoResult<Species>;

    async fn get_species(&self, code: &str) -> RepoResult<Species>;

    /// Only succeeds if the current asset URL is null; on conflict, returns
    /// the species as another worker left it (the race in §4.4's tie-break).
    async fn set_species_asset(
        &self,
        code: &str,
        image_url: Option<String>,
        gif_url: Option<String>,
    ) -> RepoResult<Species>;

    async fn register_or_update_device(
        &self,
        device_id: &str,
        user_id: &str,
        firmware_version: &str,
        capabilities: HashMap<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> RepoResult<Device>;

    /// Only writes if `heartbeat` is later than the stored `last_seen`
    /// (monotonicity, §3/§5).
    async fn touch_device(
        &self,
        device_id: &str,
        heartbeat: DateTime<Utc>,
        battery_voltage: Option<f32>,
        rssi: Option<i32>,
    ) -> RepoResult<Device>;

    async fn get_device(&self, device_id: &str) -> RepoResult<Device>;

    /// Captures in a non-terminal state older than `older_than`, for the
    /// reaper (§4.4).
    async fn find_stale_captures(
        &self,
        non_terminal_before: DateTime<Utc>,
    ) -> RepoResult<Vec<Capture>>;
}

pub type SharedRepository = std::sync::Arc<dyn Repository>;
