//! In-memory `Repository`, used by unit/integration tests and as a
//! reference implementation. Mirrors the guarded-state shape of
//! `DictumEngine` (a `parking_lot::Mutex` around the single source of
//! truth, mutated only through narrow methods) rather than a generic
//! interior-mutability free-for-all.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::model::{Capture, CaptureCursor, CapturePatch, CaptureStatus, Device, Species};

use super::{CreateCaptureOutcome, ListCapturesPage, RepoError, RepoResult, Repository};

#[derive(Default)]
struct Inner {
    captures: HashMap<String, Capture>,
    /// `(device_id, device_sequence) -> capture_id`, enforcing the §3
    /// uniqueness invariant.
    capture_by_seq: HashMap<(String, i64), String>,
    species: HashMap<String, Species>,
    devices: HashMap<String, Device>,
    next_capture_id: u64,
}

/// In-memory `Repository`. Not for production use (no durability across
/// process restarts) — the concrete persistent backend lives in
/// `songbird-server` per the spec's scope note that the relational store is
/// an external collaborator.
pub struct InMemoryRepository {
    inner: Mutex<Inner>,
    id_prefix: String,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new("cap")
    }
}

impl InMemoryRepository {
    pub fn new(id_prefix: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            id_prefix: id_prefix.into(),
        }
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn create_capture(
        &self,
        user_id: &str,
        device_id: &str,
        clip_key: &str,
        device_sequence: i64,
        received_at: DateTime<Utc>,
    ) -> RepoResult<CreateCaptureOutcome> {
        let mut guard = self.inner.lock();
        let seq_key = (device_id.to_string(), device_sequence);
        if let Some(existing_id) = guard.capture_by_seq.get(&seq_key).cloned() {
            let existing = guard
                .captures
                .get(&existing_id)
                .cloned()
                .expect("capture_by_seq points at a live row");
            return Ok(CreateCaptureOutcome::Duplicate(existing));
        }

        let n = guard.next_capture_id;
        guard.next_capture_id += 1;
        let id = format!("{}-{n}", self.id_prefix);

        let capture = Capture::new_pending(
            id.clone(),
            user_id.to_string(),
            device_id.to_string(),
            device_sequence,
            clip_key.to_string(),
            received_at,
        );
        guard.captures.insert(id.clone(), capture.clone());
        guard.capture_by_seq.insert(seq_key, id);
        Ok(CreateCaptureOutcome::Created(capture))
    }

    async fn transition_capture(
        &self,
        capture_id: &str,
        from_states: &[CaptureStatus],
        to_state: CaptureStatus,
        patch: CapturePatch,
    ) -> RepoResult<Capture> {
        let mut guard = self.inner.lock();
        let capture = guard
            .captures
            .get_mut(capture_id)
            .ok_or_else(|| RepoError::CaptureNotFound(capture_id.to_string()))?;

        if !from_states.contains(&capture.status) {
            return Err(RepoError::InvalidTransition);
        }

        capture.status = to_state;
        if patch.attempt_increment {
            capture.attempt += 1;
        }
        if let Some(species_id) = patch.species_id {
            capture.species_id = Some(species_id);
        }
        if let Some(confidence) = patch.confidence {
            capture.confidence = Some(confidence);
        }
        if let Some(reason) = patch.failure_reason {
            capture.failure_reason = Some(reason);
        }
        if let Some(note) = patch.note {
            capture.note = Some(note);
        }
        if let Some(processed_at) = patch.processed_at {
            capture.processed_at = Some(processed_at);
        }

        Ok(capture.clone())
    }

    async fn get_capture(&self, capture_id: &str) -> RepoResult<Capture> {
        self.inner
            .lock()
            .captures
            .get(capture_id)
            .cloned()
            .ok_or_else(|| RepoError::CaptureNotFound(capture_id.to_string()))
    }

    async fn list_captures(
        &self,
        user_id: &str,
        cursor: Option<CaptureCursor>,
        limit: u32,
    ) -> RepoResult<ListCapturesPage> {
        let guard = self.inner.lock();

        // Order by (received_at desc, id desc) into a BTreeMap keyed on the
        // reverse-sortable tuple, then walk forward from the cursor.
        let mut ordered: BTreeMap<(std::cmp::Reverse<DateTime<Utc>>, String), Capture> =
            BTreeMap::new();
        for capture in guard.captures.values() {
            if capture.user_id == user_id {
                ordered.insert(
                    (std::cmp::Reverse(capture.received_at), capture.id.clone()),
                    capture.clone(),
                );
            }
        }

        let start_after = cursor.map(|c| (std::cmp::Reverse(c.received_at), c.capture_id));

        let mut captures = Vec::new();
        let mut next_cursor = None;
        for (key, capture) in ordered.range(
            start_after
                .clone()
                .map(|k| std::ops::Bound::Excluded(k))
                .unwrap_or(std::ops::Bound::Unbounded)..,
        ) {
            if captures.len() as u32 == limit {
                next_cursor = Some(CaptureCursor {
                    received_at: key.0 .0,
                    capture_id: key.1.clone(),
                });
                break;
            }
            captures.push(capture.clone());
        }

        Ok(ListCapturesPage {
            captures,
            next_cursor,
        })
    }

    async fn upsert_species(
        &self,
        code: &str,
        common_name: &str,
        scientific_name: &str,
    ) -> RepoResult<Species> {
        let mut guard = self.inner.lock();
        let species = guard
            .species
            .entry(code.to_string())
            .or_insert_with(|| Species {
                code: code.to_string(),
                common_name: common_name.to_string(),
                scientific_name: scientific_name.to_string(),
                image_url: None,
                gif_url: None,
            });
        Ok(species.clone())
    }

    async fn get_species(&self, code: &str) -> RepoResult<Species> {
        self.inner
            .lock()
            .species
            .get(code)
            .cloned()
            .ok_or_else(|| RepoError::SpeciesNotFound(code.to_string()))
    }

    async fn set_species_asset(
        &self,
        code: &str,
        image_url: Option<String>,
        gif_url: Option<String>,
    ) -> RepoResult<Species> {
        let mut guard = self.inner.lock();
        let species = guard
            .species
            .get_mut(code)
            .ok_or_else(|| RepoError::SpeciesNotFound(code.to_string()))?;
        if species.image_url.is_none() && species.gif_url.is_none() {
            species.image_url = image_url;
            species.gif_url = gif_url;
        }
        Ok(species.clone())
    }

    async fn register_or_update_device(
        &self,
        device_id: &str,
        user_id: &str,
        firmware_version: &str,
        capabilities: HashMap<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> RepoResult<Device> {
        let mut guard = self.inner.lock();
        if let Some(existing) = guard.devices.get(device_id) {
            if existing.owner_user_id != user_id {
                return Err(RepoError::NotOwned);
            }
        }
        let device = guard
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| Device {
                id: device_id.to_string(),
                owner_user_id: user_id.to_string(),
                firmware_version: firmware_version.to_string(),
                capabilities: HashMap::new(),
                last_seen: now,
                last_battery_voltage: None,
                last_rssi: None,
                last_sequence: 0,
            });
        device.firmware_version = firmware_version.to_string();
        device.capabilities = capabilities;
        Ok(device.clone())
    }

    async fn touch_device(
        &self,
        device_id: &str,
        heartbeat: DateTime<Utc>,
        battery_voltage: Option<f32>,
        rssi: Option<i32>,
    ) -> RepoResult<Device> {
        let mut guard = self.inner.lock();
        let device = guard
            .devices
            .get_mut(device_id)
            .ok_or_else(|| RepoError::DeviceNotFound(device_id.to_string()))?;
        if heartbeat > device.last_seen {
            device.last_seen = heartbeat;
            device.last_battery_voltage = battery_voltage.or(device.last_battery_voltage);
            device.last_rssi = rssi.or(device.last_rssi);
        }
        Ok(device.clone())
    }

    async fn get_device(&self, device_id: &str) -> RepoResult<Device> {
        self.inner
            .lock()
            .devices
            .get(device_id)
            .cloned()
            .ok_or_else(|| RepoError::DeviceNotFound(device_id.to_string()))
    }

    async fn find_stale_captures(
        &self,
        non_terminal_before: DateTime<Utc>,
    ) -> RepoResult<Vec<Capture>> {
        let guard = self.inner.lock();
        Ok(guard
            .captures
            .values()
            .filter(|c| !c.status.is_terminal() && c.received_at < non_terminal_before)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CapturePatch;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[tokio::test]
    async fn duplicate_device_sequence_is_idempotent() {
        let repo = InMemoryRepository::default();
        let a = repo
            .create_capture("u1", "d1", "hash1", 7, now())
            .await
            .unwrap();
        let b = repo
            .create_capture("u1", "d1", "hash1", 7, now())
            .await
            .unwrap();

        let (CreateCaptureOutcome::Created(ca), CreateCaptureOutcome::Duplicate(cb)) = (a, b)
        else {
            panic!("expected Created then Duplicate");
        };
        assert_eq!(ca.id, cb.id);
    }

    #[tokio::test]
    async fn transition_rejects_wrong_from_state() {
        let repo = InMemoryRepository::default();
        let CreateCaptureOutcome::Created(capture) = repo
            .create_capture("u1", "d1", "hash1", 1, now())
            .await
            .unwrap()
        else {
            unreachable!()
        };

        repo.transition_capture(
            &capture.id,
            &[CaptureStatus::Pending],
            CaptureStatus::Classifying,
            CapturePatch::claim(),
        )
        .await
        .unwrap();

        let err = repo
            .transition_capture(
                &capture.id,
                &[CaptureStatus::Pending],
                CaptureStatus::Classifying,
                CapturePatch::claim(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::InvalidTransition));
    }

    #[tokio::test]
    async fn set_species_asset_does_not_overwrite() {
        let repo = InMemoryRepository::default();
        repo.upsert_species("amerob", "American Robin", "Turdus migratorius")
            .await
            .unwrap();
        let first = repo
            .set_species_asset("amerob", Some("https://a/1.webp".into()), None)
            .await
            .unwrap();
        assert_eq!(first.image_url.as_deref(), Some("https://a/1.webp"));

        let second = repo
            .set_species_asset("amerob", Some("https://a/2.webp".into()), None)
            .await
            .unwrap();
        assert_eq!(second.image_url.as_deref(), Some("https://a/1.webp"));
    }

    #[tokio::test]
    async fn register_rejects_a_different_owner() {
        let repo = InMemoryRepository::default();
        repo.register_or_update_device("d1", "u1", "1.0", HashMap::new(), now())
            .await
            .unwrap();

        let err = repo
            .register_or_update_device("d1", "u2", "1.1", HashMap::new(), now())
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::NotOwned));
    }

    #[tokio::test]
    async fn heartbeat_monotonicity_ignores_out_of_order_updates() {
        let repo = InMemoryRepository::default();
        repo.register_or_update_device("d1", "u1", "1.0", HashMap::new(), now())
            .await
            .unwrap();

        let t1 = now();
        let t0 = t1 - chrono::Duration::seconds(30);

        repo.touch_device("d1", t1, Some(3.7), Some(-60))
            .await
            .unwrap();
        let after_late = repo.touch_device("d1", t0, Some(3.6), Some(-70)).await.unwrap();
        assert_eq!(after_late.last_seen, t1);
        assert_eq!(after_late.last_battery_voltage, Some(3.7));
    }
}
