//! `rusqlite`-backed `Repository` (C3): the durable backend behind the
//! in-memory reference implementation. Grounded on `dictum-app::storage`'s
//! `LocalStore` — `Connection::open` per call (no pool), `execute_batch` for
//! schema plus `PRAGMA journal_mode = WAL`, `params![]`, and manual
//! `stmt.query()` / `rows.next()` iteration — generalized from that single
//! encrypted-local-history store to the Coordinator's three tables and
//! wrapped in `spawn_blocking` since `rusqlite` itself is synchronous and
//! this crate is an async host.
//!
//! Timestamps are stored as RFC 3339 text with microsecond precision and a
//! fixed `Z` suffix so lexicographic and chronological order coincide —
//! `ORDER BY received_at DESC` needs no separate sort key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use songbird_core::clock::IdGen;
use songbird_core::model::{Capture, CaptureCursor, CapturePatch, CaptureStatus, Device, Species};
use songbird_core::repository::{CreateCaptureOutcome, ListCapturesPage, RepoError, RepoResult, Repository};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS devices (
  id TEXT PRIMARY KEY,
  owner_user_id TEXT NOT NULL,
  firmware_version TEXT NOT NULL,
  capabilities_json TEXT NOT NULL,
  last_seen TEXT NOT NULL,
  last_battery_voltage REAL,
  last_rssi INTEGER,
  last_sequence INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS species (
  code TEXT PRIMARY KEY,
  common_name TEXT NOT NULL,
  scientific_name TEXT NOT NULL,
  image_url TEXT,
  gif_url TEXT
);

CREATE TABLE IF NOT EXISTS captures (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  device_id TEXT NOT NULL,
  device_sequence INTEGER NOT NULL,
  clip_key TEXT NOT NULL,
  received_at TEXT NOT NULL,
  processed_at TEXT,
  status TEXT NOT NULL,
  species_id TEXT,
  confidence REAL,
  failure_reason TEXT,
  note TEXT,
  attempt INTEGER NOT NULL DEFAULT 0,
  UNIQUE(device_id, device_sequence)
);

CREATE INDEX IF NOT EXISTS idx_captures_user_order ON captures(user_id, received_at DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_captures_status ON captures(status);
"#;

fn backend_err(err: impl std::fmt::Display) -> RepoError {
    RepoError::Backend(err.to_string())
}

fn encode_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_time(raw: &str) -> RepoResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(backend_err)
}

fn status_to_str(status: CaptureStatus) -> &'static str {
    match status {
        CaptureStatus::Pending => "pending",
        CaptureStatus::Classifying => "classifying",
        CaptureStatus::Classified => "classified",
        CaptureStatus::Generating => "generating",
        CaptureStatus::Processed => "processed",
        CaptureStatus::Failed => "failed",
    }
}

fn status_from_str(raw: &str) -> RepoResult<CaptureStatus> {
    match raw {
        "pending" => Ok(CaptureStatus::Pending),
        "classifying" => Ok(CaptureStatus::Classifying),
        "classified" => Ok(CaptureStatus::Classified),
        "generating" => Ok(CaptureStatus::Generating),
        "processed" => Ok(CaptureStatus::Processed),
        "failed" => Ok(CaptureStatus::Failed),
        other => Err(backend_err(format!("unknown capture status {other:?}"))),
    }
}

fn row_to_capture(row: &rusqlite::Row<'_>) -> rusqlite::Result<(
    String,
    String,
    String,
    i64,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    Option<f64>,
    Option<String>,
    Option<String>,
    i64,
)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
    ))
}

fn assemble_capture(
    id: String,
    user_id: String,
    device_id: String,
    device_sequence: i64,
    clip_key: String,
    received_at: String,
    processed_at: Option<String>,
    status: String,
    species_id: Option<String>,
    confidence: Option<f64>,
    failure_reason: Option<String>,
    note: Option<String>,
    attempt: i64,
) -> RepoResult<Capture> {
    Ok(Capture {
        id,
        user_id,
        device_id,
        device_sequence,
        clip_key,
        received_at: decode_time(&received_at)?,
        processed_at: processed_at.map(|t| decode_time(&t)).transpose()?,
        status: status_from_str(&status)?,
        species_id,
        confidence: confidence.map(|c| c as f32),
        failure_reason,
        note,
        attempt: attempt as i32,
    })
}

const CAPTURE_COLUMNS: &str = "id, user_id, device_id, device_sequence, clip_key, received_at, \
     processed_at, status, species_id, confidence, failure_reason, note, attempt";

pub struct SqliteRepository {
    db_path: PathBuf,
    id_gen: Arc<dyn IdGen>,
}

impl SqliteRepository {
    /// Opens (creating if absent) the database at `db_path` and applies the
    /// schema. Mirrors the teacher's `LocalStore::new` / `init_schema` split.
    pub fn open(db_path: impl Into<PathBuf>, id_gen: Arc<dyn IdGen>) -> RepoResult<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(backend_err)?;
        }
        let conn = Connection::open(&db_path).map_err(backend_err)?;
        conn.execute_batch(SCHEMA).map_err(backend_err)?;
        Ok(Self { db_path, id_gen })
    }

    fn connect(&self) -> RepoResult<Connection> {
        Connection::open(&self.db_path).map_err(backend_err)
    }

    /// Runs `f` against a fresh blocking connection on the blocking thread
    /// pool, per §4.2's "no in-process locks on Capture rows" — conditional
    /// writes, not a mutex, serialize concurrent access.
    async fn with_conn<T, F>(&self, f: F) -> RepoResult<T>
    where
        F: FnOnce(&Connection) -> RepoResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).map_err(backend_err)?;
            f(&conn)
        })
        .await
        .map_err(|e| backend_err(format!("blocking task panicked: {e}")))?
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn create_capture(
        &self,
        user_id: &str,
        device_id: &str,
        clip_key: &str,
        device_sequence: i64,
        received_at: DateTime<Utc>,
    ) -> RepoResult<CreateCaptureOutcome> {
        let id = self.id_gen.new_id();
        let user_id = user_id.to_string();
        let device_id = device_id.to_string();
        let clip_key = clip_key.to_string();

        self.with_conn(move |conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM captures WHERE device_id = ?1 AND device_sequence = ?2",
                    params![device_id, device_sequence],
                    |row| row.get(0),
                )
                .optional()
                .map_err(backend_err)?;

            if let Some(existing_id) = existing {
                let capture = load_capture(conn, &existing_id)?;
                return Ok(CreateCaptureOutcome::Duplicate(capture));
            }

            conn.execute(
                &format!(
                    "INSERT INTO captures ({CAPTURE_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, 'pending', NULL, NULL, NULL, NULL, 0)"
                ),
                params![id, user_id, device_id, device_sequence, clip_key, encode_time(received_at)],
            )
            .map_err(backend_err)?;

            let capture = load_capture(conn, &id)?;
            Ok(CreateCaptureOutcome::Created(capture))
        })
        .await
    }

    async fn transition_capture(
        &self,
        capture_id: &str,
        from_states: &[CaptureStatus],
        to_state: CaptureStatus,
        patch: CapturePatch,
    ) -> RepoResult<Capture> {
        let capture_id = capture_id.to_string();
        let from_states: Vec<&'static str> = from_states.iter().copied().map(status_to_str).collect();
        let to_state = status_to_str(to_state).to_string();

        self.with_conn(move |conn| {
            if from_states.is_empty() {
                return Err(RepoError::InvalidTransition);
            }

            let placeholders: Vec<String> =
                (0..from_states.len()).map(|i| format!("?{}", i + 3)).collect();
            let sql = format!(
                "UPDATE captures SET \
                   status = ?1, \
                   attempt = attempt + ?2, \
                   species_id = COALESCE(?{sp}, species_id), \
                   confidence = COALESCE(?{conf}, confidence), \
                   failure_reason = COALESCE(?{fail}, failure_reason), \
                   note = COALESCE(?{note}, note), \
                   processed_at = COALESCE(?{proc}, processed_at) \
                 WHERE id = ?{id} AND status IN ({in_list})",
                sp = from_states.len() + 3,
                conf = from_states.len() + 4,
                fail = from_states.len() + 5,
                note = from_states.len() + 6,
                proc = from_states.len() + 7,
                id = from_states.len() + 8,
                in_list = placeholders.join(", "),
            );

            let attempt_delta: i64 = if patch.attempt_increment { 1 } else { 0 };
            let confidence = patch.confidence.map(|c| c as f64);
            let processed_at = patch.processed_at.map(encode_time);
            let from_state_strings: Vec<String> = from_states.iter().map(|s| s.to_string()).collect();

            let changed = {
                let mut bound: Vec<&dyn rusqlite::ToSql> = Vec::new();
                bound.push(&to_state);
                bound.push(&attempt_delta);
                for state in &from_state_strings {
                    bound.push(state);
                }
                bound.push(&patch.species_id);
                bound.push(&confidence);
                bound.push(&patch.failure_reason);
                bound.push(&patch.note);
                bound.push(&processed_at);
                bound.push(&capture_id);
                conn.execute(&sql, bound.as_slice()).map_err(backend_err)?
            };

            if changed == 0 {
                // Either the row doesn't exist, or it exists but is not in
                // `from_states` — disambiguate for the caller (§4.2).
                let exists: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM captures WHERE id = ?1",
                        params![capture_id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(backend_err)?;
                return Err(match exists {
                    Some(_) => RepoError::InvalidTransition,
                    None => RepoError::CaptureNotFound(capture_id),
                });
            }

            load_capture(conn, &capture_id)
        })
        .await
    }

    async fn get_capture(&self, capture_id: &str) -> RepoResult<Capture> {
        let capture_id = capture_id.to_string();
        self.with_conn(move |conn| load_capture(conn, &capture_id)).await
    }

    async fn list_captures(
        &self,
        user_id: &str,
        cursor: Option<CaptureCursor>,
        limit: u32,
    ) -> RepoResult<ListCapturesPage> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            // One row beyond `limit` tells us whether there's a next page.
            let fetch = limit as i64 + 1;
            let cursor_bound = cursor
                .as_ref()
                .map(|c| (encode_time(c.received_at), c.capture_id.clone()));

            let captures = if let Some((received_at, id)) = &cursor_bound {
                let sql = format!(
                    "SELECT {CAPTURE_COLUMNS} FROM captures WHERE user_id = ?1 \
                       AND (received_at, id) < (?2, ?3) ORDER BY received_at DESC, id DESC LIMIT ?4"
                );
                let mut stmt = conn.prepare(&sql).map_err(backend_err)?;
                let rows = stmt
                    .query(params![user_id, received_at, id, fetch])
                    .map_err(backend_err)?;
                collect_captures(rows)?
            } else {
                let sql = format!(
                    "SELECT {CAPTURE_COLUMNS} FROM captures WHERE user_id = ?1 \
                       ORDER BY received_at DESC, id DESC LIMIT ?2"
                );
                let mut stmt = conn.prepare(&sql).map_err(backend_err)?;
                let rows = stmt.query(params![user_id, fetch]).map_err(backend_err)?;
                collect_captures(rows)?
            };

            let mut captures = captures;
            let next_cursor = if captures.len() as i64 > limit as i64 {
                captures.truncate(limit as usize);
                captures.last().map(|c| CaptureCursor {
                    received_at: c.received_at,
                    capture_id: c.id.clone(),
                })
            } else {
                None
            };

            Ok(ListCapturesPage { captures, next_cursor })
        })
        .await
    }

    async fn upsert_species(
        &self,
        code: &str,
        common_name: &str,
        scientific_name: &str,
    ) -> RepoResult<Species> {
        let code = code.to_string();
        let common_name = common_name.to_string();
        let scientific_name = scientific_name.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO species (code, common_name, scientific_name, image_url, gif_url) \
                 VALUES (?1, ?2, ?3, NULL, NULL) \
                 ON CONFLICT(code) DO NOTHING",
                params![code, common_name, scientific_name],
            )
            .map_err(backend_err)?;
            load_species(conn, &code)
        })
        .await
    }

    async fn get_species(&self, code: &str) -> RepoResult<Species> {
        let code = code.to_string();
        self.with_conn(move |conn| load_species(conn, &code)).await
    }

    async fn set_species_asset(
        &self,
        code: &str,
        image_url: Option<String>,
        gif_url: Option<String>,
    ) -> RepoResult<Species> {
        let code = code.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE species SET image_url = ?2, gif_url = ?3 \
                 WHERE code = ?1 AND image_url IS NULL AND gif_url IS NULL",
                params![code, image_url, gif_url],
            )
            .map_err(backend_err)?;
            load_species(conn, &code)
        })
        .await
    }

    async fn register_or_update_device(
        &self,
        device_id: &str,
        user_id: &str,
        firmware_version: &str,
        capabilities: HashMap<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> RepoResult<Device> {
        let device_id = device_id.to_string();
        let user_id = user_id.to_string();
        let firmware_version = firmware_version.to_string();
        let capabilities_json = serde_json::to_string(&capabilities).map_err(backend_err)?;
        self.with_conn(move |conn| {
            let existing_owner: Option<String> = conn
                .query_row(
                    "SELECT owner_user_id FROM devices WHERE id = ?1",
                    params![device_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(backend_err)?;
            if let Some(owner) = existing_owner {
                if owner != user_id {
                    return Err(RepoError::NotOwned);
                }
            }

            conn.execute(
                "INSERT INTO devices (id, owner_user_id, firmware_version, capabilities_json, \
                   last_seen, last_battery_voltage, last_rssi, last_sequence) \
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, 0) \
                 ON CONFLICT(id) DO UPDATE SET \
                   firmware_version = excluded.firmware_version, \
                   capabilities_json = excluded.capabilities_json",
                params![device_id, user_id, firmware_version, capabilities_json, encode_time(now)],
            )
            .map_err(backend_err)?;
            load_device(conn, &device_id)
        })
        .await
    }

    async fn touch_device(
        &self,
        device_id: &str,
        heartbeat: DateTime<Utc>,
        battery_voltage: Option<f32>,
        rssi: Option<i32>,
    ) -> RepoResult<Device> {
        let device_id = device_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE devices SET \
                   last_seen = ?2, \
                   last_battery_voltage = COALESCE(?3, last_battery_voltage), \
                   last_rssi = COALESCE(?4, last_rssi), \
                   last_sequence = last_sequence + 1 \
                 WHERE id = ?1 AND ?2 > last_seen",
                params![
                    device_id,
                    encode_time(heartbeat),
                    battery_voltage.map(|v| v as f64),
                    rssi,
                ],
            )
            .map_err(backend_err)?;
            load_device(conn, &device_id)
        })
        .await
    }

    async fn get_device(&self, device_id: &str) -> RepoResult<Device> {
        let device_id = device_id.to_string();
        self.with_conn(move |conn| load_device(conn, &device_id)).await
    }

    async fn find_stale_captures(&self, non_terminal_before: DateTime<Utc>) -> RepoResult<Vec<Capture>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {CAPTURE_COLUMNS} FROM captures \
                   WHERE status NOT IN ('processed', 'failed') AND received_at < ?1"
            );
            let mut stmt = conn.prepare(&sql).map_err(backend_err)?;
            let rows = stmt
                .query(params![encode_time(non_terminal_before)])
                .map_err(backend_err)?;
            collect_captures(rows)
        })
        .await
    }
}

fn load_capture(conn: &Connection, capture_id: &str) -> RepoResult<Capture> {
    let sql = format!("SELECT {CAPTURE_COLUMNS} FROM captures WHERE id = ?1");
    conn.query_row(&sql, params![capture_id], |row| row_to_capture(row))
        .optional()
        .map_err(backend_err)?
        .ok_or_else(|| RepoError::CaptureNotFound(capture_id.to_string()))
        .and_then(|cols| {
            let (id, user_id, device_id, device_sequence, clip_key, received_at, processed_at, status, species_id, confidence, failure_reason, note, attempt) = cols;
            assemble_capture(
                id, user_id, device_id, device_sequence, clip_key, received_at, processed_at,
                status, species_id, confidence, failure_reason, note, attempt,
            )
        })
}

fn collect_captures(mut rows: rusqlite::Rows<'_>) -> RepoResult<Vec<Capture>> {
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(backend_err)? {
        let cols = row_to_capture(row).map_err(backend_err)?;
        let (id, user_id, device_id, device_sequence, clip_key, received_at, processed_at, status, species_id, confidence, failure_reason, note, attempt) = cols;
        out.push(assemble_capture(
            id, user_id, device_id, device_sequence, clip_key, received_at, processed_at,
            status, species_id, confidence, failure_reason, note, attempt,
        )?);
    }
    Ok(out)
}

fn load_species(conn: &Connection, code: &str) -> RepoResult<Species> {
    conn.query_row(
        "SELECT code, common_name, scientific_name, image_url, gif_url FROM species WHERE code = ?1",
        params![code],
        |row| {
            Ok(Species {
                code: row.get(0)?,
                common_name: row.get(1)?,
                scientific_name: row.get(2)?,
                image_url: row.get(3)?,
                gif_url: row.get(4)?,
            })
        },
    )
    .optional()
    .map_err(backend_err)?
    .ok_or_else(|| RepoError::SpeciesNotFound(code.to_string()))
}

fn load_device(conn: &Connection, device_id: &str) -> RepoResult<Device> {
    conn.query_row(
        "SELECT id, owner_user_id, firmware_version, capabilities_json, last_seen, \
           last_battery_voltage, last_rssi, last_sequence FROM devices WHERE id = ?1",
        params![device_id],
        |row| {
            let capabilities_json: String = row.get(3)?;
            let last_seen: String = row.get(4)?;
            let last_battery_voltage: Option<f64> = row.get(5)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                capabilities_json,
                last_seen,
                last_battery_voltage,
                row.get::<_, Option<i32>>(6)?,
                row.get::<_, i64>(7)?,
            ))
        },
    )
    .optional()
    .map_err(backend_err)?
    .ok_or_else(|| RepoError::DeviceNotFound(device_id.to_string()))
    .and_then(
        |(id, owner_user_id, firmware_version, capabilities_json, last_seen, last_battery_voltage, last_rssi, last_sequence)| {
            Ok(Device {
                id,
                owner_user_id,
                firmware_version,
                capabilities: serde_json::from_str(&capabilities_json).map_err(backend_err)?,
                last_seen: decode_time(&last_seen)?,
                last_battery_voltage: last_battery_voltage.map(|v| v as f32),
                last_rssi,
                last_sequence,
            })
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use songbird_core::clock::test_util::SequentialIdGen;

    fn repo() -> (tempfile::TempDir, SqliteRepository) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("songbird.sqlite3");
        let repo = SqliteRepository::open(&path, Arc::new(SequentialIdGen::new("cap"))).unwrap();
        (dir, repo)
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[tokio::test]
    async fn duplicate_device_sequence_is_idempotent() {
        let (_dir, repo) = repo();
        let a = repo.create_capture("u1", "d1", "hash1", 7, now()).await.unwrap();
        let b = repo.create_capture("u1", "d1", "hash1", 7, now()).await.unwrap();
        let (CreateCaptureOutcome::Created(ca), CreateCaptureOutcome::Duplicate(cb)) = (a, b) else {
            panic!("expected Created then Duplicate");
        };
        assert_eq!(ca.id, cb.id);
    }

    #[tokio::test]
    async fn transition_rejects_wrong_from_state() {
        let (_dir, repo) = repo();
        let CreateCaptureOutcome::Created(capture) =
            repo.create_capture("u1", "d1", "hash1", 1, now()).await.unwrap()
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
    async fn transition_on_missing_capture_is_not_found() {
        let (_dir, repo) = repo();
        let err = repo
            .transition_capture(
                "cap-missing",
                &[CaptureStatus::Pending],
                CaptureStatus::Classifying,
                CapturePatch::claim(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::CaptureNotFound(_)));
    }

    #[tokio::test]
    async fn set_species_asset_does_not_overwrite() {
        let (_dir, repo) = repo();
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
        let (_dir, repo) = repo();
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
        let (_dir, repo) = repo();
        repo.register_or_update_device("d1", "u1", "1.0", HashMap::new(), now())
            .await
            .unwrap();

        let t1 = now();
        let t0 = t1 - chrono::Duration::seconds(30);

        repo.touch_device("d1", t1, Some(3.7), Some(-60)).await.unwrap();
        let after_late = repo.touch_device("d1", t0, Some(3.6), Some(-70)).await.unwrap();
        assert_eq!(after_late.last_seen, t1);
        assert_eq!(after_late.last_battery_voltage, Some(3.7));
    }

    #[tokio::test]
    async fn list_captures_pages_in_received_at_desc_order() {
        let (_dir, repo) = repo();
        let base = now();
        for i in 0..5i64 {
            repo.create_capture("u1", "d1", "hash", i, base + chrono::Duration::seconds(i))
                .await
                .unwrap();
        }

        let page1 = repo.list_captures("u1", None, 2).await.unwrap();
        assert_eq!(page1.captures.len(), 2);
        assert!(page1.next_cursor.is_some());
        assert_eq!(page1.captures[0].device_sequence, 4);
        assert_eq!(page1.captures[1].device_sequence, 3);

        let page2 = repo
            .list_captures("u1", page1.next_cursor, 2)
            .await
            .unwrap();
        assert_eq!(page2.captures.len(), 2);
        assert_eq!(page2.captures[0].device_sequence, 2);
        assert_eq!(page2.captures[1].device_sequence, 1);
    }

    #[tokio::test]
    async fn find_stale_captures_excludes_terminal_states() {
        let (_dir, repo) = repo();
        let old = now() - chrono::Duration::minutes(5);
        let CreateCaptureOutcome::Created(pending) =
            repo.create_capture("u1", "d1", "hash", 1, old).await.unwrap()
        else {
            unreachable!()
        };
        let CreateCaptureOutcome::Created(done) =
            repo.create_capture("u1", "d1", "hash2", 2, old).await.unwrap()
        else {
            unreachable!()
        };
        repo.transition_capture(
            &done.id,
            &[CaptureStatus::Pending],
            CaptureStatus::Processed,
            CapturePatch::processed(now()),
        )
        .await
        .unwrap();

        let stale = repo.find_stale_captures(now()).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, pending.id);
    }
}
