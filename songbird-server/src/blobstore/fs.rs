//! Filesystem-backed `BlobStore` (C1/C2): the reference Clip Store/Asset
//! Store implementation for a single-node deployment (§9 — the concrete
//! backend is a Non-goal as a *product*, but the workspace needs a runnable
//! one). Layout is `<root>/<first-2-hex>/<key>`, the sharded directory
//! scheme from §6, grounded on the same "hash bytes, persist under a
//! derived path" shape as the teacher's `LocalStore`/`TextCipher` pair in
//! `dictum-app::storage`, generalized from a single sqlite file to a
//! content-addressed blob tree. `BlobStore` is one trait shared by both the
//! audio Clip Store and the image/gif Asset Store, so the filename is the
//! bare key with no format-specific suffix; the real media type travels in
//! the `.content-type` sidecar file instead, not in the name.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use songbird_core::store::{BlobStore, StoreError, StoreResult};

pub struct FsBlobStore {
    root: PathBuf,
    url_prefix: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            url_prefix: url_prefix.into(),
        }
    }

    fn shard_dir(&self, key: &str) -> PathBuf {
        let shard = if key.len() >= 2 { &key[..2] } else { "00" };
        self.root.join(shard)
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.shard_dir(key).join(key)
    }

    fn content_type_path(&self, key: &str) -> PathBuf {
        self.shard_dir(key).join(format!("{key}.content-type"))
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.url_prefix.trim_end_matches('/'), key)
    }
}

fn io_err(context: &str, err: std::io::Error) -> StoreError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound(context.to_string())
    } else if matches!(
        err.kind(),
        std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::Other
    ) {
        StoreError::Permanent(format!("{context}: {err}"))
    } else {
        StoreError::Transient(format!("{context}: {err}"))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> StoreResult<String> {
        let dir = self.shard_dir(key);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_err(key, e))?;
        fs::write(self.blob_path(key), &bytes)
            .await
            .map_err(|e| io_err(key, e))?;
        fs::write(self.content_type_path(key), content_type.as_bytes())
            .await
            .map_err(|e| io_err(key, e))?;
        Ok(self.url_for(key))
    }

    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        fs::read(self.blob_path(key))
            .await
            .map_err(|e| io_err(key, e))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(fs::metadata(self.blob_path(key)).await.is_ok())
    }
}

/// Read back a blob's content type, for handlers that serve the raw bytes
/// (not part of the `BlobStore` trait since only this concrete backend
/// needs a side channel for it — the in-memory test double keeps it inline).
pub async fn read_content_type(root: &Path, url_prefix: &str, key: &str) -> StoreResult<String> {
    let store = FsBlobStore::new(root.to_path_buf(), url_prefix.to_string());
    fs::read_to_string(store.content_type_path(key))
        .await
        .map(|s| s.trim().to_string())
        .map_err(|e| io_err(key, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), "https://assets");
        let url = store
            .put("abcd1234", b"hello".to_vec(), "audio/wav")
            .await
            .unwrap();
        assert_eq!(url, "https://assets/abcd1234");
        assert_eq!(store.get("abcd1234").await.unwrap(), b"hello");
        assert!(store.exists("abcd1234").await.unwrap());
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), "https://assets");
        let err = store.get("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(!store.exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn short_keys_fall_back_to_a_default_shard() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), "https://assets");
        store.put("a", b"x".to_vec(), "text/plain").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), b"x");
    }
}
