//! Clip Store / Asset Store (C1, C2): two narrow content-addressed
//! key–value interfaces, per §4.1.
//!
//! Grounded on the teacher's `TextCipher`/`LocalStore` pair in
//! `dictum-app::storage` for the "hash bytes with sha2, persist under a
//! derived path" shape, generalised from an encrypted-history blob to a
//! generic put/get-by-key store.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("transient I/O error: {0}")]
    Transient(String),

    #[error("store quota exceeded")]
    QuotaExceeded,

    #[error("permanent store error: {0}")]
    Permanent(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Content hash of a clip's bytes — the clip's key (§4.1).
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Content-addressed blob store. One trait serves both the Clip Store (key =
/// content hash) and the Asset Store (key = species code) — the contract in
/// §4.1 is identical for both, only the key derivation differs at the
/// caller.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> StoreResult<String>;
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>>;
    async fn exists(&self, key: &str) -> StoreResult<bool>;
}

/// In-memory `BlobStore`, used by tests and as the default in examples.
#[derive(Default)]
pub struct InMemoryBlobStore {
    inner: Mutex<HashMap<String, (Vec<u8>, String)>>,
    url_prefix: String,
}

impl InMemoryBlobStore {
    pub fn new(url_prefix: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            url_prefix: url_prefix.into(),
        }
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.url_prefix.trim_end_matches('/'), key)
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> StoreResult<String> {
        let url = self.url_for(key);
        self.inner
            .lock()
            .insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(url)
    }

    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.inner
            .lock()
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.inner.lock().contains_key(key))
    }
}

pub type SharedBlobStore = Arc<dyn BlobStore>;
