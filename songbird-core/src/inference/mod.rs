//! Inference Clients (C4): typed HTTP clients for the Classifier and
//! Generator collaborators, with shared deadline/retry/breaker policy
//! (§4.3).
//!
//! The `Classifier`/`Generator` traits decouple the pipeline from any
//! concrete transport, the same separation the teacher draws between the
//! `SpeechModel` trait and its ONNX/stub backends.

pub mod breaker;
pub mod http;

use async_trait::async_trait;
use thiserror::Error;

pub use breaker::{BreakerState, CircuitBreaker};

/// Closed error taxonomy for both collaborators (§4.3/§7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InferenceError {
    #[error("timed out waiting for response")]
    Timeout,

    #[error("circuit open — collaborator unavailable")]
    Unavailable,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl InferenceError {
    /// Transport errors, 5xx, and `Timeout` are retriable; 4xx is not (§4.3).
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            InferenceError::Timeout | InferenceError::Transport(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifyOutcome {
    pub species_code: String,
    pub common_name: String,
    pub scientific_name: String,
    pub confidence: f32,
}

/// A generated image/GIF asset, fully resolved to bytes.
///
/// The wire contract in §6 has the Generator hand back a hosted URL, not
/// bytes — but §3's invariant ("every Species with a non-null asset URL has
/// a successful Asset Store put for that URL") only holds if the URL we
/// persist is *our own* Asset Store's, not the generator's. So a
/// `Generator` implementation is responsible for resolving its own URL down
/// to bytes before handing it back; `HttpGenerator` does this with a
/// follow-up GET using the same client.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetBlob {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GenerateOutcome {
    pub image: Option<AssetBlob>,
    pub gif: Option<AssetBlob>,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        request_id: &str,
        clip_bytes: &[u8],
    ) -> Result<ClassifyOutcome, InferenceError>;

    /// Current breaker state, for `/healthz`. `None` for collaborators with
    /// no breaker of their own (e.g. test doubles).
    fn breaker_state(&self) -> Option<BreakerState> {
        None
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        request_id: &str,
        species_code: &str,
        common_name: &str,
        scientific_name: &str,
    ) -> Result<GenerateOutcome, InferenceError>;

    fn breaker_state(&self) -> Option<BreakerState> {
        None
    }
}

pub type SharedClassifier = std::sync::Arc<dyn Classifier>;
pub type SharedGenerator = std::sync::Arc<dyn Generator>;
