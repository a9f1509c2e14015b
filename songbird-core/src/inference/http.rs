//! Reqwest-backed `Classifier`/`Generator` with deadline, retry, and
//! circuit-breaker wrapping (§4.3). The backoff-with-jitter shape is
//! grounded on the example pack's `retry_delay`/`apply_jitter` helpers for
//! outbound provider calls; here it is driven by `rand` rather than a
//! clock-nanos fallback since `songbird-core` already depends on it.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    breaker::{BreakerConfig, CircuitBreaker},
    AssetBlob, ClassifyOutcome, Classifier, GenerateOutcome, Generator, InferenceError,
};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

async fn backoff_sleep(attempt: u32) {
    let base_ms = INITIAL_BACKOFF.as_millis() as u64 * 2u64.saturating_pow(attempt);
    let capped_ms = base_ms.min(MAX_BACKOFF.as_millis() as u64);
    let jitter_ms = rand::thread_rng().gen_range(0..=capped_ms.max(1));
    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
}

/// Runs `call` with the shared retry + breaker policy from §4.3, bounded by
/// one overall `deadline` covering every attempt and its backoff sleeps —
/// not a per-attempt timeout, which would let `max_attempts` retries
/// compound into `max_attempts * deadline` worst-case latency. `call` is
/// invoked at most `max_attempts` times; classifier/generator 4xx responses
/// are mapped to `InferenceError::BadRequest` by the caller and are never
/// retried.
async fn with_retry_and_breaker<T, F, Fut>(
    breaker: &CircuitBreaker,
    max_attempts: u32,
    deadline: Duration,
    call: F,
) -> Result<T, InferenceError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, InferenceError>>,
{
    match tokio::time::timeout(deadline, run_attempts(breaker, max_attempts, call)).await {
        Ok(result) => result,
        Err(_) => Err(InferenceError::Timeout),
    }
}

async fn run_attempts<T, F, Fut>(
    breaker: &CircuitBreaker,
    max_attempts: u32,
    mut call: F,
) -> Result<T, InferenceError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, InferenceError>>,
{
    let mut last_err = InferenceError::Unavailable;
    for attempt in 0..max_attempts {
        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(()) => return Err(InferenceError::Unavailable),
        };

        match call().await {
            Ok(value) => {
                breaker.on_success(permit);
                return Ok(value);
            }
            Err(err) => {
                breaker.on_failure(permit);
                last_err = err.clone();
                if !err.is_retriable() {
                    return Err(err);
                }
                if attempt + 1 < max_attempts {
                    debug!(attempt, error = %err, "retrying inference call");
                    backoff_sleep(attempt).await;
                }
            }
        }
    }
    warn!(error = %last_err, "inference call exhausted retries");
    Err(last_err)
}

fn map_status(status: reqwest::StatusCode) -> Option<InferenceError> {
    if status.is_client_error() {
        Some(InferenceError::BadRequest(status.to_string()))
    } else if status.is_server_error() {
        Some(InferenceError::Transport(status.to_string()))
    } else {
        None
    }
}

fn map_transport(err: reqwest::Error) -> InferenceError {
    if err.is_timeout() {
        InferenceError::Timeout
    } else {
        InferenceError::Transport(err.to_string())
    }
}

// ── Classifier ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    species_code: String,
    common_name: String,
    scientific_name: String,
    confidence: f32,
}

pub struct HttpClassifier {
    client: reqwest::Client,
    base_url: String,
    deadline: Duration,
    max_attempts: u32,
    breaker: CircuitBreaker,
}

impl HttpClassifier {
    pub fn new(base_url: impl Into<String>, deadline: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            deadline,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            breaker: CircuitBreaker::new("classifier", BreakerConfig::default()),
        }
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(
        &self,
        request_id: &str,
        clip_bytes: &[u8],
    ) -> Result<ClassifyOutcome, InferenceError> {
        let url = format!("{}/classify", self.base_url.trim_end_matches('/'));
        with_retry_and_breaker(&self.breaker, self.max_attempts, self.deadline, || {
            let part = reqwest::multipart::Part::bytes(clip_bytes.to_vec())
                .file_name("clip.wav")
                .mime_str("audio/wav")
                .unwrap_or_else(|_| reqwest::multipart::Part::bytes(clip_bytes.to_vec()));
            let form = reqwest::multipart::Form::new().part("audio_file", part);

            let request = self
                .client
                .post(&url)
                .header("X-Request-Id", request_id)
                .multipart(form);

            async move {
                let response = request.send().await.map_err(map_transport)?;
                if let Some(err) = map_status(response.status()) {
                    return Err(err);
                }
                response
                    .json::<ClassifyResponse>()
                    .await
                    .map_err(|e| InferenceError::Malformed(e.to_string()))
                    .map(|body| ClassifyOutcome {
                        species_code: body.species_code,
                        common_name: body.common_name,
                        scientific_name: body.scientific_name,
                        confidence: body.confidence,
                    })
            }
        })
        .await
    }

    fn breaker_state(&self) -> Option<super::BreakerState> {
        Some(self.breaker.state())
    }
}

// ── Generator ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    species_code: &'a str,
    common_name: &'a str,
    scientific_name: &'a str,
    request_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    image_url: Option<String>,
    gif_url: Option<String>,
}

pub struct HttpGenerator {
    client: reqwest::Client,
    base_url: String,
    deadline: Duration,
    max_attempts: u32,
    breaker: CircuitBreaker,
}

impl HttpGenerator {
    pub fn new(base_url: impl Into<String>, deadline: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            deadline,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            breaker: CircuitBreaker::new("generator", BreakerConfig::default()),
        }
    }

    /// Follow-up GET to resolve a generator-hosted URL down to bytes, the
    /// same "reqwest GET, stream into memory" shape the teacher's desktop
    /// app uses to pull down release assets. Shares `generate`'s overall
    /// deadline rather than carrying its own — see `generate`.
    async fn fetch_asset(&self, url: &str) -> Result<AssetBlob, InferenceError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(map_transport)?;
        if let Some(err) = map_status(response.status()) {
            return Err(err);
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| InferenceError::Malformed(e.to_string()))?;
        Ok(AssetBlob {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(
        &self,
        request_id: &str,
        species_code: &str,
        common_name: &str,
        scientific_name: &str,
    ) -> Result<GenerateOutcome, InferenceError> {
        let url = format!("{}/generate", self.base_url.trim_end_matches('/'));

        // `generate` may issue a retried POST followed by up to two asset
        // GETs; all of it shares one overall deadline rather than a
        // per-request timeout that would compound across attempts and
        // follow-up fetches.
        let outcome = tokio::time::timeout(self.deadline, async {
            let response = run_attempts(&self.breaker, self.max_attempts, || {
                let body = GenerateRequest {
                    species_code,
                    common_name,
                    scientific_name,
                    request_id,
                };
                let request = self.client.post(&url).json(&body);

                async move {
                    let response = request.send().await.map_err(map_transport)?;
                    if let Some(err) = map_status(response.status()) {
                        return Err(err);
                    }
                    response
                        .json::<GenerateResponse>()
                        .await
                        .map_err(|e| InferenceError::Malformed(e.to_string()))
                }
            })
            .await?;

            let image = match response.image_url {
                Some(url) => Some(self.fetch_asset(&url).await?),
                None => None,
            };
            let gif = match response.gif_url {
                Some(url) => Some(self.fetch_asset(&url).await?),
                None => None,
            };
            Ok(GenerateOutcome { image, gif })
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(InferenceError::Timeout),
        }
    }

    fn breaker_state(&self) -> Option<super::BreakerState> {
        Some(self.breaker.state())
    }
}
