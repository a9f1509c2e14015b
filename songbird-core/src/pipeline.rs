//! Capture Pipeline (C5): the state machine run per Capture, exactly once
//! per active worker (§4.4). This is the heart of the Coordinator core, the
//! same role `engine::pipeline::run` plays for the teacher's audio engine —
//! a single function driven by one context struct so the call site (the
//! Dispatcher) stays tidy, with every suspension point an explicit `await`
//! on the Repository/Store/Inference boundary.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::bus::EventBus;
use crate::clock::Clock;
use crate::events::{user_topic, CaptureEvent, CaptureEventType};
use crate::inference::{InferenceError, SharedClassifier, SharedGenerator};
use crate::model::{Capture, CapturePatch, CaptureStatus};
use crate::repository::{RepoError, Repository, SharedRepository};
use crate::store::{BlobStore, SharedBlobStore};

/// All collaborators the pipeline needs, passed as one struct so the
/// Dispatcher's call site stays a single line, mirroring `PipelineContext`
/// in the teacher's engine.
#[derive(Clone)]
pub struct PipelineContext {
    pub repository: SharedRepository,
    pub clip_store: SharedBlobStore,
    pub asset_store: SharedBlobStore,
    pub classifier: SharedClassifier,
    pub generator: SharedGenerator,
    pub bus: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
}

/// Run the Capture Pipeline for one capture id to a terminal state (or abort
/// silently if another worker already claimed/finished it).
///
/// Re-submitting the same capture id is always safe: `claim` is a
/// conditional write gated on `status = pending`, so a second invocation for
/// an already-claimed or already-terminal capture returns immediately
/// without touching the classifier or generator again — property 1 in §8.
#[instrument(skip(ctx), fields(capture_id = %capture_id))]
pub async fn run_capture(ctx: &PipelineContext, capture_id: &str) {
    let capture = match claim(ctx, capture_id).await {
        Some(capture) => capture,
        None => return,
    };

    let topic = user_topic(&capture.user_id);
    publish_progress(ctx, &topic, &capture, "classifying");

    let clip_bytes = match ctx.clip_store.get(&capture.clip_key).await {
        Ok(bytes) => bytes,
        Err(_) => {
            fail(ctx, &topic, &capture, "ClipMissing").await;
            return;
        }
    };

    let classified = match classify(ctx, &capture, clip_bytes).await {
        Ok(capture) => capture,
        Err(reason) => {
            fail(ctx, &topic, &capture, &reason).await;
            return;
        }
    };

    publish_progress(ctx, &topic, &classified, "classified");

    let species = match ctx.repository.get_species(
        classified
            .species_id
            .as_deref()
            .expect("classify() always sets species_id on success"),
    )
    .await
    {
        Ok(species) => species,
        Err(err) => {
            warn!(error = %err, "species row vanished after classify — treating as generation needed");
            crate::model::Species {
                code: classified.species_id.clone().unwrap_or_default(),
                common_name: String::new(),
                scientific_name: String::new(),
                image_url: None,
                gif_url: None,
            }
        }
    };

    if species.has_asset() {
        finish_processed(ctx, &topic, &classified, &species, None).await;
        return;
    }

    let generating = match ctx
        .repository
        .transition_capture(
            &classified.id,
            &[CaptureStatus::Classified],
            CaptureStatus::Generating,
            CapturePatch::default(),
        )
        .await
    {
        Ok(capture) => capture,
        Err(RepoError::InvalidTransition) => {
            debug!("capture no longer classified — another worker or the reaper moved it");
            return;
        }
        Err(err) => {
            warn!(error = %err, "repository error entering generating state");
            return;
        }
    };
    publish_progress(ctx, &topic, &generating, "generating");

    match generate_art(ctx, &species).await {
        Ok(updated_species) => {
            finish_processed(ctx, &topic, &generating, &updated_species, None).await;
        }
        Err(err) => {
            debug!(error = %err, "art generation failed — capture still counts as classified");
            finish_processed(ctx, &topic, &generating, &species, Some("artUnavailable")).await;
        }
    }
}

/// Step 1 (§4.4): conditional claim. `InvalidTransition` means the job was
/// already claimed or terminated — abort silently so dispatcher retries are
/// always safe.
async fn claim(ctx: &PipelineContext, capture_id: &str) -> Option<Capture> {
    match ctx
        .repository
        .transition_capture(
            capture_id,
            &[CaptureStatus::Pending],
            CaptureStatus::Classifying,
            CapturePatch::claim(),
        )
        .await
    {
        Ok(capture) => Some(capture),
        Err(RepoError::InvalidTransition) => {
            debug!(capture_id, "claim skipped — already claimed or terminal");
            None
        }
        Err(err) => {
            warn!(capture_id, error = %err, "repository error claiming capture");
            None
        }
    }
}

/// Step 3 (§4.4): classify, upsert species, transition to `classified` or
/// `failed`. Returns the reason string on failure rather than propagating
/// an error type, since every failure path here is terminal and the only
/// thing the caller does with it is pass it to `fail`.
async fn classify(
    ctx: &PipelineContext,
    capture: &Capture,
    clip_bytes: Vec<u8>,
) -> Result<Capture, String> {
    let outcome = ctx
        .classifier
        .classify(&capture.id, &clip_bytes)
        .await
        .map_err(inference_failure_reason)?;

    if let Err(err) = ctx
        .repository
        .upsert_species(
            &outcome.species_code,
            &outcome.common_name,
            &outcome.scientific_name,
        )
        .await
    {
        return Err(format!("RepositoryError:{err}"));
    }

    ctx.repository
        .transition_capture(
            &capture.id,
            &[CaptureStatus::Classifying],
            CaptureStatus::Classified,
            CapturePatch::classified(outcome.species_code, outcome.confidence),
        )
        .await
        .map_err(|err| format!("RepositoryError:{err}"))
}

fn inference_failure_reason(err: InferenceError) -> String {
    match err {
        InferenceError::Timeout => "Timeout".to_string(),
        InferenceError::Unavailable => "Unavailable".to_string(),
        InferenceError::BadRequest(_) => "BadRequest".to_string(),
        InferenceError::Transport(_) => "Transport".to_string(),
        InferenceError::Malformed(_) => "Malformed".to_string(),
    }
}

/// Step 5 (§4.4): call the generator, download+store the asset, and record
/// it on the species row (tolerating a conflicting winner from a racing
/// capture of the same species).
async fn generate_art(
    ctx: &PipelineContext,
    species: &crate::model::Species,
) -> Result<crate::model::Species, InferenceError> {
    let request_id = format!("species:{}", species.code);
    let outcome = ctx
        .generator
        .generate(
            &request_id,
            &species.code,
            &species.common_name,
            &species.scientific_name,
        )
        .await?;

    let mut image_url = None;
    let mut gif_url = None;

    if let Some(image) = outcome.image {
        let key = format!("{}.image", species.code);
        match ctx.asset_store.put(&key, image.bytes, &image.content_type).await {
            Ok(url) => image_url = Some(url),
            Err(err) => warn!(species = %species.code, error = %err, "failed to persist image asset"),
        }
    }
    if let Some(gif) = outcome.gif {
        let key = format!("{}.gif", species.code);
        match ctx.asset_store.put(&key, gif.bytes, &gif.content_type).await {
            Ok(url) => gif_url = Some(url),
            Err(err) => warn!(species = %species.code, error = %err, "failed to persist gif asset"),
        }
    }

    if image_url.is_none() && gif_url.is_none() {
        return Err(InferenceError::Malformed(
            "generator returned no usable asset".to_string(),
        ));
    }

    ctx.repository
        .set_species_asset(&species.code, image_url, gif_url)
        .await
        .map_err(|err| InferenceError::Transport(err.to_string()))
}

async fn fail(ctx: &PipelineContext, topic: &str, capture: &Capture, reason: &str) {
    let now = ctx.clock.now();
    let result = ctx
        .repository
        .transition_capture(
            &capture.id,
            &[
                CaptureStatus::Pending,
                CaptureStatus::Classifying,
                CaptureStatus::Classified,
                CaptureStatus::Generating,
            ],
            CaptureStatus::Failed,
            {
                let mut patch = CapturePatch::failed(reason);
                patch.processed_at = Some(now);
                patch
            },
        )
        .await;

    match result {
        Ok(_) => {
            info!(capture_id = %capture.id, reason, "capture failed");
            ctx.bus.publish(
                topic,
                CaptureEvent::failed(capture.id.clone(), reason.to_string(), now),
            );
        }
        Err(RepoError::InvalidTransition) => {
            debug!(capture_id = %capture.id, "capture already left the state this worker observed");
        }
        Err(err) => {
            warn!(capture_id = %capture.id, error = %err, "repository error recording failure");
        }
    }
}

async fn finish_processed(
    ctx: &PipelineContext,
    topic: &str,
    capture: &Capture,
    species: &crate::model::Species,
    note: Option<&str>,
) {
    let now = ctx.clock.now();
    let patch = match note {
        Some(note) => CapturePatch::processed_with_note(now, note),
        None => CapturePatch::processed(now),
    };

    let result = ctx
        .repository
        .transition_capture(
            &capture.id,
            &[CaptureStatus::Classified, CaptureStatus::Generating],
            CaptureStatus::Processed,
            patch,
        )
        .await;

    match result {
        Ok(_) => {
            info!(capture_id = %capture.id, species = %species.code, "capture processed");
            let mut event =
                CaptureEvent::progress(capture.id.clone(), "processed", now);
            event.kind = CaptureEventType::Processed;
            event.species_code = Some(species.code.clone());
            event.common_name = Some(species.common_name.clone());
            event.confidence = capture.confidence;
            event.asset_url = species.image_url.clone().or_else(|| species.gif_url.clone());
            event.note = note.map(str::to_string);
            ctx.bus.publish(topic, event);
        }
        Err(RepoError::InvalidTransition) => {
            debug!(capture_id = %capture.id, "capture already left the state this worker observed");
        }
        Err(err) => {
            warn!(capture_id = %capture.id, error = %err, "repository error finalizing capture");
        }
    }
}

fn publish_progress(ctx: &PipelineContext, topic: &str, capture: &Capture, status: &str) {
    ctx.bus.publish(
        topic,
        CaptureEvent::progress(capture.id.clone(), status, ctx.clock.now()),
    );
}
