//! End-to-end Capture Pipeline scenarios (§8 S1-S6), driven against the
//! in-memory repository/store and scripted classifier/generator doubles.
//! Shape mirrors `dictum-core`'s `pipeline_latency` integration test: a
//! small fake collaborator per scenario, a broadcast receiver asserting on
//! the emitted event, `tokio::test` driving the whole thing directly rather
//! than through the dispatcher's background loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use songbird_core::events::CaptureEventType;
use songbird_core::inference::{
    AssetBlob, ClassifyOutcome, Classifier, GenerateOutcome, Generator, InferenceError,
};
use songbird_core::model::CaptureStatus;
use songbird_core::repository::memory::InMemoryRepository;
use songbird_core::repository::{CreateCaptureOutcome, Repository};
use songbird_core::store::{BlobStore, InMemoryBlobStore, SharedBlobStore};
use songbird_core::{pipeline, Clock, EventBus, PipelineContext, SystemClock};

struct ScriptedClassifier {
    outcome: ClassifyOutcome,
    calls: AtomicUsize,
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(
        &self,
        _request_id: &str,
        _clip_bytes: &[u8],
    ) -> Result<ClassifyOutcome, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.outcome.clone())
    }
}

struct FailingClassifier {
    calls: AtomicUsize,
}

#[async_trait]
impl Classifier for FailingClassifier {
    async fn classify(
        &self,
        _request_id: &str,
        _clip_bytes: &[u8],
    ) -> Result<ClassifyOutcome, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(InferenceError::Unavailable)
    }
}

struct ScriptedGenerator {
    outcome: GenerateOutcome,
    calls: AtomicUsize,
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(
        &self,
        _request_id: &str,
        _species_code: &str,
        _common_name: &str,
        _scientific_name: &str,
    ) -> Result<GenerateOutcome, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.outcome.clone())
    }
}

struct FailingGenerator {
    calls: AtomicUsize,
}

#[async_trait]
impl Generator for FailingGenerator {
    async fn generate(
        &self,
        _request_id: &str,
        _species_code: &str,
        _common_name: &str,
        _scientific_name: &str,
    ) -> Result<GenerateOutcome, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(InferenceError::Malformed("500".to_string()))
    }
}

struct NoopGenerator;

#[async_trait]
impl Generator for NoopGenerator {
    async fn generate(
        &self,
        _request_id: &str,
        _species_code: &str,
        _common_name: &str,
        _scientific_name: &str,
    ) -> Result<GenerateOutcome, InferenceError> {
        unreachable!("generator must not be called when the species already has an asset")
    }
}

async fn seed_capture(repo: &InMemoryRepository, device_sequence: i64) -> songbird_core::Capture {
    let clip_store: SharedBlobStore = Arc::new(InMemoryBlobStore::new("https://clips"));
    clip_store.put("clip-hash", b"clip bytes".to_vec(), "audio/wav").await.unwrap();
    match repo
        .create_capture("u1", "d1", "clip-hash", device_sequence, SystemClock.now())
        .await
        .unwrap()
    {
        CreateCaptureOutcome::Created(capture) => capture,
        CreateCaptureOutcome::Duplicate(_) => panic!("expected a fresh capture"),
    }
}

#[tokio::test]
async fn s1_known_species_skips_generator_and_reuses_asset() {
    let repo = Arc::new(InMemoryRepository::default());
    repo.upsert_species("amerob", "American Robin", "Turdus migratorius")
        .await
        .unwrap();
    repo.set_species_asset("amerob", Some("https://assets/amerob.webp".to_string()), None)
        .await
        .unwrap();

    let clip_store: SharedBlobStore = Arc::new(InMemoryBlobStore::new("https://clips"));
    clip_store.put("clip-hash", b"clip bytes".to_vec(), "audio/wav").await.unwrap();
    let capture = match repo
        .create_capture("u1", "d1", "clip-hash", 1, SystemClock.now())
        .await
        .unwrap()
    {
        CreateCaptureOutcome::Created(capture) => capture,
        CreateCaptureOutcome::Duplicate(_) => panic!("expected a fresh capture"),
    };

    let classifier = Arc::new(ScriptedClassifier {
        outcome: ClassifyOutcome {
            species_code: "amerob".to_string(),
            common_name: "American Robin".to_string(),
            scientific_name: "Turdus migratorius".to_string(),
            confidence: 0.92,
        },
        calls: AtomicUsize::new(0),
    });
    let generator = Arc::new(NoopGenerator);
    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe("user:u1");

    let ctx = PipelineContext {
        repository: repo.clone(),
        clip_store,
        asset_store: Arc::new(InMemoryBlobStore::new("https://assets")),
        classifier,
        generator,
        bus: bus.clone(),
        clock: Arc::new(SystemClock),
    };

    pipeline::run_capture(&ctx, &capture.id).await;

    let after = repo.get_capture(&capture.id).await.unwrap();
    assert_eq!(after.status, CaptureStatus::Processed);
    assert_eq!(after.species_id.as_deref(), Some("amerob"));

    let species = repo.get_species("amerob").await.unwrap();
    assert_eq!(species.image_url.as_deref(), Some("https://assets/amerob.webp"));

    let event = events.recv().await.unwrap(); // classifying
    assert_eq!(event.kind, CaptureEventType::Progress);
    let event = events.recv().await.unwrap(); // classified
    assert_eq!(event.status, "classified");
    let event = events.recv().await.unwrap(); // processed
    assert_eq!(event.kind, CaptureEventType::Processed);
    assert_eq!(event.species_code.as_deref(), Some("amerob"));
    assert_eq!(event.asset_url.as_deref(), Some("https://assets/amerob.webp"));
}

#[tokio::test]
async fn s2_new_species_calls_generator_and_persists_asset() {
    let repo = Arc::new(InMemoryRepository::default());
    let capture = seed_capture(&repo, 1).await;

    let classifier = Arc::new(ScriptedClassifier {
        outcome: ClassifyOutcome {
            species_code: "pilwoo".to_string(),
            common_name: "Pileated Woodpecker".to_string(),
            scientific_name: "Dryocopus pileatus".to_string(),
            confidence: 0.81,
        },
        calls: AtomicUsize::new(0),
    });
    let generator = Arc::new(ScriptedGenerator {
        outcome: GenerateOutcome {
            image: Some(AssetBlob {
                bytes: b"png bytes".to_vec(),
                content_type: "image/webp".to_string(),
            }),
            gif: None,
        },
        calls: AtomicUsize::new(0),
    });
    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe("user:u1");

    let clip_store: SharedBlobStore = Arc::new(InMemoryBlobStore::new("https://clips"));
    clip_store.put("clip-hash", b"clip bytes".to_vec(), "audio/wav").await.unwrap();
    let ctx = PipelineContext {
        repository: repo.clone(),
        clip_store,
        asset_store: Arc::new(InMemoryBlobStore::new("https://assets")),
        classifier,
        generator: generator.clone(),
        bus,
        clock: Arc::new(SystemClock),
    };

    pipeline::run_capture(&ctx, &capture.id).await;

    let after = repo.get_capture(&capture.id).await.unwrap();
    assert_eq!(after.status, CaptureStatus::Processed);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);

    let species = repo.get_species("pilwoo").await.unwrap();
    assert!(species.has_asset());

    let mut processed_event = None;
    while let Ok(event) = events.try_recv() {
        if event.kind == CaptureEventType::Processed {
            processed_event = Some(event);
        }
    }
    let event = processed_event.expect("a processed event must have been published");
    assert!(event.asset_url.is_some());
}

#[tokio::test]
async fn s3_duplicate_upload_produces_one_capture_and_one_classifier_call() {
    let repo = Arc::new(InMemoryRepository::default());
    let clip_store: SharedBlobStore = Arc::new(InMemoryBlobStore::new("https://clips"));
    clip_store.put("clip-hash", b"clip bytes".to_vec(), "audio/wav").await.unwrap();

    let first = repo
        .create_capture("u1", "d1", "clip-hash", 7, SystemClock.now())
        .await
        .unwrap();
    let second = repo
        .create_capture("u1", "d1", "clip-hash", 7, SystemClock.now())
        .await
        .unwrap();

    let (CreateCaptureOutcome::Created(a), CreateCaptureOutcome::Duplicate(b)) = (first, second) else {
        panic!("second create_capture with the same (device, sequence) must report Duplicate");
    };
    assert_eq!(a.id, b.id);

    let classifier = Arc::new(ScriptedClassifier {
        outcome: ClassifyOutcome {
            species_code: "amerob".to_string(),
            common_name: "American Robin".to_string(),
            scientific_name: "Turdus migratorius".to_string(),
            confidence: 0.9,
        },
        calls: AtomicUsize::new(0),
    });
    let ctx = PipelineContext {
        repository: repo.clone(),
        clip_store,
        asset_store: Arc::new(InMemoryBlobStore::new("https://assets")),
        classifier: classifier.clone(),
        generator: Arc::new(NoopGenerator),
        bus: Arc::new(EventBus::default()),
        clock: Arc::new(SystemClock),
    };

    // Both HTTP requests would submit the same capture id; running the
    // pipeline twice for it must still only touch the classifier once,
    // since the second run's `claim` step finds the capture already
    // claimed (or terminal) and aborts.
    pipeline::run_capture(&ctx, &a.id).await;
    pipeline::run_capture(&ctx, &a.id).await;

    assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn s4_classifier_unavailable_marks_capture_failed() {
    let repo = Arc::new(InMemoryRepository::default());
    let capture = seed_capture(&repo, 1).await;

    let classifier = Arc::new(FailingClassifier {
        calls: AtomicUsize::new(0),
    });
    let generator = Arc::new(FailingGenerator {
        calls: AtomicUsize::new(0),
    });
    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe("user:u1");

    let clip_store: SharedBlobStore = Arc::new(InMemoryBlobStore::new("https://clips"));
    clip_store.put("clip-hash", b"clip bytes".to_vec(), "audio/wav").await.unwrap();
    let ctx = PipelineContext {
        repository: repo.clone(),
        clip_store,
        asset_store: Arc::new(InMemoryBlobStore::new("https://assets")),
        classifier,
        generator: generator.clone(),
        bus,
        clock: Arc::new(SystemClock),
    };

    pipeline::run_capture(&ctx, &capture.id).await;

    let after = repo.get_capture(&capture.id).await.unwrap();
    assert_eq!(after.status, CaptureStatus::Failed);
    assert_eq!(after.failure_reason.as_deref(), Some("Unavailable"));
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);

    let mut failed_event = None;
    while let Ok(event) = events.try_recv() {
        if event.kind == CaptureEventType::Failed {
            failed_event = Some(event);
        }
    }
    let event = failed_event.expect("a failed event must have been published");
    assert_eq!(event.reason.as_deref(), Some("Unavailable"));
}

#[tokio::test]
async fn s5_art_generation_failure_still_processes_with_note() {
    let repo = Arc::new(InMemoryRepository::default());
    let capture = seed_capture(&repo, 1).await;

    let classifier = Arc::new(ScriptedClassifier {
        outcome: ClassifyOutcome {
            species_code: "cowbrd".to_string(),
            common_name: "Brown-headed Cowbird".to_string(),
            scientific_name: "Molothrus ater".to_string(),
            confidence: 0.7,
        },
        calls: AtomicUsize::new(0),
    });
    let generator = Arc::new(FailingGenerator {
        calls: AtomicUsize::new(0),
    });
    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe("user:u1");

    let clip_store: SharedBlobStore = Arc::new(InMemoryBlobStore::new("https://clips"));
    clip_store.put("clip-hash", b"clip bytes".to_vec(), "audio/wav").await.unwrap();
    let ctx = PipelineContext {
        repository: repo.clone(),
        clip_store,
        asset_store: Arc::new(InMemoryBlobStore::new("https://assets")),
        classifier,
        generator,
        bus,
        clock: Arc::new(SystemClock),
    };

    pipeline::run_capture(&ctx, &capture.id).await;

    let after = repo.get_capture(&capture.id).await.unwrap();
    assert_eq!(after.status, CaptureStatus::Processed);
    assert_eq!(after.note.as_deref(), Some("artUnavailable"));

    let species = repo.get_species("cowbrd").await.unwrap();
    assert!(!species.has_asset());

    let mut processed_event = None;
    while let Ok(event) = events.try_recv() {
        if event.kind == CaptureEventType::Processed {
            processed_event = Some(event);
        }
    }
    let event = processed_event.expect("a processed event must have been published");
    assert_eq!(event.species_code.as_deref(), Some("cowbrd"));
    assert!(event.asset_url.is_none());
}

#[tokio::test]
async fn s6_orphaned_capture_is_reaped_and_not_reclassified() {
    use songbird_core::clock::test_util::FixedClock;
    use songbird_core::model::CapturePatch;
    use songbird_core::reaper::{sweep_once, ReaperConfig};

    let repo: songbird_core::SharedRepository = Arc::new(InMemoryRepository::default());
    let clock = Arc::new(FixedClock::new(SystemClock.now()));
    let bus = EventBus::default();

    let capture = match repo
        .create_capture("u1", "d1", "clip-hash", 1, clock.now())
        .await
        .unwrap()
    {
        CreateCaptureOutcome::Created(capture) => capture,
        CreateCaptureOutcome::Duplicate(_) => panic!("expected a fresh capture"),
    };
    // Simulate a worker that claimed the capture, then crashed mid-flight.
    repo.transition_capture(
        &capture.id,
        &[CaptureStatus::Pending],
        CaptureStatus::Classifying,
        CapturePatch::claim(),
    )
    .await
    .unwrap();

    clock.advance(chrono::Duration::seconds(121));

    let config = ReaperConfig::default();
    sweep_once(&config, &repo, &bus, clock.as_ref()).await;

    let after = repo.get_capture(&capture.id).await.unwrap();
    assert_eq!(after.status, CaptureStatus::Failed);
    assert_eq!(after.failure_reason.as_deref(), Some("Orphaned"));

    let classifier = Arc::new(ScriptedClassifier {
        outcome: ClassifyOutcome {
            species_code: "amerob".to_string(),
            common_name: "American Robin".to_string(),
            scientific_name: "Turdus migratorius".to_string(),
            confidence: 0.9,
        },
        calls: AtomicUsize::new(0),
    });
    let clip_store: SharedBlobStore = Arc::new(InMemoryBlobStore::new("https://clips"));
    clip_store.put("clip-hash", b"clip bytes".to_vec(), "audio/wav").await.unwrap();
    let ctx = PipelineContext {
        repository: repo.clone(),
        clip_store,
        asset_store: Arc::new(InMemoryBlobStore::new("https://assets")),
        classifier: classifier.clone(),
        generator: Arc::new(NoopGenerator),
        bus: Arc::new(EventBus::default()),
        clock: clock.clone(),
    };
    // A stray dispatcher retry for the already-reaped capture id must not
    // result in a second classifier call — `claim` fails because the
    // capture is already terminal.
    pipeline::run_capture(&ctx, &capture.id).await;
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
}
