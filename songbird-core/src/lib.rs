//! # songbird-core
//!
//! Coordinator core SDK: the capture pipeline, dispatcher, event bus, and
//! inference clients behind a field-device clip-to-species-and-art service.
//!
//! ## Architecture
//!
//! ```text
//! Ingress (songbird-server) → Dispatcher → Capture Pipeline
//!                                                │
//!                          Repository ◀──────────┼──────────▶ Clip/Asset Store
//!                                                │
//!                                       Classifier / Generator
//!                                                │
//!                                           Event Bus (per user)
//! ```
//!
//! Every collaborator the pipeline touches is a trait (`Repository`,
//! `BlobStore`, `Classifier`, `Generator`, `Clock`) so the state machine in
//! [`pipeline`] never depends on a concrete transport or storage engine.
//! `songbird-server` wires up the real (SQLite, filesystem, HTTP)
//! implementations; tests wire up the in-memory ones in this crate.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod bus;
pub mod clock;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod inference;
pub mod model;
pub mod pipeline;
pub mod ratelimit;
pub mod reaper;
pub mod repository;
pub mod store;

pub use bus::EventBus;
pub use clock::{Clock, IdGen, SystemClock, UuidIdGen};
pub use dispatcher::{Dispatcher, DispatcherConfig, SubmitOutcome};
pub use error::{CoreError, Result};
pub use events::CaptureEvent;
pub use inference::{Classifier, Generator, InferenceError, SharedClassifier, SharedGenerator};
pub use model::{Capture, CaptureStatus, Device, Species, User};
pub use pipeline::PipelineContext;
pub use ratelimit::{DeviceRateLimiter, RateLimitConfig};
pub use reaper::ReaperConfig;
pub use repository::{Repository, RepoError, SharedRepository};
pub use store::{BlobStore, SharedBlobStore, StoreError};

#[cfg(any(test, feature = "test-util"))]
pub use clock::test_util::{FixedClock, SequentialIdGen};
