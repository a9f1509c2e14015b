//! `AppState` (C7/C9 host wiring): the `Arc`-of-collaborators bundle handed
//! to every axum handler via `with_state`. Grounded on the pack's `ApiState`
//! shape (config facade, telemetry, event bus, and lock-guarded maps behind
//! one state struct) — generalized here to the Coordinator's collaborators
//! and kept `Clone` (all fields are already `Arc`s or `Copy` durations) since
//! axum requires the state type to implement `Clone`.

use std::sync::Arc;
use std::time::Duration;

use songbird_core::bus::EventBus;
use songbird_core::clock::Clock;
use songbird_core::dispatcher::Dispatcher;
use songbird_core::inference::{SharedClassifier, SharedGenerator};
use songbird_core::ratelimit::DeviceRateLimiter;
use songbird_core::repository::SharedRepository;
use songbird_core::store::SharedBlobStore;

use crate::auth::AuthVerifier;

#[derive(Clone)]
pub struct AppState {
    pub repository: SharedRepository,
    pub clip_store: SharedBlobStore,
    pub asset_store: SharedBlobStore,
    pub classifier: SharedClassifier,
    pub generator: SharedGenerator,
    pub bus: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
    pub dispatcher: Arc<Dispatcher>,
    pub rate_limiter: Arc<DeviceRateLimiter>,
    pub auth: Arc<dyn AuthVerifier>,
    pub max_upload_bytes: usize,
    pub ws_ping_interval: Duration,
    pub ws_backpressure_grace: Duration,
    /// `Retry-After` value advertised on 429s, derived from the rate
    /// limiter's refill rate (§4.6).
    pub rate_limit_retry_after_secs: u64,
}
