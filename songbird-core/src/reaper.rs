//! Reaper: periodic sweep that terminates Captures stuck in a non-terminal
//! state beyond a configured age (§4.4 "Worker death mid-state", §8
//! property 9).
//!
//! Uses the same conditional write as the pipeline — `transition_capture`
//! guarded by the observed `from_states` — so a reaper sweep racing a
//! worker that is still legitimately processing a young-but-slow capture
//! can never clobber it: the guard only matches captures that are *still*
//! in the state the reaper listed, and a genuinely stuck capture is the
//! only thing that stays there past the threshold.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::bus::EventBus;
use crate::clock::Clock;
use crate::events::{user_topic, CaptureEvent};
use crate::model::{CaptureStatus, CapturePatch};
use crate::repository::{RepoError, Repository, SharedRepository};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_STALE_AGE: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy)]
pub struct ReaperConfig {
    pub sweep_interval: Duration,
    pub stale_age: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            stale_age: DEFAULT_STALE_AGE,
        }
    }
}

const NON_TERMINAL: [CaptureStatus; 4] = [
    CaptureStatus::Pending,
    CaptureStatus::Classifying,
    CaptureStatus::Classified,
    CaptureStatus::Generating,
];

/// Run the reaper loop until `shutdown` fires. Intended to be spawned as a
/// background task alongside the Dispatcher.
pub async fn run(
    config: ReaperConfig,
    repository: SharedRepository,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.sweep_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep_once(&config, &repository, &bus, clock.as_ref()).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// One sweep pass, exposed separately so tests can drive it without waiting
/// on the interval ticker.
pub async fn sweep_once(
    config: &ReaperConfig,
    repository: &SharedRepository,
    bus: &EventBus,
    clock: &dyn Clock,
) {
    let threshold = clock.now()
        - chrono::Duration::from_std(config.stale_age).unwrap_or_else(|_| chrono::Duration::seconds(120));

    let stale = match repository.find_stale_captures(threshold).await {
        Ok(captures) => captures,
        Err(err) => {
            warn!(error = %err, "reaper failed to list stale captures");
            return;
        }
    };

    for capture in stale {
        let now = clock.now();
        let result = repository
            .transition_capture(
                &capture.id,
                &NON_TERMINAL,
                CaptureStatus::Failed,
                {
                    let mut patch = CapturePatch::failed("Orphaned");
                    patch.processed_at = Some(now);
                    patch
                },
            )
            .await;

        match result {
            Ok(_) => {
                info!(capture_id = %capture.id, "reaped orphaned capture");
                bus.publish(
                    &user_topic(&capture.user_id),
                    CaptureEvent::failed(capture.id.clone(), "Orphaned", now),
                );
            }
            Err(RepoError::InvalidTransition) => {
                // A worker finished (or claimed) it between the scan and
                // this write — not our job anymore.
            }
            Err(err) => {
                warn!(capture_id = %capture.id, error = %err, "reaper failed to transition stale capture");
            }
        }
    }
}
