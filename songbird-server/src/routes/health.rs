//! `GET /healthz` — liveness + shallow readiness probe. Not part of the
//! device-facing wire contract in §6; an operational addition in the same
//! spirit as the teacher's own health/status surface, unauthenticated so an
//! external prober doesn't need a credential.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use songbird_core::inference::BreakerState;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub dispatcher_in_flight: usize,
    pub rate_limiter_tracked_devices: usize,
    pub classifier_breaker: Option<BreakerState>,
    pub generator_breaker: Option<BreakerState>,
}

pub async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        dispatcher_in_flight: state.dispatcher.in_flight_len(),
        rate_limiter_tracked_devices: state.rate_limiter.len(),
        classifier_breaker: state.classifier.breaker_state(),
        generator_breaker: state.generator.breaker_state(),
    })
}
