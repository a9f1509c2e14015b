pub mod captures;
pub mod devices;
pub mod health;
pub mod ws;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/devices/register", post(devices::register))
        .route("/v1/devices/{id}/heartbeat", post(devices::heartbeat))
        .route("/v1/captures", post(captures::upload).get(captures::list))
        .route("/v1/captures/{id}", get(captures::get_one))
        .route("/v1/ws", get(ws::upgrade))
        .route("/healthz", get(health::healthz))
        .with_state(state)
}
