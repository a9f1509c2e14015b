//! Subscription Gateway (C9, §4.8): upgrades `GET /v1/ws?token=...` to a
//! long-lived session that fans out `user:<id>` events as JSON frames.
//!
//! The select-loop shape (bus receiver / inbound frame / ping ticker, each
//! handled in one `tokio::select!` arm) mirrors the teacher's event-forwarder
//! task in `dictum-app::main` (`Ok` / `Err(Lagged(n))` / `Err(Closed)` on a
//! broadcast receiver); backpressure and missed-ping tracking are new, since
//! the teacher forwards to an in-process Tauri channel that never blocks.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use songbird_core::events::user_topic;

use crate::auth::AuthenticatedUser;
use crate::state::AppState;

/// Sessions tolerate this many consecutive missed pings before the gateway
/// gives up on the client (§4.8 step 4: "three pings" means this many ticks
/// elapse with no pong in between).
const MAX_MISSED_PINGS: u32 = 3;

pub async fn upgrade(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_session(socket, state, user_id))
}

async fn run_session(socket: WebSocket, state: AppState, user_id: String) {
    let topic = user_topic(&user_id);
    let mut events = state.bus.subscribe(&topic);
    let (mut sink, mut stream) = socket.split();

    let mut ping_ticker = tokio::time::interval(state.ws_ping_interval);
    ping_ticker.tick().await; // first tick fires immediately; skip it
    let mut missed_pings: u32 = 0;

    loop {
        tokio::select! {
            _ = ping_ticker.tick() => {
                missed_pings += 1;
                if missed_pings > MAX_MISSED_PINGS {
                    debug!(user_id = %user_id, "closing session after missed pings");
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                let frame = Message::Text(json!({"type": "ping"}).to_string().into());
                if !send_with_backpressure(&mut sink, frame, state.ws_backpressure_grace).await {
                    warn!(user_id = %user_id, "closing session: backpressure grace exceeded");
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if is_pong(&text) {
                            missed_pings = 0;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(user_id = %user_id, error = %err, "websocket read error");
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(payload) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if !send_with_backpressure(&mut sink, Message::Text(payload.into()), state.ws_backpressure_grace).await {
                            warn!(user_id = %user_id, "closing session: backpressure grace exceeded");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(user_id = %user_id, dropped = n, "subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

fn is_pong(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str().map(str::to_string)))
        .is_some_and(|t| t == "pong")
}

/// Sends `msg`, closing the session (by returning `false`) if the send
/// doesn't complete within `grace` — the client's socket buffer has been
/// saturated for too long (§4.8 step 6).
async fn send_with_backpressure(
    sink: &mut (impl futures_util::Sink<Message> + Unpin),
    msg: Message,
    grace: Duration,
) -> bool {
    matches!(tokio::time::timeout(grace, sink.send(msg)).await, Ok(Ok(())))
}
