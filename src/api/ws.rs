// =============================================================================
// WebSocket Handler — Push-based lifecycle event feed
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<service token>[&owner=<key>]` and
// receive:
//   1. An immediate snapshot of the Active signals they can see.
//   2. Every lifecycle event (Opened / ClosedTP / ClosedSL / ClosedManual)
//      as it is published on the broadcast sink.
//
// With `owner` set, only that owner's events and global-scope events are
// forwarded. A client that falls behind the broadcast buffer is told how
// many events it missed and keeps receiving from the current position.
//
// Browsers cannot set an Authorization header on an upgrade request, so the
// service token travels as a query parameter here.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::api::auth::token_matches;
use crate::app_state::AppState;
use crate::types::{LifecycleEvent, Signal, GLOBAL_OWNER};

// =============================================================================
// Query parameters & messages
// =============================================================================

#[derive(Deserialize)]
pub struct WsQuery {
    owner: Option<String>,
    token: Option<String>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsMessage<'a> {
    Snapshot { seq: u64, active: Vec<Signal> },
    Event { seq: u64, event: &'a LifecycleEvent },
    Lagged { seq: u64, missed: u64 },
}

/// Whether a client filtered on `owner` should see `event`.
pub fn wants(owner: Option<&str>, event: &LifecycleEvent) -> bool {
    match owner {
        None => true,
        Some(o) => event.owner_key == o || event.owner_key == GLOBAL_OWNER,
    }
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

/// Status to refuse an upgrade with, or `None` when the token is good.
fn upgrade_refusal(expected: Option<&str>, presented: Option<&str>) -> Option<StatusCode> {
    match (expected, presented) {
        (None, _) => Some(StatusCode::FORBIDDEN),
        (Some(_), None) => Some(StatusCode::UNAUTHORIZED),
        (Some(_), Some(token)) if token_matches(expected, token) => None,
        _ => Some(StatusCode::FORBIDDEN),
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> Response {
    if let Some(status) = upgrade_refusal(state.api_token.as_deref(), query.token.as_deref()) {
        warn!(status = %status, "WebSocket upgrade refused");
        return status.into_response();
    }
    info!(owner = ?query.owner, "WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, query.owner))
}

// =============================================================================
// Connection handler
// =============================================================================

/// Runs until the client disconnects or the event channel closes.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>, owner: Option<String>) {
    state.ws_clients.fetch_add(1, Ordering::Relaxed);

    // Subscribe before taking the snapshot so no event falls in between.
    let mut events = state.events.subscribe();
    let (mut sender, mut receiver) = socket.split();
    let mut seq: u64 = 0;

    let active: Vec<Signal> = state
        .store
        .list_active()
        .into_iter()
        .filter(|s| owner.as_deref().map_or(true, |o| s.owner_key == o || s.owner_key == GLOBAL_OWNER))
        .collect();
    seq += 1;
    if let Err(e) = send_json(&mut sender, &WsMessage::Snapshot { seq, active }).await {
        warn!(error = %e, "Failed to send initial WebSocket snapshot");
        cleanup(&state);
        return;
    }

    loop {
        tokio::select! {
            // ── Push: lifecycle events ──────────────────────────────────
            ev = events.recv() => {
                let msg_result = match ev {
                    Ok(event) => {
                        if !wants(owner.as_deref(), &event) {
                            continue;
                        }
                        seq += 1;
                        send_json(&mut sender, &WsMessage::Event { seq, event: &event }).await
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "WebSocket client lagged behind event feed");
                        seq += 1;
                        send_json(&mut sender, &WsMessage::Lagged { seq, missed }).await
                    }
                    Err(RecvError::Closed) => {
                        info!("event channel closed — disconnecting WebSocket");
                        break;
                    }
                };
                if let Err(e) = msg_result {
                    debug!(error = %e, "WebSocket send failed — disconnecting");
                    break;
                }
            }

            // ── Recv: client frames ─────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "Failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Text / binary / pong frames carry nothing for us.
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended (None)");
                        break;
                    }
                }
            }
        }
    }

    cleanup(&state);
}

// =============================================================================
// Helpers
// =============================================================================

async fn send_json<S>(sender: &mut S, msg: &WsMessage<'_>) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            // Serialisation errors are not network errors; don't disconnect.
            warn!(error = %e, "Failed to serialize WebSocket message");
            Ok(())
        }
    }
}

fn cleanup(state: &Arc<AppState>) {
    state.ws_clients.fetch_sub(1, Ordering::Relaxed);
    info!("WebSocket connection closed — cleanup complete");
}
