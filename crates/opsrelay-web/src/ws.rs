use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::auth;

/// RFC 6455 policy-violation close code, sent for auth failures and
/// unknown instance ids.
const CLOSE_POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Bearer token for clients that cannot set headers on the upgrade.
    pub token: Option<String>,
}

/// GET /api/ws/command/{id}. Receive-only output stream for one
/// instance: buffered lines replayed in order, then live lines.
pub async fn command_stream(
    ws: WebSocketUpgrade,
    State(state): State<Arc<crate::AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Response {
    ws.on_upgrade(move |socket| stream_task(socket, state, headers, id, query.token))
}

async fn stream_task(
    mut socket: WebSocket,
    state: Arc<crate::AppState>,
    headers: HeaderMap,
    id: String,
    query_token: Option<String>,
) {
    let authorized = match &query_token {
        Some(token) => auth::verify_token(&state.tokens, token).is_ok(),
        None => auth::require_auth(&state.tokens, &headers).is_ok(),
    };
    if !authorized {
        close_with_policy_violation(&mut socket, "unauthorized").await;
        return;
    }

    let Some(instance) = state.registry.get(&id) else {
        close_with_policy_violation(&mut socket, "unknown command id").await;
        return;
    };

    // Snapshot + subscribe is atomic, so the replay and the live feed
    // join up with no gap and no duplicates.
    let (backlog, mut events) = instance.subscribe();
    debug!(id = %id, backlog = backlog.len(), "stream subscriber attached");

    for line in backlog {
        let payload = serde_json::to_string(&line).expect("line serializes");
        if socket.send(Message::Text(payload.into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            line = events.recv() => {
                match line {
                    Ok(line) => {
                        let payload = serde_json::to_string(&line).expect("line serializes");
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(id = %id, missed, "stream subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                // Receive-only channel: inbound data is ignored, but a
                // disconnect must drop the subscription.
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(id = %id, error = %err, "stream read error");
                        break;
                    }
                }
            }
        }
    }

    debug!(id = %id, "stream subscriber detached");
}

async fn close_with_policy_violation(socket: &mut WebSocket, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: reason.into(),
        })))
        .await;
}
