//! `WS /logs/websocket_logs/{app_id}` (§6): streams `LogEntry` inserts for
//! one application, filtered by an optional `function_id` subscribed by the
//! client. Grounded on the teacher's websocket log-tail pattern: a broadcast
//! subscription fed into the socket loop with client frames narrowing the
//! filter, the same shape as tailing a server's console over a socket.

use std::collections::HashSet;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::db::{Collection, LogEntry, Operation};

use super::auth::validate_log_stream_token;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct LogStreamQuery {
    pub token: String,
}

pub async fn websocket_logs(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    Query(query): Query<LogStreamQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match validate_log_stream_token(&query.token, &state.config.auth.jwt_secret) {
        Ok(claims) if claims.app_id == app_id => {
            ws.on_upgrade(move |socket| handle_socket(socket, state, app_id))
        }
        _ => axum::http::StatusCode::UNAUTHORIZED.into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum ClientFrame {
    Subscribe { function_id: Option<String> },
    Unsubscribe { function_id: Option<String> },
}

async fn handle_socket(mut socket: WebSocket, state: AppState, app_id: String) {
    let mut rx = state.db.change_feed().subscribe();
    // `None` in this set means "all functions"; starts subscribed to
    // everything until the client narrows it.
    let mut function_filter: HashSet<Option<String>> = HashSet::from([None]);

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Subscribe { function_id }) => {
                                function_filter.insert(function_id);
                            }
                            Ok(ClientFrame::Unsubscribe { function_id }) => {
                                function_filter.remove(&function_id);
                            }
                            Err(e) => warn!(%e, "malformed log-stream frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Err(e)) => {
                        warn!(app_id, %e, "log-stream socket error");
                        return;
                    }
                    _ => {}
                }
            }
            event = rx.recv() => {
                let event = match event {
                    Ok(e) => e,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(app_id, skipped = n, "log stream lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                };
                if event.collection != Collection::LogEntries || event.operation != Operation::Insert {
                    continue;
                }
                let Ok(entry) = serde_json::from_value::<LogEntry>(event.document) else {
                    continue;
                };
                if entry.app_id.as_deref() != Some(app_id.as_str()) {
                    continue;
                }
                if !function_filter.contains(&None) && !function_filter.contains(&entry.function_id) {
                    continue;
                }
                let Ok(payload) = serde_json::to_string(&entry) else {
                    continue;
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    debug!(app_id, "log-stream client disconnected");
                    return;
                }
            }
        }
    }
}
