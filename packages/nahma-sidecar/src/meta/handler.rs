//! Metadata broker WebSocket handler.
//!
//! Connection lifecycle: `connecting → keyed → active → closing`. The
//! first accepted frame must be `set-key` with a 32-byte hex session key;
//! every other frame before that gets `AUTH_REQUIRED`. After keying, the
//! connection gets a sender task and frames dispatch through
//! [`ops::handle_frame`].
//!
//! Failure policy: malformed frames (invalid JSON, missing or unknown
//! `type`) are logged and dropped — the connection stays open.
//! Authorization and validation failures produce typed error replies.
//! Rate limiting applies per session key across all metadata operations.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::ops;
use crate::protocol::{ClientFrame, ErrorCode, ServerFrame};
use crate::state::SidecarState;

/// Router for the metadata endpoint.
pub fn router(state: SidecarState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/meta", get(ws_handler))
        .route("/health", get(crate::http::health_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SidecarState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_meta_socket(socket, state))
}

/// Validate a `set-key` payload: 32 bytes of hex, normalized to lowercase.
fn parse_session_key(payload: &str) -> Option<String> {
    if payload.len() == 64 && payload.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(payload.to_lowercase())
    } else {
        None
    }
}

pub async fn handle_meta_socket(socket: WebSocket, state: SidecarState) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // ── Step 1: wait for set-key ──────────────────────────────────────────

    let user = loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(ClientFrame::SetKey { payload }) => match parse_session_key(&payload) {
                        Some(user) => {
                            let status = ServerFrame::Status {
                                version: env!("CARGO_PKG_VERSION").to_string(),
                            };
                            if send_json(&mut ws_sender, &status).await.is_err() {
                                return;
                            }
                            break user;
                        }
                        None => {
                            let err = ServerFrame::error(
                                ErrorCode::Validation,
                                "Session key must be 32 bytes of hex",
                            );
                            let _ = send_json(&mut ws_sender, &err).await;
                        }
                    },
                    Ok(_) => {
                        let err = ServerFrame::error(
                            ErrorCode::AuthRequired,
                            "Send set-key before other operations",
                        );
                        let _ = send_json(&mut ws_sender, &err).await;
                    }
                    Err(e) => {
                        // Malformed frame: log and drop, stay open
                        tracing::debug!(error = %e, "Dropping malformed metadata frame");
                    }
                }
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = ws_sender.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) | None => return,
            _ => continue,
        }
    };

    // ── Step 2: register + sender task ────────────────────────────────────

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    state.register_meta_conn(&conn_id, &user, tx);

    let sender_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize server frame");
                }
            }
        }
    });

    // ── Step 3: dispatch frames ───────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::SetKey { .. }) => {
                    state.send_to_meta(
                        &conn_id,
                        ServerFrame::error(ErrorCode::Conflict, "Session is already keyed"),
                    );
                }
                Ok(frame) => {
                    if let Err(retry_after) = state.rate.check(&user) {
                        state.send_to_meta(
                            &conn_id,
                            ServerFrame::error(
                                ErrorCode::RateLimited,
                                format!("Rate limited; retry in {}s", retry_after),
                            ),
                        );
                        continue;
                    }
                    ops::handle_frame(&state, &conn_id, &user, frame);
                }
                Err(e) => {
                    tracing::debug!(
                        user = user.as_str(),
                        error = %e,
                        "Dropping malformed metadata frame"
                    );
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(user = user.as_str(), error = %e, "Metadata socket error");
                break;
            }
        }
    }

    // ── Step 4: cleanup ───────────────────────────────────────────────────

    state.cleanup_meta_conn(&conn_id);
    sender_task.abort();
}

async fn send_json(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), ()> {
    let json = serde_json::to_string(frame).map_err(|_| ())?;
    sender.send(Message::Text(json)).await.map_err(|_| ())
}
