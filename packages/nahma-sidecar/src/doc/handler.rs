//! Document relay WebSocket handler.
//!
//! Session lifecycle per connection: admit (authenticated by session key,
//! viewer required), sync handshake (first frame must be a sync-request
//! within the timeout), then live updates and awareness until close.
//!
//! Updates are encrypted under the per-document storage key and appended
//! to the log before being fanned out verbatim to every other subscriber;
//! the origin never receives its own echo. Awareness is fanned out and
//! never persisted. Re-issued sync-requests at any time re-serve the diff,
//! so a client that suspects missed state just asks again.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use nahma_core::crypto::encrypt_update;
use nahma_core::permissions::{Action, EntityRef};

use super::wire::{self, DocFrame};
use crate::protocol::ErrorCode;
use crate::state::SidecarState;

/// The handshake must arrive within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum length of an update body.
const MIN_UPDATE_LEN: usize = 2;

#[derive(Deserialize)]
pub struct DocQuery {
    key: Option<String>,
}

/// Router for the document endpoint: `/doc/:doc_id?key=<session key hex>`.
pub fn router(state: SidecarState) -> Router {
    Router::new()
        .route("/doc/:doc_id", get(ws_handler))
        .route("/health", get(crate::http::health_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(doc_id): Path<String>,
    Query(query): Query<DocQuery>,
    State(state): State<SidecarState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_doc_socket(socket, state, doc_id, query.key))
}

/// Validate the session key query parameter: 32 bytes of hex.
fn parse_session_key(key: Option<&str>) -> Option<String> {
    let key = key?;
    if key.len() == 64 && key.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(key.to_lowercase())
    } else {
        None
    }
}

pub async fn handle_doc_socket(
    mut socket: WebSocket,
    state: SidecarState,
    doc_id: String,
    key: Option<String>,
) {
    // ── Admission ─────────────────────────────────────────────────────────

    let user = match parse_session_key(key.as_deref()) {
        Some(user) => user,
        None => {
            let _ = socket
                .send(Message::Binary(wire::encode_error(
                    ErrorCode::AuthRequired,
                    "Missing or malformed session key",
                )))
                .await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    if state.store.get_document(&doc_id).ok().flatten().is_none() {
        let _ = socket
            .send(Message::Binary(wire::encode_error(
                ErrorCode::NotFound,
                "Unknown document",
            )))
            .await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let entity = EntityRef::document(doc_id.clone());
    if state.permissions.check(&user, &entity, Action::View).is_err() {
        let _ = socket
            .send(Message::Binary(wire::encode_error(
                ErrorCode::PermissionDenied,
                "viewer permission required",
            )))
            .await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    // ── Subscribe ─────────────────────────────────────────────────────────

    let conn_id = uuid::Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    state.subscribe_doc(&conn_id, &doc_id, &user, tx);
    state.ensure_doc_observer(&doc_id);

    let sender_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Binary(frame)).await.is_err() {
                break;
            }
        }
    });

    // ── Sync handshake ────────────────────────────────────────────────────

    let handshake_ok = match tokio::time::timeout(HANDSHAKE_TIMEOUT, ws_receiver.next()).await {
        Ok(Some(Ok(Message::Binary(frame)))) => match wire::decode(&frame) {
            Some(DocFrame::SyncRequest(_vector)) => {
                serve_sync_reply(&state, &conn_id, &doc_id);
                true
            }
            _ => false,
        },
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
            state.cleanup_doc_conn(&conn_id);
            sender_task.abort();
            return;
        }
        // Text frames, protocol errors, or timeout
        _ => false,
    };

    if !handshake_ok {
        tracing::warn!(doc_id = doc_id.as_str(), "Sync handshake failed");
        send_doc_error(&state, &conn_id, ErrorCode::Validation, "Expected sync-request");
        state.cleanup_doc_conn(&conn_id);
        // Give the error frame a moment to flush before tearing down
        tokio::time::sleep(Duration::from_millis(50)).await;
        sender_task.abort();
        return;
    }

    // ── Live traffic ──────────────────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Binary(frame)) => {
                handle_doc_frame(&state, &conn_id, &doc_id, &user, &frame);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // Text, Ping, Pong — nothing to route
            Err(e) => {
                tracing::debug!(doc_id = doc_id.as_str(), error = %e, "Document socket error");
                break;
            }
        }
    }

    // ── Cleanup ───────────────────────────────────────────────────────────

    state.cleanup_doc_conn(&conn_id);
    sender_task.abort();
    tracing::debug!(doc_id = doc_id.as_str(), "Document session closed");
}

fn handle_doc_frame(
    state: &SidecarState,
    conn_id: &str,
    doc_id: &str,
    user: &str,
    frame: &[u8],
) {
    let decoded = match wire::decode(frame) {
        Some(decoded) => decoded,
        None => {
            tracing::debug!(doc_id = doc_id, len = frame.len(), "Dropping malformed doc frame");
            return;
        }
    };

    match decoded {
        DocFrame::SyncRequest(_vector) => {
            // Resync: serve a fresh diff against whatever the client claims
            serve_sync_reply(state, conn_id, doc_id);
        }

        DocFrame::Update(body) => {
            if body.len() < MIN_UPDATE_LEN {
                send_doc_error(state, conn_id, ErrorCode::Validation, "Update too short");
                return;
            }

            // Authorization happens at execution time: a permission change
            // since subscribe rejects the edit here.
            let entity = EntityRef::document(doc_id.to_string());
            if let Err(e) = state.permissions.check(user, &entity, Action::Edit) {
                tracing::debug!(doc_id = doc_id, user = user, "Update rejected: {}", e);
                send_doc_error(state, conn_id, ErrorCode::PermissionDenied, "editor permission required");
                return;
            }

            let key = match state.doc_keys.document_key(doc_id) {
                Ok(key) => key,
                Err(e) => {
                    tracing::error!(doc_id = doc_id, error = %e, "Key derivation failed");
                    send_doc_error(state, conn_id, ErrorCode::Transient, "Key derivation failed");
                    return;
                }
            };
            let ciphertext = match encrypt_update(body, &key) {
                Ok(ciphertext) => ciphertext,
                Err(e) => {
                    tracing::error!(doc_id = doc_id, error = %e, "Update encryption failed");
                    send_doc_error(state, conn_id, ErrorCode::Transient, "Encryption failed");
                    return;
                }
            };
            if let Err(e) = state
                .store
                .append_update(doc_id, &ciphertext, nahma_core::time::now_millis())
            {
                tracing::error!(doc_id = doc_id, error = %e, "Update append failed");
                send_doc_error(state, conn_id, ErrorCode::Transient, "Persistence failed");
                return;
            }

            // Fan out the original frame verbatim; the origin gets no echo
            state.fanout_doc(doc_id, frame, conn_id);
        }

        DocFrame::Awareness(body) => {
            state.set_awareness(doc_id, conn_id, body.to_vec());
            state.fanout_doc(doc_id, frame, conn_id);
        }

        DocFrame::SyncAck => {}
    }
}

/// Decrypt the log and serve it as one sync-reply frame plus an ack.
fn serve_sync_reply(state: &SidecarState, conn_id: &str, doc_id: &str) {
    let key = match state.doc_keys.document_key(doc_id) {
        Ok(key) => key,
        Err(e) => {
            tracing::error!(doc_id = doc_id, error = %e, "Key derivation failed");
            send_doc_error(state, conn_id, ErrorCode::Transient, "Key derivation failed");
            return;
        }
    };

    let records = match state.store.load_updates(doc_id) {
        Ok(records) => records,
        Err(e) => {
            tracing::error!(doc_id = doc_id, error = %e, "Update log load failed");
            send_doc_error(state, conn_id, ErrorCode::Transient, "Persistence failed");
            return;
        }
    };

    let mut updates = Vec::with_capacity(records.len());
    for record in records {
        match nahma_core::crypto::decrypt_update(&record.ciphertext, &key) {
            Ok(update) => updates.push(update),
            Err(_) => {
                // A single corrupt record must not block resync
                tracing::error!(
                    doc_id = doc_id,
                    seq = record.seq,
                    "Skipping undecryptable log record"
                );
            }
        }
    }

    if let Some(conn) = state.doc_conns.get(conn_id) {
        let _ = conn.tx.send(wire::encode_sync_reply(&updates));
        let _ = conn.tx.send(wire::encode_sync_ack());
    }
}

fn send_doc_error(state: &SidecarState, conn_id: &str, code: ErrorCode, message: &str) {
    if let Some(conn) = state.doc_conns.get(conn_id) {
        let _ = conn.tx.send(wire::encode_error(code, message));
    }
}
