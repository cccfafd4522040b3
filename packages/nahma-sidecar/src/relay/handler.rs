//! Relay plane WebSocket handler.
//!
//! Clients behind NATs exchange sync and awareness datagrams through
//! topic-scoped pub/sub; desktop peers arrive through the swarm adapter.
//! Payloads are opaque — all E2E encryption happens client-side.
//!
//! Protocol errors and garbage data close the connection silently; the
//! server never initiates reconnection.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::protocol::{is_valid_topic, RelayClientFrame, RelayServerFrame};
use super::swarm::SwarmEvent;
use crate::protocol::ErrorCode;
use crate::state::SidecarState;

/// Router for the relay endpoint.
pub fn router(state: SidecarState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/relay", get(ws_handler))
        .route("/health", get(crate::http::health_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SidecarState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_relay_socket(socket, state))
}

pub async fn handle_relay_socket(socket: WebSocket, state: SidecarState) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayServerFrame>();

    state.register_relay_conn(&conn_id, tx);

    let sender_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize relay frame");
                }
            }
        }
    });

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<RelayClientFrame>(&text) {
                Ok(frame) => handle_relay_frame(&state, &conn_id, frame).await,
                Err(e) => {
                    // Garbage data: close silently
                    tracing::debug!(conn = conn_id.as_str(), error = %e, "Malformed relay frame");
                    break;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // Binary, Ping, Pong
            Err(e) => {
                tracing::debug!(conn = conn_id.as_str(), error = %e, "Relay socket error");
                break;
            }
        }
    }

    // Remove from every topic; leave the swarm for topics that emptied
    let emptied = state.cleanup_relay_conn(&conn_id);
    for topic in emptied {
        state.swarm.leave_topic(&topic).await;
    }
    sender_task.abort();
    tracing::debug!(conn = conn_id.as_str(), "Relay connection closed");
}

async fn handle_relay_frame(state: &SidecarState, conn_id: &str, frame: RelayClientFrame) {
    match frame {
        RelayClientFrame::Identity { identity } => {
            state.set_relay_identity(conn_id, identity.clone());
            state.swarm.initialize(&identity).await;
            state.send_to_relay(
                conn_id,
                RelayServerFrame::IdentityAck {
                    client_id: conn_id.to_string(),
                },
            );
        }

        RelayClientFrame::JoinTopic { topic } => {
            if !is_valid_topic(&topic) {
                tracing::debug!(topic = topic.as_str(), "Dropping malformed topic");
                return;
            }
            if state.relay_identity(conn_id).is_none() {
                state.send_to_relay(
                    conn_id,
                    RelayServerFrame::Error {
                        code: ErrorCode::AuthRequired,
                        message: "Send identity before joining topics".to_string(),
                    },
                );
                return;
            }

            handle_join_topic(state, conn_id, &topic).await;
        }

        RelayClientFrame::LeaveTopic { topic } => {
            if !is_valid_topic(&topic) {
                return;
            }
            match state.leave_topic(conn_id, &topic) {
                crate::state::TopicAfterLeave::Empty => {
                    state.swarm.leave_topic(&topic).await;
                }
                crate::state::TopicAfterLeave::Occupied => {
                    state.fanout_topic(
                        &topic,
                        &RelayServerFrame::PeerLeft {
                            topic: topic.clone(),
                            peer_id: conn_id.to_string(),
                        },
                        None,
                    );
                }
                crate::state::TopicAfterLeave::NotSubscribed => {}
            }
        }

        RelayClientFrame::Sync { topic, data } => {
            if !is_valid_topic(&topic) {
                return;
            }

            // Fan out to every other local subscriber, tagged with origin
            state.fanout_topic(
                &topic,
                &RelayServerFrame::Sync {
                    topic: topic.clone(),
                    peer_id: Some(conn_id.to_string()),
                    data: data.clone(),
                },
                Some(conn_id),
            );

            // And forward to the swarm for remote peers
            match base64::engine::general_purpose::STANDARD.decode(&data) {
                Ok(bytes) => state.swarm.broadcast_sync(&topic, &bytes).await,
                Err(_) => {
                    tracing::debug!(topic = topic.as_str(), "Sync payload is not base64");
                }
            }
        }

        RelayClientFrame::Awareness { topic, state: awareness } => {
            if !is_valid_topic(&topic) {
                return;
            }

            state.fanout_topic(
                &topic,
                &RelayServerFrame::Awareness {
                    topic: topic.clone(),
                    peer_id: Some(conn_id.to_string()),
                    state: awareness.clone(),
                },
                Some(conn_id),
            );

            state.swarm.broadcast_awareness(&topic, &awareness).await;
        }
    }
}

/// Join a topic: subscribe locally, join the swarm (idempotent), answer
/// with the peers already present, and announce the joiner to them.
async fn handle_join_topic(state: &SidecarState, conn_id: &str, topic: &str) {
    let local_peers = state.join_topic(conn_id, topic);

    let mut peers = local_peers;
    peers.extend(state.swarm.join_topic(topic).await);

    // Announce to existing local subscribers
    if let Some(identity) = state.relay_identity(conn_id) {
        state.fanout_topic(
            topic,
            &RelayServerFrame::PeerJoined {
                topic: topic.to_string(),
                peer_id: conn_id.to_string(),
                identity,
            },
            Some(conn_id),
        );
    }

    state.send_to_relay(
        conn_id,
        RelayServerFrame::PeersList {
            topic: topic.to_string(),
            peers,
        },
    );

    tracing::debug!(conn = conn_id, topic = topic, "Joined topic");
}

/// Bridge task: fan swarm-originated events out to local topic
/// subscribers, tagged with the originating peer id. The adapter makes no
/// ordering promises; none are assumed here.
pub async fn run_swarm_bridge(
    state: SidecarState,
    mut events: mpsc::UnboundedReceiver<SwarmEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SwarmEvent::Sync {
                topic,
                peer_id,
                data,
            } => {
                state.fanout_topic(
                    &topic,
                    &RelayServerFrame::Sync {
                        topic: topic.clone(),
                        peer_id: Some(peer_id),
                        data: base64::engine::general_purpose::STANDARD.encode(data),
                    },
                    None,
                );
            }
            SwarmEvent::Awareness {
                topic,
                peer_id,
                state: awareness,
            } => {
                state.fanout_topic(
                    &topic,
                    &RelayServerFrame::Awareness {
                        topic: topic.clone(),
                        peer_id: Some(peer_id),
                        state: awareness,
                    },
                    None,
                );
            }
            SwarmEvent::PeerJoined {
                topic,
                peer_id,
                identity,
            } => {
                state.fanout_topic(
                    &topic,
                    &RelayServerFrame::PeerJoined {
                        topic: topic.clone(),
                        peer_id,
                        identity,
                    },
                    None,
                );
            }
            SwarmEvent::PeerLeft { topic, peer_id } => {
                state.fanout_topic(
                    &topic,
                    &RelayServerFrame::PeerLeft {
                        topic: topic.clone(),
                        peer_id,
                    },
                    None,
                );
            }
        }
    }
}
