//! Socket-level end-to-end tests: real listeners on 127.0.0.1:0, driven
//! with tokio-tungstenite clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use nahma_core::permissions::{EntityRef, PermissionLevel};
use nahma_core::storage::{DocumentInit, Store};

use nahma_sidecar::relay::swarm::NullSwarmAdapter;
use nahma_sidecar::state::{SidecarConfig, SidecarState};
use nahma_sidecar::{build_state, doc, meta, relay};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

fn test_state() -> SidecarState {
    let store = Arc::new(Store::open_in_memory().unwrap());
    build_state(
        store,
        [7u8; 32],
        Arc::new(NullSwarmAdapter),
        SidecarConfig::default(),
    )
}

async fn serve(app: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn connect(url: &str) -> WsClient {
    let (ws, _) = connect_async(url).await.expect("WebSocket connect failed");
    ws
}

async fn recv_json(ws: &mut WsClient) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("Timed out waiting for frame")
            .expect("Socket closed")
            .expect("Socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("Frame is not JSON");
        }
    }
}

async fn recv_binary(ws: &mut WsClient) -> Vec<u8> {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("Timed out waiting for frame")
            .expect("Socket closed")
            .expect("Socket error");
        if let Message::Binary(bytes) = msg {
            return bytes;
        }
    }
}

async fn send_json(ws: &mut WsClient, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

fn key_a() -> String {
    "aa".repeat(32)
}

fn key_b() -> String {
    "bb".repeat(32)
}

/// Open a metadata connection and complete the set-key handshake.
async fn keyed_meta_client(addr: SocketAddr, key: &str) -> WsClient {
    let mut ws = connect(&format!("ws://{}/", addr)).await;
    send_json(&mut ws, serde_json::json!({ "type": "set-key", "payload": key })).await;
    let status = recv_json(&mut ws).await;
    assert_eq!(status["type"], "status");
    ws
}

// ── Metadata broker ───────────────────────────────────────────────────────────

#[tokio::test]
async fn meta_requires_set_key_first() {
    let state = test_state();
    let addr = serve(meta::router(state)).await;

    let mut ws = connect(&format!("ws://{}/", addr)).await;
    send_json(&mut ws, serde_json::json!({ "type": "list-workspaces" })).await;

    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "AUTH_REQUIRED");
}

#[tokio::test]
async fn meta_malformed_frames_keep_connection_open() {
    let state = test_state();
    let addr = serve(meta::router(state)).await;

    let mut ws = keyed_meta_client(addr, &key_a()).await;

    // Invalid JSON, missing type, unknown type: all logged and dropped
    ws.send(Message::Text("{not json".to_string())).await.unwrap();
    send_json(&mut ws, serde_json::json!({ "payload": "x" })).await;
    send_json(&mut ws, serde_json::json!({ "type": "no-such-op" })).await;

    // The connection still works
    send_json(&mut ws, serde_json::json!({ "type": "list-workspaces" })).await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "workspace-list");
}

#[tokio::test]
async fn workspace_isolation_across_sessions() {
    // S6: C1 creates W1; C2 never joins it and must see no trace of it.
    let state = test_state();
    let addr = serve(meta::router(state)).await;

    let mut c1 = keyed_meta_client(addr, &key_a()).await;
    send_json(
        &mut c1,
        serde_json::json!({ "type": "create-workspace", "workspace": { "name": "W1" } }),
    )
    .await;
    let created = recv_json(&mut c1).await;
    assert_eq!(created["type"], "workspace-created");
    let w1_id = created["workspace"]["id"].as_str().unwrap().to_string();

    let mut c2 = keyed_meta_client(addr, &key_b()).await;
    send_json(&mut c2, serde_json::json!({ "type": "list-workspaces" })).await;
    let listing = recv_json(&mut c2).await;
    assert_eq!(listing["type"], "workspace-list");

    let ids: Vec<&str> = listing["workspaces"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|w| w["id"].as_str())
        .collect();
    assert!(!ids.contains(&w1_id.as_str()));
    assert!(ids.is_empty());
}

#[tokio::test]
async fn share_link_redemption_flow() {
    // S1: editor invite with maxUses = 2; A and B redeem, C gets
    // INVITE_EXPIRED.
    let state = test_state();
    let addr = serve(meta::router(state)).await;

    let mut owner = keyed_meta_client(addr, &"0a".repeat(32)).await;
    send_json(
        &mut owner,
        serde_json::json!({ "type": "create-workspace", "workspace": { "name": "Shared" } }),
    )
    .await;
    let created = recv_json(&mut owner).await;
    let ws_id = created["workspace"]["id"].as_str().unwrap().to_string();

    send_json(
        &mut owner,
        serde_json::json!({
            "type": "create-invite",
            "entityType": "workspace",
            "entityId": ws_id,
            "permission": "editor",
            "maxUses": 2
        }),
    )
    .await;
    let invite = recv_json(&mut owner).await;
    assert_eq!(invite["type"], "invite-created");
    let token = invite["token"].as_str().unwrap().to_string();

    for key in [key_a(), key_b()] {
        let mut client = keyed_meta_client(addr, &key).await;
        send_json(
            &mut client,
            serde_json::json!({ "type": "redeem-invite", "token": token }),
        )
        .await;
        let reply = recv_json(&mut client).await;
        assert_eq!(reply["type"], "invite-redeemed");
        assert_eq!(reply["permission"], "editor");
    }

    let mut late = keyed_meta_client(addr, &"cc".repeat(32)).await;
    send_json(
        &mut late,
        serde_json::json!({ "type": "redeem-invite", "token": token }),
    )
    .await;
    let reply = recv_json(&mut late).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "INVITE_EXPIRED");
}

#[tokio::test]
async fn broadcast_delivered_after_reply() {
    let state = test_state();
    let addr = serve(meta::router(state.clone())).await;

    let mut owner = keyed_meta_client(addr, &key_a()).await;
    send_json(
        &mut owner,
        serde_json::json!({ "type": "create-workspace", "workspace": { "name": "W" } }),
    )
    .await;
    let ws_id = recv_json(&mut owner).await["workspace"]["id"]
        .as_str()
        .unwrap()
        .to_string();

    // Member joins the workspace event stream
    state
        .permissions
        .grant(&key_b(), &EntityRef::workspace(&ws_id), PermissionLevel::Editor)
        .unwrap();
    let mut member = keyed_meta_client(addr, &key_b()).await;
    send_json(
        &mut member,
        serde_json::json!({ "type": "join-workspace", "workspace": ws_id }),
    )
    .await;
    assert_eq!(recv_json(&mut member).await["type"], "workspace-joined");

    // Owner creates a document: owner sees the direct reply, member the
    // broadcast with the same payload
    send_json(
        &mut owner,
        serde_json::json!({
            "type": "create-document",
            "document": { "workspaceId": ws_id, "name": "Notes" }
        }),
    )
    .await;

    let reply = recv_json(&mut owner).await;
    assert_eq!(reply["type"], "document-created");

    let broadcast = recv_json(&mut member).await;
    assert_eq!(broadcast["type"], "document-created");
    assert_eq!(broadcast["document"]["id"], reply["document"]["id"]);
}

// ── CRDT relay ────────────────────────────────────────────────────────────────

/// Seed a workspace + document owned by `owner` directly in the store.
fn seed_document(state: &SidecarState, owner: &str, doc_id: &str) -> String {
    let ws_id = "ws-e2e".to_string();
    state
        .store
        .create_workspace(&ws_id, "W", owner, nahma_core::time::now_millis())
        .unwrap();
    state
        .permissions
        .grant(owner, &EntityRef::workspace(&ws_id), PermissionLevel::Owner)
        .unwrap();
    state
        .store
        .create_document(
            DocumentInit {
                id: doc_id.to_string(),
                workspace_id: ws_id.clone(),
                folder_id: None,
                name: "Doc".to_string(),
                doc_type: "doc".to_string(),
            },
            nahma_core::time::now_millis(),
        )
        .unwrap();
    ws_id
}

/// Complete the doc-socket handshake: sync-request out, sync-reply + ack
/// back. Returns the updates served in the reply.
async fn doc_handshake(ws: &mut WsClient) -> Vec<Vec<u8>> {
    ws.send(Message::Binary(vec![0x00, 0x00])).await.unwrap();

    let reply = recv_binary(ws).await;
    assert_eq!(reply[0], 0x01, "expected sync-reply");
    let updates = doc::wire::decode_sync_reply(&reply).unwrap();

    let ack = recv_binary(ws).await;
    assert_eq!(ack[0], 0x02, "expected sync-ack");

    updates
}

#[tokio::test]
async fn doc_updates_fan_out_and_persist() {
    // S2 at the relay level: two subscribers, each receives the other's
    // bytes exactly once, and a later join replays the full log.
    let state = test_state();
    let owner = key_a();
    seed_document(&state, &owner, "d-1");
    let addr = serve(doc::router(state.clone())).await;
    let url = format!("ws://{}/doc/d-1?key={}", addr, owner);

    let mut a = connect(&url).await;
    let mut b = connect(&url).await;
    assert!(doc_handshake(&mut a).await.is_empty());
    assert!(doc_handshake(&mut b).await.is_empty());

    // A types "Hello ", B types "World!" — opaque bytes to the relay
    a.send(Message::Binary(doc::wire::encode_update(b"insert:Hello ")))
        .await
        .unwrap();
    b.send(Message::Binary(doc::wire::encode_update(b"insert:World!")))
        .await
        .unwrap();

    // Each peer sees exactly the other's update, no echo
    let to_b = recv_binary(&mut b).await;
    assert_eq!(&to_b[1..], b"insert:Hello ");
    let to_a = recv_binary(&mut a).await;
    assert_eq!(&to_a[1..], b"insert:World!");

    // The log persisted both, in arrival order, decryptable on resync
    let mut late = connect(&url).await;
    let replayed = doc_handshake(&mut late).await;
    assert_eq!(replayed.len(), 2);
    assert!(replayed.contains(&b"insert:Hello ".to_vec()));
    assert!(replayed.contains(&b"insert:World!".to_vec()));

    // At-rest records are ciphertext, not the raw update bytes
    let stored = state.store.load_updates("d-1").unwrap();
    assert!(stored.iter().all(|r| r.ciphertext != b"insert:Hello "));
}

#[tokio::test]
async fn doc_permission_downgrade_rejects_edit() {
    // S3: an editor is downgraded mid-session; the next update is refused
    // and nothing is appended.
    let state = test_state();
    let owner = key_a();
    let member = key_b();
    let ws_id = seed_document(&state, &owner, "d-1");
    state
        .permissions
        .grant(&member, &EntityRef::workspace(&ws_id), PermissionLevel::Editor)
        .unwrap();

    let addr = serve(doc::router(state.clone())).await;
    let mut ws = connect(&format!("ws://{}/doc/d-1?key={}", addr, member)).await;
    doc_handshake(&mut ws).await;

    // First edit lands; wait for it to reach the log before downgrading
    ws.send(Message::Binary(doc::wire::encode_update(b"edit-1")))
        .await
        .unwrap();
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while state.store.load_updates("d-1").unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "edit-1 never persisted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Owner downgrades the member to viewer
    state
        .permissions
        .set(&member, &EntityRef::workspace(&ws_id), PermissionLevel::Viewer)
        .unwrap();

    // The next edit is rejected at execution time
    ws.send(Message::Binary(doc::wire::encode_update(b"edit-2")))
        .await
        .unwrap();

    let reply = recv_binary(&mut ws).await;
    assert_eq!(reply[0], 0x05, "expected error frame");
    let err: serde_json::Value = serde_json::from_slice(&reply[1..]).unwrap();
    assert_eq!(err["code"], "PERMISSION_DENIED");

    // Only the first edit is in the log
    assert_eq!(state.store.load_updates("d-1").unwrap().len(), 1);
}

#[tokio::test]
async fn doc_socket_requires_session_key() {
    let state = test_state();
    seed_document(&state, &key_a(), "d-1");
    let addr = serve(doc::router(state)).await;

    let mut ws = connect(&format!("ws://{}/doc/d-1", addr)).await;
    let reply = recv_binary(&mut ws).await;
    assert_eq!(reply[0], 0x05);
    let err: serde_json::Value = serde_json::from_slice(&reply[1..]).unwrap();
    assert_eq!(err["code"], "AUTH_REQUIRED");
}

// ── Relay plane ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn relay_topic_join_and_sync() {
    // S5: B is in topic T; A joins, B hears peer-joined, A gets B in its
    // peers-list; A's sync reaches B tagged with A's peer id.
    let state = test_state();
    let addr = serve(relay::router(state)).await;
    let url = format!("ws://{}/", addr);
    let topic = "deadbeefcafe";

    let mut b = connect(&url).await;
    send_json(
        &mut b,
        serde_json::json!({
            "type": "identity",
            "identity": { "publicKey": key_b(), "displayName": "B", "color": null }
        }),
    )
    .await;
    assert_eq!(recv_json(&mut b).await["type"], "identity-ack");

    send_json(&mut b, serde_json::json!({ "type": "join-topic", "topic": topic })).await;
    assert_eq!(recv_json(&mut b).await["type"], "peers-list");

    let mut a = connect(&url).await;
    send_json(
        &mut a,
        serde_json::json!({
            "type": "identity",
            "identity": { "publicKey": key_a(), "displayName": "A", "color": null }
        }),
    )
    .await;
    let ack = recv_json(&mut a).await;
    let a_id = ack["clientId"].as_str().unwrap().to_string();

    send_json(&mut a, serde_json::json!({ "type": "join-topic", "topic": topic })).await;

    // B hears peer-joined for A
    let joined = recv_json(&mut b).await;
    assert_eq!(joined["type"], "peer-joined");
    assert_eq!(joined["peerId"], a_id);

    // A's peers-list contains B
    let peers = recv_json(&mut a).await;
    assert_eq!(peers["type"], "peers-list");
    assert_eq!(peers["peers"].as_array().unwrap().len(), 1);
    assert_eq!(peers["peers"][0]["identity"]["displayName"], "B");

    // A sends sync data X; B receives it tagged with A
    send_json(
        &mut a,
        serde_json::json!({ "type": "sync", "topic": topic, "data": "WA==" }),
    )
    .await;
    let sync = recv_json(&mut b).await;
    assert_eq!(sync["type"], "sync");
    assert_eq!(sync["peerId"], a_id);
    assert_eq!(sync["data"], "WA==");
}

#[tokio::test]
async fn relay_short_topic_is_dropped() {
    let state = test_state();
    let addr = serve(relay::router(state)).await;

    let mut ws = connect(&format!("ws://{}/", addr)).await;
    send_json(
        &mut ws,
        serde_json::json!({
            "type": "identity",
            "identity": { "publicKey": key_a(), "displayName": "A", "color": null }
        }),
    )
    .await;
    assert_eq!(recv_json(&mut ws).await["type"], "identity-ack");

    // Under 2 binary bytes: silently dropped, no reply
    send_json(&mut ws, serde_json::json!({ "type": "join-topic", "topic": "ab" })).await;

    // A valid join afterwards still answers, proving the session survived
    send_json(
        &mut ws,
        serde_json::json!({ "type": "join-topic", "topic": "deadbeef" }),
    )
    .await;
    assert_eq!(recv_json(&mut ws).await["type"], "peers-list");
}
