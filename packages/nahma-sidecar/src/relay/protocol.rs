//! Relay plane protocol definitions.
//!
//! Topic-scoped pub/sub over JSON WebSocket frames. All payloads are opaque
//! to the relay — sync data is base64 of client-encrypted bytes, awareness
//! state is an arbitrary JSON value that is never persisted.

use serde::{Deserialize, Serialize};

/// A peer's self-declared identity, stored against the connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerIdentity {
    pub public_key: String,
    pub display_name: String,
    pub color: Option<String>,
}

/// One entry of a `peers-list` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerEntry {
    pub peer_id: String,
    pub identity: PeerIdentity,
}

// ── Client → Relay ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayClientFrame {
    /// Declare this connection's identity. Required before joining topics.
    Identity {
        identity: PeerIdentity,
    },

    /// Subscribe to a topic (hex string derived from the topic hash).
    JoinTopic {
        topic: String,
    },

    LeaveTopic {
        topic: String,
    },

    /// Opaque sync payload, fanned out to every other local subscriber and
    /// forwarded to the swarm.
    Sync {
        topic: String,
        /// base64 of the binary payload
        data: String,
    },

    /// Ephemeral awareness state; same routing as sync, never persisted.
    Awareness {
        topic: String,
        state: serde_json::Value,
    },
}

// ── Relay → Client ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayServerFrame {
    #[serde(rename_all = "camelCase")]
    IdentityAck {
        client_id: String,
    },

    /// Sent to a new joiner: everyone already subscribed to the topic.
    PeersList {
        topic: String,
        peers: Vec<PeerEntry>,
    },

    #[serde(rename_all = "camelCase")]
    PeerJoined {
        topic: String,
        peer_id: String,
        identity: PeerIdentity,
    },

    #[serde(rename_all = "camelCase")]
    PeerLeft {
        topic: String,
        peer_id: String,
    },

    #[serde(rename_all = "camelCase")]
    Sync {
        topic: String,
        /// Originating peer; absent when the frame came from this server's
        /// own safety-net path.
        peer_id: Option<String>,
        data: String,
    },

    #[serde(rename_all = "camelCase")]
    Awareness {
        topic: String,
        peer_id: Option<String>,
        state: serde_json::Value,
    },

    Error {
        code: crate::protocol::ErrorCode,
        message: String,
    },
}

/// Reserved topic namespace for the workspace-meta safety net (see the
/// duplicate-observer guard in the CRDT relay).
pub const WORKSPACE_META_PREFIX: &str = "workspace-meta:";

/// A topic is valid when it is the hex form of at least 2 bytes, or lives
/// in the reserved workspace-meta namespace. Anything else is malformed
/// and dropped.
pub fn is_valid_topic(topic: &str) -> bool {
    if let Some(rest) = topic.strip_prefix(WORKSPACE_META_PREFIX) {
        return !rest.is_empty();
    }
    topic.len() >= 4 && topic.len() % 2 == 0 && topic.chars().all(|c| c.is_ascii_hexdigit())
}
