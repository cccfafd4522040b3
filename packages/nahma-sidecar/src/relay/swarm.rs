//! Swarm adapter: the opaque peer-transport collaborator.
//!
//! Desktop peers reach each other through a swarm layer the relay plane
//! treats as a black box: join/leave a topic, broadcast bytes, receive
//! events. Nothing here assumes in-order delivery between peers — the
//! client CRDT layer absorbs reordering and duplication.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::protocol::{PeerEntry, PeerIdentity};

/// Events surfaced by a swarm adapter.
#[derive(Debug, Clone)]
pub enum SwarmEvent {
    Sync {
        topic: String,
        peer_id: String,
        data: Vec<u8>,
    },
    Awareness {
        topic: String,
        peer_id: String,
        state: serde_json::Value,
    },
    PeerJoined {
        topic: String,
        peer_id: String,
        identity: PeerIdentity,
    },
    PeerLeft {
        topic: String,
        peer_id: String,
    },
}

/// The pluggable swarm transport contract.
///
/// Implementations must make `join_topic`/`leave_topic` idempotent: the
/// relay calls join on every local subscriber arrival.
#[async_trait]
pub trait SwarmAdapter: Send + Sync {
    async fn initialize(&self, identity: &PeerIdentity);

    /// Join a rendezvous topic; returns peers already present there.
    async fn join_topic(&self, topic: &str) -> Vec<PeerEntry>;

    async fn leave_topic(&self, topic: &str);

    async fn broadcast_sync(&self, topic: &str, data: &[u8]);

    async fn broadcast_awareness(&self, topic: &str, state: &serde_json::Value);

    async fn destroy(&self);

    /// Take the event stream. Yields `None` after the first call.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SwarmEvent>>;
}

/// No-op adapter for deployments with no desktop swarm (mobile/web only).
pub struct NullSwarmAdapter;

#[async_trait]
impl SwarmAdapter for NullSwarmAdapter {
    async fn initialize(&self, _identity: &PeerIdentity) {}

    async fn join_topic(&self, topic: &str) -> Vec<PeerEntry> {
        tracing::debug!(topic = topic, "Null swarm join");
        Vec::new()
    }

    async fn leave_topic(&self, _topic: &str) {}

    async fn broadcast_sync(&self, _topic: &str, _data: &[u8]) {}

    async fn broadcast_awareness(&self, _topic: &str, _state: &serde_json::Value) {}

    async fn destroy(&self) {}

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SwarmEvent>> {
        None
    }
}

/// Channel-backed adapter used by tests: records outbound broadcasts and
/// lets the test inject inbound events.
pub struct ChannelSwarmAdapter {
    pub outbound: mpsc::UnboundedSender<(String, Vec<u8>)>,
    events: std::sync::Mutex<Option<mpsc::UnboundedReceiver<SwarmEvent>>>,
}

impl ChannelSwarmAdapter {
    /// Returns the adapter, a receiver of its outbound sync broadcasts,
    /// and a sender for injecting inbound swarm events.
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<(String, Vec<u8>)>,
        mpsc::UnboundedSender<SwarmEvent>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: out_tx,
                events: std::sync::Mutex::new(Some(event_rx)),
            },
            out_rx,
            event_tx,
        )
    }
}

#[async_trait]
impl SwarmAdapter for ChannelSwarmAdapter {
    async fn initialize(&self, _identity: &PeerIdentity) {}

    async fn join_topic(&self, _topic: &str) -> Vec<PeerEntry> {
        Vec::new()
    }

    async fn leave_topic(&self, _topic: &str) {}

    async fn broadcast_sync(&self, topic: &str, data: &[u8]) {
        let _ = self.outbound.send((topic.to_string(), data.to_vec()));
    }

    async fn broadcast_awareness(&self, _topic: &str, _state: &serde_json::Value) {}

    async fn destroy(&self) {}

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SwarmEvent>> {
        self.events.lock().ok().and_then(|mut guard| guard.take())
    }
}
