//! Server state management.
//!
//! Tracks live connections and the three subscription sets (workspace,
//! document, topic), plus the duplicate-observer guard and open-document
//! bookkeeping. All registries are concurrent (DashMap/DashSet); mutators
//! take the relevant per-key entry, never a global lock.
//!
//! Every connection registers a cleanup path: on close the handle is
//! removed from every set it appears in.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;

use nahma_core::invites::InviteService;
use nahma_core::permissions::{PermissionChange, PermissionEngine};
use nahma_core::storage::Store;

use crate::doc::keys::DocKeyring;
use crate::protocol::ServerFrame;
use crate::rate_limit::RateLimiter;
use crate::relay::protocol::{PeerEntry, PeerIdentity, RelayServerFrame};
use crate::relay::swarm::SwarmAdapter;

/// Default metadata endpoint port.
pub const DEFAULT_META_PORT: u16 = 8081;

/// Default document endpoint port.
pub const DEFAULT_DOC_PORT: u16 = 8080;

/// Default relay plane port.
pub const DEFAULT_RELAY_PORT: u16 = 8082;

/// Default HTTP adjunct port.
pub const DEFAULT_HTTP_PORT: u16 = 3000;

/// Tier-1 invite sweep cadence.
pub const INVITE_CLEANUP_INTERVAL_MS: i64 = 3_600_000;

/// Tier-2 (nuclear) invite sweep cadence.
pub const NUCLEAR_CLEANUP_INTERVAL_MS: i64 = 21_600_000;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    pub meta_port: u16,
    pub doc_port: u16,
    pub relay_port: u16,
    pub http_port: u16,
    pub storage_dir: PathBuf,
    pub no_persist: bool,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            meta_port: DEFAULT_META_PORT,
            doc_port: DEFAULT_DOC_PORT,
            relay_port: DEFAULT_RELAY_PORT,
            http_port: DEFAULT_HTTP_PORT,
            storage_dir: PathBuf::from(".nahma"),
            no_persist: false,
        }
    }
}

/// Connection handle id.
pub type ConnId = String;

/// A metadata broker connection after `set-key`.
pub struct MetaConn {
    pub tx: mpsc::UnboundedSender<ServerFrame>,
    /// Hex session key = the user's identity public key.
    pub user: String,
}

/// A document relay connection.
pub struct DocConn {
    pub tx: mpsc::UnboundedSender<Vec<u8>>,
    pub doc_id: String,
    pub user: String,
}

/// A relay plane connection.
pub struct RelayConn {
    pub tx: mpsc::UnboundedSender<RelayServerFrame>,
    pub identity: Option<PeerIdentity>,
}

/// What `leave_topic` left behind.
#[derive(Debug, PartialEq, Eq)]
pub enum TopicAfterLeave {
    /// Topic still has local subscribers.
    Occupied,
    /// The leaving connection emptied the topic.
    Empty,
    /// The connection was not subscribed.
    NotSubscribed,
}

/// Shared server state.
#[derive(Clone)]
pub struct SidecarState {
    pub store: Arc<Store>,
    pub permissions: PermissionEngine,
    pub invites: InviteService,
    pub doc_keys: Arc<DocKeyring>,
    pub rate: RateLimiter,
    pub swarm: Arc<dyn SwarmAdapter>,
    pub config: SidecarConfig,

    /// Metadata connections, keyed by connection id.
    pub meta_conns: Arc<DashMap<ConnId, MetaConn>>,
    /// Document relay connections.
    pub doc_conns: Arc<DashMap<ConnId, DocConn>>,
    /// Relay plane connections.
    pub relay_conns: Arc<DashMap<ConnId, RelayConn>>,

    /// workspaceId → subscribed metadata connections.
    pub workspace_subs: Arc<DashMap<String, HashSet<ConnId>>>,
    /// docId → subscribed document connections.
    pub doc_subs: Arc<DashMap<String, HashSet<ConnId>>>,
    /// topic → subscribed relay connections.
    pub topic_subs: Arc<DashMap<String, HashSet<ConnId>>>,

    /// docId → connId → last awareness payload. Never persisted; evicted
    /// on connection close.
    pub awareness: Arc<DashMap<String, HashMap<ConnId, Vec<u8>>>>,

    /// docId → users who opened it via the metadata broker. Feeds the
    /// affected-user surface of cascade deletes.
    pub open_docs: Arc<DashMap<String, HashSet<String>>>,

    /// Duplicate-observer guard: at most one internal observer per doc.
    pub topic_observers: Arc<DashSet<String>>,
}

impl SidecarState {
    pub fn new(
        store: Arc<Store>,
        master_key: [u8; 32],
        swarm: Arc<dyn SwarmAdapter>,
        config: SidecarConfig,
    ) -> Self {
        Self {
            permissions: PermissionEngine::new(store.clone()),
            invites: InviteService::new(store.clone()),
            doc_keys: Arc::new(DocKeyring::new(master_key)),
            rate: RateLimiter::new(),
            swarm,
            config,
            store,
            meta_conns: Arc::new(DashMap::new()),
            doc_conns: Arc::new(DashMap::new()),
            relay_conns: Arc::new(DashMap::new()),
            workspace_subs: Arc::new(DashMap::new()),
            doc_subs: Arc::new(DashMap::new()),
            topic_subs: Arc::new(DashMap::new()),
            awareness: Arc::new(DashMap::new()),
            open_docs: Arc::new(DashMap::new()),
            topic_observers: Arc::new(DashSet::new()),
        }
    }

    // ── Metadata connections ──────────────────────────────────────────────

    pub fn register_meta_conn(
        &self,
        conn_id: &str,
        user: &str,
        tx: mpsc::UnboundedSender<ServerFrame>,
    ) {
        tracing::info!(conn = conn_id, user = user, "Metadata session keyed");
        self.meta_conns.insert(
            conn_id.to_string(),
            MetaConn {
                tx,
                user: user.to_string(),
            },
        );
    }

    /// Remove a metadata connection from the registry and from every
    /// workspace subscription set.
    pub fn cleanup_meta_conn(&self, conn_id: &str) {
        self.meta_conns.remove(conn_id);
        self.workspace_subs.retain(|_, subs| {
            subs.remove(conn_id);
            !subs.is_empty()
        });
        tracing::info!(conn = conn_id, "Metadata connection cleaned up");
    }

    pub fn meta_user(&self, conn_id: &str) -> Option<String> {
        self.meta_conns.get(conn_id).map(|c| c.user.clone())
    }

    pub fn join_workspace_subs(&self, conn_id: &str, workspace_id: &str) {
        self.workspace_subs
            .entry(workspace_id.to_string())
            .or_default()
            .insert(conn_id.to_string());
    }

    pub fn leave_workspace_subs(&self, conn_id: &str, workspace_id: &str) {
        if let Some(mut subs) = self.workspace_subs.get_mut(workspace_id) {
            subs.remove(conn_id);
        }
    }

    /// Send a frame to one metadata connection. Returns false if it is gone.
    pub fn send_to_meta(&self, conn_id: &str, frame: ServerFrame) -> bool {
        if let Some(conn) = self.meta_conns.get(conn_id) {
            conn.tx.send(frame).is_ok()
        } else {
            false
        }
    }

    /// Broadcast to every subscriber of a workspace except `origin`.
    /// Broadcasts are enqueued after the origin's direct reply, so every
    /// subscriber sees the reply-then-broadcast order the origin saw.
    pub fn broadcast_workspace(
        &self,
        workspace_id: &str,
        frame: &ServerFrame,
        origin: Option<&str>,
    ) {
        let subs: Vec<ConnId> = match self.workspace_subs.get(workspace_id) {
            Some(subs) => subs.iter().cloned().collect(),
            None => return,
        };

        for conn_id in subs {
            if origin == Some(conn_id.as_str()) {
                continue;
            }
            self.send_to_meta(&conn_id, frame.clone());
        }
    }

    /// Deliver a permission change to the affected user's connections that
    /// are subscribed to the workspace (the intersection of subscribers and
    /// affected user ids).
    pub fn broadcast_permission_change(&self, workspace_id: &str, change: &PermissionChange) {
        let subs: Vec<ConnId> = match self.workspace_subs.get(workspace_id) {
            Some(subs) => subs.iter().cloned().collect(),
            None => return,
        };

        let frame = ServerFrame::permission_changed(change);
        for conn_id in subs {
            let matches = self
                .meta_conns
                .get(&conn_id)
                .map(|c| c.user == change.user_id)
                .unwrap_or(false);
            if matches {
                self.send_to_meta(&conn_id, frame.clone());
            }
        }
    }

    /// Send a frame to every metadata connection a user holds, regardless
    /// of subscriptions (link-invalidated notifications).
    pub fn send_to_user(&self, user: &str, frame: &ServerFrame) {
        for entry in self.meta_conns.iter() {
            if entry.value().user == user {
                let _ = entry.value().tx.send(frame.clone());
            }
        }
    }

    // ── Document relay ────────────────────────────────────────────────────

    pub fn subscribe_doc(
        &self,
        conn_id: &str,
        doc_id: &str,
        user: &str,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    ) {
        self.doc_conns.insert(
            conn_id.to_string(),
            DocConn {
                tx,
                doc_id: doc_id.to_string(),
                user: user.to_string(),
            },
        );
        self.doc_subs
            .entry(doc_id.to_string())
            .or_default()
            .insert(conn_id.to_string());
        tracing::debug!(conn = conn_id, doc_id = doc_id, "Document subscriber added");
    }

    /// Remove a document connection from the subscriber set and awareness
    /// map. Drops the observer guard entry when the doc has no subscribers
    /// left.
    pub fn cleanup_doc_conn(&self, conn_id: &str) {
        let doc_id = match self.doc_conns.remove(conn_id) {
            Some((_, conn)) => conn.doc_id,
            None => return,
        };

        let mut now_empty = false;
        if let Some(mut subs) = self.doc_subs.get_mut(&doc_id) {
            subs.remove(conn_id);
            now_empty = subs.is_empty();
        }
        if now_empty {
            self.doc_subs.remove(&doc_id);
            self.topic_observers.remove(&doc_id);
        }

        if let Some(mut states) = self.awareness.get_mut(&doc_id) {
            states.remove(conn_id);
        }

        tracing::debug!(conn = conn_id, doc_id = doc_id.as_str(), "Document subscriber removed");
    }

    /// Fan a binary frame out to every other subscriber of a document.
    /// A failed send drops that subscriber only.
    pub fn fanout_doc(&self, doc_id: &str, frame: &[u8], origin: &str) {
        let subs: Vec<ConnId> = match self.doc_subs.get(doc_id) {
            Some(subs) => subs.iter().cloned().collect(),
            None => return,
        };

        let mut dead = Vec::new();
        for conn_id in subs {
            if conn_id == origin {
                continue;
            }
            let alive = self
                .doc_conns
                .get(&conn_id)
                .map(|c| c.tx.send(frame.to_vec()).is_ok())
                .unwrap_or(false);
            if !alive {
                dead.push(conn_id);
            }
        }

        for conn_id in dead {
            tracing::warn!(conn = conn_id.as_str(), doc_id = doc_id, "Dropping dead document subscriber");
            self.cleanup_doc_conn(&conn_id);
        }
    }

    pub fn set_awareness(&self, doc_id: &str, conn_id: &str, state: Vec<u8>) {
        self.awareness
            .entry(doc_id.to_string())
            .or_default()
            .insert(conn_id.to_string(), state);
    }

    /// Attach the internal observer for a doc. Returns true when this call
    /// attached it, false when one was already registered (no-op).
    pub fn ensure_doc_observer(&self, doc_id: &str) -> bool {
        self.topic_observers.insert(doc_id.to_string())
    }

    pub fn has_doc_observer(&self, doc_id: &str) -> bool {
        self.topic_observers.contains(doc_id)
    }

    pub fn mark_document_open(&self, doc_id: &str, user: &str) {
        self.open_docs
            .entry(doc_id.to_string())
            .or_default()
            .insert(user.to_string());
    }

    /// Users who had any of the given documents open.
    pub fn open_users(&self, doc_ids: &[String]) -> Vec<String> {
        let mut users = HashSet::new();
        for doc_id in doc_ids {
            if let Some(set) = self.open_docs.get(doc_id) {
                users.extend(set.iter().cloned());
            }
        }
        let mut users: Vec<String> = users.into_iter().collect();
        users.sort();
        users
    }

    // ── Relay plane ───────────────────────────────────────────────────────

    pub fn register_relay_conn(&self, conn_id: &str, tx: mpsc::UnboundedSender<RelayServerFrame>) {
        self.relay_conns.insert(
            conn_id.to_string(),
            RelayConn { tx, identity: None },
        );
    }

    pub fn set_relay_identity(&self, conn_id: &str, identity: PeerIdentity) {
        if let Some(mut conn) = self.relay_conns.get_mut(conn_id) {
            conn.identity = Some(identity);
        }
    }

    pub fn relay_identity(&self, conn_id: &str) -> Option<PeerIdentity> {
        self.relay_conns
            .get(conn_id)
            .and_then(|c| c.identity.clone())
    }

    pub fn send_to_relay(&self, conn_id: &str, frame: RelayServerFrame) -> bool {
        if let Some(conn) = self.relay_conns.get(conn_id) {
            conn.tx.send(frame).is_ok()
        } else {
            false
        }
    }

    /// Add a connection to a topic. Returns the peers that were already
    /// subscribed (for the joiner's `peers-list`).
    pub fn join_topic(&self, conn_id: &str, topic: &str) -> Vec<PeerEntry> {
        let mut subs = self.topic_subs.entry(topic.to_string()).or_default();

        let existing: Vec<PeerEntry> = subs
            .iter()
            .filter(|peer| peer.as_str() != conn_id)
            .filter_map(|peer| {
                self.relay_identity(peer).map(|identity| PeerEntry {
                    peer_id: peer.clone(),
                    identity,
                })
            })
            .collect();

        subs.insert(conn_id.to_string());
        existing
    }

    pub fn leave_topic(&self, conn_id: &str, topic: &str) -> TopicAfterLeave {
        let mut outcome = TopicAfterLeave::NotSubscribed;
        if let Some(mut subs) = self.topic_subs.get_mut(topic) {
            if subs.remove(conn_id) {
                outcome = if subs.is_empty() {
                    TopicAfterLeave::Empty
                } else {
                    TopicAfterLeave::Occupied
                };
            }
        }
        if outcome == TopicAfterLeave::Empty {
            self.topic_subs.remove(topic);
        }
        outcome
    }

    /// Fan a relay frame out to every local subscriber of a topic except
    /// `origin`.
    pub fn fanout_topic(&self, topic: &str, frame: &RelayServerFrame, origin: Option<&str>) {
        let subs: Vec<ConnId> = match self.topic_subs.get(topic) {
            Some(subs) => subs.iter().cloned().collect(),
            None => return,
        };

        for conn_id in subs {
            if origin == Some(conn_id.as_str()) {
                continue;
            }
            self.send_to_relay(&conn_id, frame.clone());
        }
    }

    /// Topics a relay connection is subscribed to, removing it from each.
    /// Returns the topics that became empty.
    pub fn cleanup_relay_conn(&self, conn_id: &str) -> Vec<String> {
        self.relay_conns.remove(conn_id);

        let topics: Vec<String> = self
            .topic_subs
            .iter()
            .filter(|entry| entry.value().contains(conn_id))
            .map(|entry| entry.key().clone())
            .collect();

        let mut emptied = Vec::new();
        for topic in topics {
            match self.leave_topic(conn_id, &topic) {
                TopicAfterLeave::Empty => emptied.push(topic),
                TopicAfterLeave::Occupied => {
                    self.fanout_topic(
                        &topic,
                        &RelayServerFrame::PeerLeft {
                            topic: topic.clone(),
                            peer_id: conn_id.to_string(),
                        },
                        None,
                    );
                }
                TopicAfterLeave::NotSubscribed => {}
            }
        }
        emptied
    }

    /// Safety-net broadcast: when no internal observer is attached for a
    /// document, changes about it are pushed to relay subscribers of the
    /// reserved `workspace-meta:<workspaceId>` topic.
    pub fn workspace_meta_fallback(&self, doc_id: &str, workspace_id: &str, payload: &[u8]) {
        if self.has_doc_observer(doc_id) {
            return;
        }
        let topic = format!(
            "{}{}",
            crate::relay::protocol::WORKSPACE_META_PREFIX,
            workspace_id
        );
        use base64::Engine;
        let frame = RelayServerFrame::Sync {
            topic: topic.clone(),
            peer_id: None,
            data: base64::engine::general_purpose::STANDARD.encode(payload),
        };
        self.fanout_topic(&topic, &frame, None);
    }

    /// Drop every live connection sender; used during shutdown to drain
    /// the fan-out sets after listeners stop accepting.
    pub fn drain_connections(&self) {
        self.meta_conns.clear();
        self.doc_conns.clear();
        self.relay_conns.clear();
        self.workspace_subs.clear();
        self.doc_subs.clear();
        self.topic_subs.clear();
        self.awareness.clear();
        self.topic_observers.clear();
    }

    /// Connection counts for the health endpoints.
    pub fn connection_counts(&self) -> (usize, usize, usize) {
        (
            self.meta_conns.len(),
            self.doc_conns.len(),
            self.relay_conns.len(),
        )
    }
}
