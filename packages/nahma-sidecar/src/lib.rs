//! Nahma Sidecar
//!
//! A single process exposing the real-time collaboration plane of a Nahma
//! workspace:
//!
//! 1. **Metadata broker** (WebSocket): session-keyed workspace, folder,
//!    document and invite operations with per-workspace broadcast.
//! 2. **CRDT relay** (WebSocket): per-document binary update fan-out with
//!    encrypted persistence and state-vector resync.
//! 3. **P2P relay plane** (WebSocket): topic pub/sub for clients without
//!    direct connectivity, bridged to a pluggable swarm adapter.
//! 4. **HTTP adjunct**: the `/join/*` invite landing shell.
//!
//! The relay never sees workspace plaintext beyond metadata the user chose
//! to sync — CRDT payloads are opaque bytes, encrypted again at rest.

pub mod doc;
pub mod http;
pub mod meta;
pub mod protocol;
pub mod rate_limit;
pub mod relay;
pub mod state;

use std::path::Path;
use std::sync::Arc;

use nahma_core::crypto::generate_key;
use nahma_core::storage::Store;
use nahma_core::Result;

use relay::swarm::SwarmAdapter;
use state::{SidecarConfig, SidecarState};

/// File holding the storage master secret, next to the database.
const MASTER_KEY_FILE: &str = "master.key";

/// Load the 32-byte storage master secret, creating it on first boot.
/// `NO_PERSIST` runs use a fresh random secret.
pub fn load_or_create_master_key(storage_dir: &Path, no_persist: bool) -> Result<[u8; 32]> {
    if no_persist {
        return Ok(generate_key());
    }

    let path = storage_dir.join(MASTER_KEY_FILE);
    match std::fs::read_to_string(&path) {
        Ok(content) => {
            let bytes = hex::decode(content.trim()).map_err(|_| {
                nahma_core::Error::InvalidKey("Corrupt master key file".to_string())
            })?;
            bytes
                .try_into()
                .map_err(|_| nahma_core::Error::InvalidKey("Master key must be 32 bytes".into()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key = generate_key();
            std::fs::create_dir_all(storage_dir)?;
            std::fs::write(&path, hex::encode(key))?;
            tracing::info!(path = %path.display(), "Generated storage master key");
            Ok(key)
        }
        Err(e) => Err(e.into()),
    }
}

/// Open the operational store per configuration.
pub fn open_store(config: &SidecarConfig) -> Result<Arc<Store>> {
    if config.no_persist {
        tracing::info!("Persistence disabled (NO_PERSIST); using in-memory store");
        Ok(Arc::new(Store::open_in_memory()?))
    } else {
        std::fs::create_dir_all(&config.storage_dir)?;
        let path = config.storage_dir.join("nahma.db");
        tracing::info!(path = %path.display(), "Opening store");
        Ok(Arc::new(Store::open(path)?))
    }
}

/// Assemble the shared state and spawn the swarm bridge if the adapter
/// produces events.
pub fn build_state(
    store: Arc<Store>,
    master_key: [u8; 32],
    swarm: Arc<dyn SwarmAdapter>,
    config: SidecarConfig,
) -> SidecarState {
    let state = SidecarState::new(store, master_key, swarm, config);

    if let Some(events) = state.swarm.take_events() {
        let bridge_state = state.clone();
        tokio::spawn(async move {
            relay::run_swarm_bridge(bridge_state, events).await;
        });
    }

    state
}
