//! P2P relay plane: topic-scoped pub/sub bridged to the swarm adapter.

pub mod handler;
pub mod protocol;
pub mod swarm;

pub use handler::{router, run_swarm_bridge};
