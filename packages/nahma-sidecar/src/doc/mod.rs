//! CRDT relay: per-document update fan-out with encrypted persistence.

pub mod handler;
pub mod keys;
pub mod wire;

pub use handler::router;
