//! Metadata broker: session-keyed workspace/folder/document/invite bus.

pub mod handler;
pub mod ops;

pub use handler::router;
