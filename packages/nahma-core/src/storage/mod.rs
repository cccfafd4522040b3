//! # Persistence
//!
//! Typed SQLite façade for workspaces, folders, documents, the per-document
//! CRDT update log, invites and permission grants.

mod database;
pub mod schema;

pub use database::{
    CascadeResult, DocState, DocumentInit, DocumentRecord, FolderInit, FolderRecord,
    InviteRecord, Store, StoreStats, UpdateRecord, WorkspaceRecord,
};
