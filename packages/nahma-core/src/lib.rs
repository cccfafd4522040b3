//! # Nahma Core
//!
//! Platform library for the Nahma collaboration sidecar.
//!
//! ## Modules
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`crypto`] | Key generation, padded secretbox encryption, Ed25519 signatures |
//! | [`kdf`] | Argon2id key derivation tree (passphrase → workspace → folder → document), topic hashes |
//! | [`identity`] | BIP39-backed identity, encrypted-at-rest store, export/import, devices |
//! | [`storage`] | Typed SQLite store: workspaces, folders, documents, update log, invites, grants |
//! | [`permissions`] | Hierarchy-resolving permission engine with monotonic grants |
//! | [`invites`] | Share-link lifecycle: create, redeem, invalidate, two-tier GC sweeps |
//!
//! The sidecar binary (`nahma-sidecar`) wires these into the metadata
//! broker, CRDT relay and P2P relay plane.

pub mod crypto;
pub mod error;
pub mod identity;
pub mod invites;
pub mod kdf;
pub mod permissions;
pub mod storage;
pub mod time;

pub use error::{Error, Result};
