//! # Error Handling
//!
//! All fallible operations in Nahma Core return `Result<T, Error>`. Errors
//! are grouped by domain so the sidecar can map them onto stable wire codes
//! without string matching.

use thiserror::Error;

/// Result type alias for Nahma Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Nahma Core
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Identity Errors
    // ========================================================================

    /// No identity has been stored yet
    #[error("No identity found. Create or import an identity first.")]
    NoIdentity,

    /// An identity already exists on disk
    #[error("An identity already exists. Delete it before creating a new one.")]
    IdentityExists,

    /// The passphrase failed to decrypt the identity envelope
    #[error("Wrong password")]
    WrongPassword,

    /// The identity blob carries a version this build does not understand
    #[error("Unsupported identity blob version: {0}")]
    UnsupportedVersion(u32),

    /// Invalid recovery phrase
    #[error("Invalid recovery phrase: {0}")]
    InvalidRecoveryPhrase(String),

    // ========================================================================
    // Crypto Errors
    // ========================================================================

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed — integrity, length or key failure
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Signature verification failed
    #[error("Signature verification failed")]
    VerificationFailed,

    /// Invalid key format or length
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Key derivation failed
    #[error("Failed to derive keys: {0}")]
    KeyDerivationFailed(String),

    /// A document key was requested without a containing folder path
    #[error("Cannot derive a document key without a folder path")]
    DocumentWithoutFolder,

    // ========================================================================
    // Storage Errors
    // ========================================================================

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Entity not found, or soft-deleted
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invariant violation (e.g. cycle in the folder tree, purged document)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Failed to read or write a file on disk
    #[error("Storage I/O error: {0}")]
    StorageIo(String),

    // ========================================================================
    // Permission Errors
    // ========================================================================

    /// The resolved permission is below what the action requires
    #[error("Permission denied: requires {required}, have {actual}")]
    PermissionDenied { required: String, actual: String },

    // ========================================================================
    // Invite Errors
    // ========================================================================

    /// The invite token does not exist
    #[error("Invite not found")]
    InviteNotFound,

    /// Expired by clock, use cap, nuclear age, or explicit invalidation
    #[error("Invite expired")]
    InviteExpired,

    // ========================================================================
    // Validation
    // ========================================================================

    /// Malformed input at an API boundary
    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::DatabaseError(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::StorageIo(e.to_string())
    }
}
