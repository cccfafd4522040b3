//! Metadata broker protocol definitions.
//!
//! The broker speaks JSON-over-WebSocket. Every frame carries a top-level
//! `type` in kebab-case; payload fields are camelCase. Malformed frames are
//! logged and dropped by the handler — the protocol layer only defines the
//! shapes.

use serde::{Deserialize, Serialize};

use nahma_core::permissions::{EntityKind, PermissionChange, PermissionLevel};
use nahma_core::storage::{DocumentRecord, FolderRecord, WorkspaceRecord};
use nahma_core::Error as CoreError;

// ── Client → Server ───────────────────────────────────────────────────────────

/// Creation payload for `create-workspace`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInit {
    pub id: Option<String>,
    pub name: String,
}

/// Creation payload for `create-folder`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderSpec {
    pub id: Option<String>,
    pub workspace_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub is_system: Option<bool>,
}

/// Creation payload for `create-document`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSpec {
    pub id: Option<String>,
    pub workspace_id: String,
    pub folder_id: Option<String>,
    pub name: String,
    pub doc_type: Option<String>,
}

/// Frames sent from a client to the metadata broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Bind this connection to a 32-byte session key (hex). Must be sent
    /// first; everything else gets `AUTH_REQUIRED` until then.
    SetKey {
        payload: String,
    },

    CreateWorkspace {
        workspace: WorkspaceInit,
    },
    #[serde(rename_all = "camelCase")]
    UpdateWorkspace {
        workspace_id: String,
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    DeleteWorkspace {
        workspace_id: String,
    },
    ListWorkspaces,
    /// Subscribe this session to a workspace's event stream.
    JoinWorkspace {
        workspace: String,
    },
    LeaveWorkspace {
        workspace: String,
    },

    CreateFolder {
        folder: FolderSpec,
    },
    #[serde(rename_all = "camelCase")]
    RenameFolder {
        folder_id: String,
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    MoveFolder {
        folder_id: String,
        parent_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    DeleteFolder {
        folder_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RestoreFolder {
        folder_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ListFolders {
        workspace_id: String,
    },

    CreateDocument {
        document: DocumentSpec,
    },
    #[serde(rename_all = "camelCase")]
    RenameDocument {
        doc_id: String,
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    MoveDocument {
        doc_id: String,
        folder_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    DeleteDocument {
        doc_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RestoreDocument {
        doc_id: String,
    },
    #[serde(rename_all = "camelCase")]
    OpenDocument {
        doc_id: String,
    },

    #[serde(rename_all = "camelCase")]
    CreateInvite {
        entity_type: EntityKind,
        entity_id: String,
        permission: PermissionLevel,
        expires_at: Option<i64>,
        max_uses: Option<i64>,
    },
    RedeemInvite {
        token: String,
    },
    InvalidateInvite {
        token: String,
    },

    #[serde(rename_all = "camelCase")]
    UpdateCollaboratorPermission {
        entity_type: Option<EntityKind>,
        entity_id: String,
        user_id: String,
        permission: PermissionLevel,
    },
}

// ── Server → Client ───────────────────────────────────────────────────────────

/// Frames sent from the broker to a client, directly or as a
/// workspace-scoped broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    /// Session-key acknowledgement.
    Status {
        version: String,
    },

    WorkspaceCreated {
        workspace: WorkspaceRecord,
    },
    WorkspaceUpdated {
        workspace: WorkspaceRecord,
    },
    #[serde(rename_all = "camelCase")]
    WorkspaceDeleted {
        workspace_id: String,
    },
    WorkspaceList {
        workspaces: Vec<WorkspaceRecord>,
    },
    #[serde(rename_all = "camelCase")]
    WorkspaceJoined {
        workspace_id: String,
    },
    #[serde(rename_all = "camelCase")]
    WorkspaceLeft {
        workspace_id: String,
    },

    FolderCreated {
        folder: FolderRecord,
    },
    FolderRenamed {
        folder: FolderRecord,
    },
    FolderMoved {
        folder: FolderRecord,
    },
    /// Cascade delete: the full deleted id set plus every user who had any
    /// of the documents open.
    #[serde(rename_all = "camelCase")]
    FolderDeleted {
        folder_id: String,
        folder_ids: Vec<String>,
        document_ids: Vec<String>,
        affected_users: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    FolderRestored {
        folder_id: String,
        folder_ids: Vec<String>,
        document_ids: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    FolderList {
        workspace_id: String,
        folders: Vec<FolderRecord>,
    },

    DocumentCreated {
        document: DocumentRecord,
    },
    DocumentRenamed {
        document: DocumentRecord,
    },
    DocumentMoved {
        document: DocumentRecord,
    },
    #[serde(rename_all = "camelCase")]
    DocumentDeleted {
        doc_id: String,
    },
    DocumentRestored {
        document: DocumentRecord,
    },
    DocumentOpened {
        document: DocumentRecord,
    },

    #[serde(rename_all = "camelCase")]
    InviteCreated {
        token: String,
        entity_type: EntityKind,
        entity_id: String,
        permission: PermissionLevel,
        expires_at: Option<i64>,
        max_uses: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    InviteRedeemed {
        entity_id: String,
        permission: PermissionLevel,
    },
    InviteInvalidated {
        token: String,
    },
    /// Sent to each redeemer of an invalidated link so open sessions
    /// relying on it re-authorize.
    LinkInvalidated {
        token: String,
    },

    #[serde(rename_all = "camelCase")]
    PermissionChanged {
        user_id: String,
        entity_id: String,
        old_permission: PermissionLevel,
        new_permission: PermissionLevel,
    },

    Error {
        code: ErrorCode,
        message: String,
    },
}

impl ServerFrame {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code,
            message: message.into(),
        }
    }

    pub fn from_core_error(err: &CoreError) -> Self {
        ServerFrame::Error {
            code: ErrorCode::from_core(err),
            message: err.to_string(),
        }
    }

    pub fn permission_changed(change: &PermissionChange) -> Self {
        ServerFrame::PermissionChanged {
            user_id: change.user_id.clone(),
            entity_id: change.entity_id.clone(),
            old_permission: change.old_permission,
            new_permission: change.new_permission,
        }
    }
}

/// Stable error codes carried by `error{code, message}` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Frame received before `set-key`.
    AuthRequired,
    /// Resolved permission below requirement.
    PermissionDenied,
    /// Entity or invite does not exist, or is soft-deleted.
    NotFound,
    /// Expiry, use cap, or explicit invalidation.
    InviteExpired,
    /// Monotonic grant rejection or invariant violation.
    Conflict,
    /// Malformed payload, invalid id format, or length violation.
    Validation,
    /// Sliding-window cap exceeded.
    RateLimited,
    /// Persistence or downstream adapter failure; retry.
    Transient,
}

impl ErrorCode {
    pub fn from_core(err: &CoreError) -> Self {
        match err {
            CoreError::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            CoreError::NotFound(_) | CoreError::InviteNotFound | CoreError::NoIdentity => {
                ErrorCode::NotFound
            }
            CoreError::InviteExpired => ErrorCode::InviteExpired,
            CoreError::Conflict(_) | CoreError::IdentityExists => ErrorCode::Conflict,
            CoreError::Validation(_)
            | CoreError::InvalidKey(_)
            | CoreError::DocumentWithoutFolder
            | CoreError::InvalidRecoveryPhrase(_)
            | CoreError::WrongPassword
            | CoreError::UnsupportedVersion(_)
            | CoreError::DecryptionFailed
            | CoreError::VerificationFailed => ErrorCode::Validation,
            CoreError::DatabaseError(_)
            | CoreError::StorageIo(_)
            | CoreError::EncryptionFailed(_)
            | CoreError::KeyDerivationFailed(_) => ErrorCode::Transient,
        }
    }
}
