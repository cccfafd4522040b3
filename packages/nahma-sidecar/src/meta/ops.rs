//! Metadata broker operations.
//!
//! One handler per frame type. Every mutating operation follows the same
//! shape: permission check → store mutation → direct reply to the origin →
//! workspace-scoped broadcast to every other subscriber. Replies are
//! enqueued before broadcasts, and a failed store mutation suppresses the
//! broadcast entirely.

use nahma_core::permissions::{Action, EntityKind, EntityRef, PermissionLevel};
use nahma_core::storage::{DocumentInit, DocumentRecord, FolderInit, FolderRecord};
use nahma_core::time::now_millis;
use nahma_core::{Error, Result};

use crate::protocol::{ClientFrame, DocumentSpec, FolderSpec, ServerFrame, WorkspaceInit};
use crate::state::SidecarState;

/// Dispatch one keyed client frame. Errors become typed `error` replies to
/// the origin; the connection stays open.
pub fn handle_frame(state: &SidecarState, conn_id: &str, user: &str, frame: ClientFrame) {
    let result = match frame {
        // Keying is handled by the connection loop
        ClientFrame::SetKey { .. } => Ok(()),

        ClientFrame::CreateWorkspace { workspace } => {
            create_workspace(state, conn_id, user, workspace)
        }
        ClientFrame::UpdateWorkspace { workspace_id, name } => {
            update_workspace(state, conn_id, user, &workspace_id, &name)
        }
        ClientFrame::DeleteWorkspace { workspace_id } => {
            delete_workspace(state, conn_id, user, &workspace_id)
        }
        ClientFrame::ListWorkspaces => list_workspaces(state, conn_id, user),
        ClientFrame::JoinWorkspace { workspace } => {
            join_workspace(state, conn_id, user, &workspace)
        }
        ClientFrame::LeaveWorkspace { workspace } => {
            leave_workspace(state, conn_id, &workspace)
        }

        ClientFrame::CreateFolder { folder } => create_folder(state, conn_id, user, folder),
        ClientFrame::RenameFolder { folder_id, name } => {
            rename_folder(state, conn_id, user, &folder_id, &name)
        }
        ClientFrame::MoveFolder {
            folder_id,
            parent_id,
        } => move_folder(state, conn_id, user, &folder_id, parent_id.as_deref()),
        ClientFrame::DeleteFolder { folder_id } => {
            delete_folder(state, conn_id, user, &folder_id)
        }
        ClientFrame::RestoreFolder { folder_id } => {
            restore_folder(state, conn_id, user, &folder_id)
        }
        ClientFrame::ListFolders { workspace_id } => {
            list_folders(state, conn_id, user, &workspace_id)
        }

        ClientFrame::CreateDocument { document } => {
            create_document(state, conn_id, user, document)
        }
        ClientFrame::RenameDocument { doc_id, name } => {
            rename_document(state, conn_id, user, &doc_id, &name)
        }
        ClientFrame::MoveDocument { doc_id, folder_id } => {
            move_document(state, conn_id, user, &doc_id, folder_id.as_deref())
        }
        ClientFrame::DeleteDocument { doc_id } => {
            delete_document(state, conn_id, user, &doc_id)
        }
        ClientFrame::RestoreDocument { doc_id } => {
            restore_document(state, conn_id, user, &doc_id)
        }
        ClientFrame::OpenDocument { doc_id } => open_document(state, conn_id, user, &doc_id),

        ClientFrame::CreateInvite {
            entity_type,
            entity_id,
            permission,
            expires_at,
            max_uses,
        } => create_invite(
            state, conn_id, user, entity_type, &entity_id, permission, expires_at, max_uses,
        ),
        ClientFrame::RedeemInvite { token } => redeem_invite(state, conn_id, user, &token),
        ClientFrame::InvalidateInvite { token } => {
            invalidate_invite(state, conn_id, user, &token)
        }

        ClientFrame::UpdateCollaboratorPermission {
            entity_type,
            entity_id,
            user_id,
            permission,
        } => update_collaborator_permission(
            state,
            conn_id,
            user,
            entity_type.unwrap_or(EntityKind::Workspace),
            &entity_id,
            &user_id,
            permission,
        ),
    };

    if let Err(e) = result {
        tracing::debug!(user = user, error = %e, "Metadata operation failed");
        state.send_to_meta(conn_id, ServerFrame::from_core_error(&e));
    }
}

// ── Workspace ops ─────────────────────────────────────────────────────────────

fn create_workspace(
    state: &SidecarState,
    conn_id: &str,
    user: &str,
    init: WorkspaceInit,
) -> Result<()> {
    if init.name.trim().is_empty() {
        return Err(Error::Validation("Workspace name must not be empty".into()));
    }

    let id = init.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let workspace = state.store.create_workspace(&id, &init.name, user, now_millis())?;

    // The creator is the owner and implicitly joins
    state
        .permissions
        .grant(user, &EntityRef::workspace(&id), PermissionLevel::Owner)?;
    state.join_workspace_subs(conn_id, &id);

    let frame = ServerFrame::WorkspaceCreated { workspace };
    state.send_to_meta(conn_id, frame.clone());
    state.broadcast_workspace(&id, &frame, Some(conn_id));
    Ok(())
}

fn update_workspace(
    state: &SidecarState,
    conn_id: &str,
    user: &str,
    workspace_id: &str,
    name: &str,
) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Validation("Workspace name must not be empty".into()));
    }
    let entity = alive_workspace(state, workspace_id)?;
    state.permissions.check(user, &entity, Action::Edit)?;

    state.store.update_workspace_name(workspace_id, name, now_millis())?;
    let workspace = state
        .store
        .get_workspace(workspace_id)?
        .ok_or_else(|| Error::NotFound(format!("workspace {}", workspace_id)))?;

    let frame = ServerFrame::WorkspaceUpdated { workspace };
    state.send_to_meta(conn_id, frame.clone());
    state.broadcast_workspace(workspace_id, &frame, Some(conn_id));
    Ok(())
}

fn delete_workspace(
    state: &SidecarState,
    conn_id: &str,
    user: &str,
    workspace_id: &str,
) -> Result<()> {
    let entity = alive_workspace(state, workspace_id)?;
    state
        .permissions
        .check(user, &entity, Action::DeleteWorkspace)?;

    state.store.soft_delete_workspace(workspace_id, now_millis())?;

    let frame = ServerFrame::WorkspaceDeleted {
        workspace_id: workspace_id.to_string(),
    };
    state.send_to_meta(conn_id, frame.clone());
    state.broadcast_workspace(workspace_id, &frame, Some(conn_id));
    Ok(())
}

fn list_workspaces(state: &SidecarState, conn_id: &str, user: &str) -> Result<()> {
    // Requester-only reply; never reveals workspaces the key has no grant on
    let workspaces = state.store.list_workspaces_for_user(user)?;
    state.send_to_meta(conn_id, ServerFrame::WorkspaceList { workspaces });
    Ok(())
}

fn join_workspace(
    state: &SidecarState,
    conn_id: &str,
    user: &str,
    workspace_id: &str,
) -> Result<()> {
    let entity = alive_workspace(state, workspace_id)?;
    state.permissions.check(user, &entity, Action::View)?;

    state.join_workspace_subs(conn_id, workspace_id);
    state.send_to_meta(
        conn_id,
        ServerFrame::WorkspaceJoined {
            workspace_id: workspace_id.to_string(),
        },
    );
    Ok(())
}

fn leave_workspace(state: &SidecarState, conn_id: &str, workspace_id: &str) -> Result<()> {
    state.leave_workspace_subs(conn_id, workspace_id);
    state.send_to_meta(
        conn_id,
        ServerFrame::WorkspaceLeft {
            workspace_id: workspace_id.to_string(),
        },
    );
    Ok(())
}

// ── Folder ops ────────────────────────────────────────────────────────────────

fn create_folder(
    state: &SidecarState,
    conn_id: &str,
    user: &str,
    spec: FolderSpec,
) -> Result<()> {
    if spec.name.trim().is_empty() {
        return Err(Error::Validation("Folder name must not be empty".into()));
    }
    alive_workspace(state, &spec.workspace_id)?;

    // Create is gated on the parent: the containing folder if given, else
    // the workspace
    let gate = match &spec.parent_id {
        Some(parent) => {
            let parent_folder = alive_folder(state, parent)?;
            if parent_folder.workspace_id != spec.workspace_id {
                return Err(Error::Validation(
                    "Parent folder belongs to a different workspace".into(),
                ));
            }
            EntityRef::folder(parent)
        }
        None => EntityRef::workspace(&spec.workspace_id),
    };
    state.permissions.check(user, &gate, Action::Create)?;

    let folder = state.store.create_folder(
        FolderInit {
            id: spec.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            workspace_id: spec.workspace_id.clone(),
            parent_id: spec.parent_id,
            name: spec.name,
            icon: spec.icon,
            color: spec.color,
            is_system: spec.is_system.unwrap_or(false),
        },
        now_millis(),
    )?;

    let frame = ServerFrame::FolderCreated { folder };
    state.send_to_meta(conn_id, frame.clone());
    state.broadcast_workspace(&spec.workspace_id, &frame, Some(conn_id));
    Ok(())
}

fn rename_folder(
    state: &SidecarState,
    conn_id: &str,
    user: &str,
    folder_id: &str,
    name: &str,
) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Validation("Folder name must not be empty".into()));
    }
    alive_folder(state, folder_id)?;
    state
        .permissions
        .check(user, &EntityRef::folder(folder_id), Action::Edit)?;

    state.store.rename_folder(folder_id, name, now_millis())?;
    let folder = refetch_folder(state, folder_id)?;

    let frame = ServerFrame::FolderRenamed {
        folder: folder.clone(),
    };
    state.send_to_meta(conn_id, frame.clone());
    state.broadcast_workspace(&folder.workspace_id, &frame, Some(conn_id));
    Ok(())
}

fn move_folder(
    state: &SidecarState,
    conn_id: &str,
    user: &str,
    folder_id: &str,
    parent_id: Option<&str>,
) -> Result<()> {
    let folder = alive_folder(state, folder_id)?;
    state
        .permissions
        .check(user, &EntityRef::folder(folder_id), Action::Edit)?;

    if let Some(parent) = parent_id {
        let parent_folder = alive_folder(state, parent)?;
        if parent_folder.workspace_id != folder.workspace_id {
            return Err(Error::Validation(
                "Cannot move a folder across workspaces".into(),
            ));
        }
    }

    // The store rejects moves into the folder's own descendant set
    state.store.move_folder(folder_id, parent_id, now_millis())?;
    let folder = refetch_folder(state, folder_id)?;

    let frame = ServerFrame::FolderMoved {
        folder: folder.clone(),
    };
    state.send_to_meta(conn_id, frame.clone());
    state.broadcast_workspace(&folder.workspace_id, &frame, Some(conn_id));
    Ok(())
}

fn delete_folder(
    state: &SidecarState,
    conn_id: &str,
    user: &str,
    folder_id: &str,
) -> Result<()> {
    let folder = alive_folder(state, folder_id)?;
    state
        .permissions
        .check(user, &EntityRef::folder(folder_id), Action::Delete)?;

    let cascade = state.store.soft_delete_folder_subtree(folder_id, now_millis())?;
    let affected_users = state.open_users(&cascade.document_ids);

    // Safety-net path for documents nothing is observing
    for doc_id in &cascade.document_ids {
        let payload = serde_json::json!({ "type": "document-deleted", "docId": doc_id });
        state.workspace_meta_fallback(doc_id, &folder.workspace_id, payload.to_string().as_bytes());
    }

    let frame = ServerFrame::FolderDeleted {
        folder_id: folder_id.to_string(),
        folder_ids: cascade.folder_ids,
        document_ids: cascade.document_ids,
        affected_users,
    };
    state.send_to_meta(conn_id, frame.clone());
    state.broadcast_workspace(&folder.workspace_id, &frame, Some(conn_id));
    Ok(())
}

fn restore_folder(
    state: &SidecarState,
    conn_id: &str,
    user: &str,
    folder_id: &str,
) -> Result<()> {
    let folder = state
        .store
        .get_folder(folder_id)?
        .ok_or_else(|| Error::NotFound(format!("folder {}", folder_id)))?;
    state
        .permissions
        .check(user, &EntityRef::folder(folder_id), Action::Restore)?;

    let cascade = state.store.restore_folder_subtree(folder_id, now_millis())?;

    let frame = ServerFrame::FolderRestored {
        folder_id: folder_id.to_string(),
        folder_ids: cascade.folder_ids,
        document_ids: cascade.document_ids,
    };
    state.send_to_meta(conn_id, frame.clone());
    state.broadcast_workspace(&folder.workspace_id, &frame, Some(conn_id));
    Ok(())
}

fn list_folders(
    state: &SidecarState,
    conn_id: &str,
    user: &str,
    workspace_id: &str,
) -> Result<()> {
    let entity = alive_workspace(state, workspace_id)?;
    state.permissions.check(user, &entity, Action::View)?;

    let folders = state.store.list_folders(workspace_id)?;
    state.send_to_meta(
        conn_id,
        ServerFrame::FolderList {
            workspace_id: workspace_id.to_string(),
            folders,
        },
    );
    Ok(())
}

// ── Document ops ──────────────────────────────────────────────────────────────

fn create_document(
    state: &SidecarState,
    conn_id: &str,
    user: &str,
    spec: DocumentSpec,
) -> Result<()> {
    if spec.name.trim().is_empty() {
        return Err(Error::Validation("Document name must not be empty".into()));
    }
    alive_workspace(state, &spec.workspace_id)?;

    let gate = match &spec.folder_id {
        Some(folder_id) => {
            let folder = alive_folder(state, folder_id)?;
            if folder.workspace_id != spec.workspace_id {
                return Err(Error::Validation(
                    "Folder belongs to a different workspace".into(),
                ));
            }
            EntityRef::folder(folder_id)
        }
        None => EntityRef::workspace(&spec.workspace_id),
    };
    state.permissions.check(user, &gate, Action::Create)?;

    let document = state.store.create_document(
        DocumentInit {
            id: spec.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            workspace_id: spec.workspace_id.clone(),
            folder_id: spec.folder_id,
            name: spec.name,
            doc_type: spec.doc_type.unwrap_or_else(|| "doc".to_string()),
        },
        now_millis(),
    )?;

    let frame = ServerFrame::DocumentCreated { document };
    state.send_to_meta(conn_id, frame.clone());
    state.broadcast_workspace(&spec.workspace_id, &frame, Some(conn_id));
    Ok(())
}

fn rename_document(
    state: &SidecarState,
    conn_id: &str,
    user: &str,
    doc_id: &str,
    name: &str,
) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Validation("Document name must not be empty".into()));
    }
    alive_document(state, doc_id)?;
    state
        .permissions
        .check(user, &EntityRef::document(doc_id), Action::Edit)?;

    state.store.rename_document(doc_id, name, now_millis())?;
    let document = refetch_document(state, doc_id)?;

    let frame = ServerFrame::DocumentRenamed {
        document: document.clone(),
    };
    state.send_to_meta(conn_id, frame.clone());
    state.broadcast_workspace(&document.workspace_id, &frame, Some(conn_id));
    Ok(())
}

fn move_document(
    state: &SidecarState,
    conn_id: &str,
    user: &str,
    doc_id: &str,
    folder_id: Option<&str>,
) -> Result<()> {
    let document = alive_document(state, doc_id)?;
    state
        .permissions
        .check(user, &EntityRef::document(doc_id), Action::Edit)?;

    if let Some(folder_id) = folder_id {
        let folder = alive_folder(state, folder_id)?;
        if folder.workspace_id != document.workspace_id {
            return Err(Error::Validation(
                "Cannot move a document across workspaces".into(),
            ));
        }
    }

    state.store.move_document(doc_id, folder_id, now_millis())?;
    let document = refetch_document(state, doc_id)?;

    let frame = ServerFrame::DocumentMoved {
        document: document.clone(),
    };
    state.send_to_meta(conn_id, frame.clone());
    state.broadcast_workspace(&document.workspace_id, &frame, Some(conn_id));
    Ok(())
}

fn delete_document(
    state: &SidecarState,
    conn_id: &str,
    user: &str,
    doc_id: &str,
) -> Result<()> {
    let document = alive_document(state, doc_id)?;
    state
        .permissions
        .check(user, &EntityRef::document(doc_id), Action::Delete)?;

    state.store.soft_delete_document(doc_id, now_millis())?;

    let payload = serde_json::json!({ "type": "document-deleted", "docId": doc_id });
    state.workspace_meta_fallback(doc_id, &document.workspace_id, payload.to_string().as_bytes());

    let frame = ServerFrame::DocumentDeleted {
        doc_id: doc_id.to_string(),
    };
    state.send_to_meta(conn_id, frame.clone());
    state.broadcast_workspace(&document.workspace_id, &frame, Some(conn_id));
    Ok(())
}

fn restore_document(
    state: &SidecarState,
    conn_id: &str,
    user: &str,
    doc_id: &str,
) -> Result<()> {
    let document = state
        .store
        .get_document(doc_id)?
        .ok_or_else(|| Error::NotFound(format!("document {}", doc_id)))?;
    state
        .permissions
        .check(user, &EntityRef::document(doc_id), Action::Restore)?;

    state.store.restore_document(doc_id, now_millis())?;
    let document_after = refetch_document(state, doc_id)?;

    let frame = ServerFrame::DocumentRestored {
        document: document_after,
    };
    state.send_to_meta(conn_id, frame.clone());
    state.broadcast_workspace(&document.workspace_id, &frame, Some(conn_id));
    Ok(())
}

fn open_document(
    state: &SidecarState,
    conn_id: &str,
    user: &str,
    doc_id: &str,
) -> Result<()> {
    let document = alive_document(state, doc_id)?;
    state
        .permissions
        .check(user, &EntityRef::document(doc_id), Action::View)?;

    state.mark_document_open(doc_id, user);
    // Second attachment attempts are a no-op by the guard
    state.ensure_doc_observer(doc_id);

    state.send_to_meta(conn_id, ServerFrame::DocumentOpened { document });
    Ok(())
}

// ── Invite ops ────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn create_invite(
    state: &SidecarState,
    conn_id: &str,
    user: &str,
    entity_type: EntityKind,
    entity_id: &str,
    permission: PermissionLevel,
    expires_at: Option<i64>,
    max_uses: Option<i64>,
) -> Result<()> {
    if permission == PermissionLevel::None {
        return Err(Error::Validation("Cannot share at level none".into()));
    }
    if matches!(max_uses, Some(n) if n <= 0) {
        return Err(Error::Validation("maxUses must be positive".into()));
    }

    let entity = alive_entity(state, entity_type, entity_id)?;
    state
        .permissions
        .check(user, &entity, Action::share_as(permission))?;

    let invite = state.invites.create(
        &entity,
        permission,
        nahma_core::invites::InviteOptions {
            expires_at,
            max_uses,
        },
        now_millis(),
    )?;

    state.send_to_meta(
        conn_id,
        ServerFrame::InviteCreated {
            token: invite.token,
            entity_type,
            entity_id: entity_id.to_string(),
            permission,
            expires_at,
            max_uses,
        },
    );
    Ok(())
}

fn redeem_invite(state: &SidecarState, conn_id: &str, user: &str, token: &str) -> Result<()> {
    let outcome = state.invites.redeem(user, token, now_millis())?;

    state.send_to_meta(
        conn_id,
        ServerFrame::InviteRedeemed {
            entity_id: outcome.entity.id.clone(),
            permission: outcome.change.new_permission,
        },
    );

    if outcome.change.new_permission > outcome.change.old_permission {
        let workspace_id = entity_workspace(state, &outcome.entity)?;
        state.broadcast_permission_change(&workspace_id, &outcome.change);
    }
    Ok(())
}

fn invalidate_invite(
    state: &SidecarState,
    conn_id: &str,
    user: &str,
    token: &str,
) -> Result<()> {
    let invite = state
        .store
        .get_invite(token)?
        .ok_or(Error::InviteNotFound)?;

    let entity = EntityRef {
        kind: invite.entity_type,
        id: invite.entity_id.clone(),
    };
    state
        .permissions
        .check(user, &entity, Action::share_as(invite.permission))?;

    let redeemers = state.invites.invalidate(token, now_millis())?;

    state.send_to_meta(
        conn_id,
        ServerFrame::InviteInvalidated {
            token: token.to_string(),
        },
    );

    // Every redeemer's open sessions must re-authorize
    let frame = ServerFrame::LinkInvalidated {
        token: token.to_string(),
    };
    for redeemer in redeemers {
        state.send_to_user(&redeemer, &frame);
    }
    Ok(())
}

// ── Collaborator permissions ─────────────────────────────────────────────────

fn update_collaborator_permission(
    state: &SidecarState,
    conn_id: &str,
    actor: &str,
    entity_type: EntityKind,
    entity_id: &str,
    user_id: &str,
    permission: PermissionLevel,
) -> Result<()> {
    let entity = alive_entity(state, entity_type, entity_id)?;

    let current = state.permissions.effective(user_id, &entity)?;
    if permission >= current {
        state
            .permissions
            .check(actor, &entity, Action::share_as(permission))?;
    } else {
        // Downgrades are explicit revocation territory: owner only
        state
            .permissions
            .check(actor, &entity, Action::PromoteToOwner)?;
    }

    let change = state.permissions.set(user_id, &entity, permission)?;

    state.send_to_meta(conn_id, ServerFrame::permission_changed(&change));

    let workspace_id = entity_workspace(state, &entity)?;
    state.broadcast_permission_change(&workspace_id, &change);
    Ok(())
}

// ── Lookup helpers ────────────────────────────────────────────────────────────

fn alive_workspace(state: &SidecarState, workspace_id: &str) -> Result<EntityRef> {
    let workspace = state
        .store
        .get_workspace(workspace_id)?
        .ok_or_else(|| Error::NotFound(format!("workspace {}", workspace_id)))?;
    if workspace.is_deleted() {
        return Err(Error::NotFound(format!("workspace {}", workspace_id)));
    }
    Ok(EntityRef::workspace(workspace_id))
}

fn alive_folder(state: &SidecarState, folder_id: &str) -> Result<FolderRecord> {
    let folder = state
        .store
        .get_folder(folder_id)?
        .ok_or_else(|| Error::NotFound(format!("folder {}", folder_id)))?;
    if folder.deleted_at.is_some() {
        return Err(Error::NotFound(format!("folder {}", folder_id)));
    }
    Ok(folder)
}

fn alive_document(state: &SidecarState, doc_id: &str) -> Result<DocumentRecord> {
    let document = state
        .store
        .get_document(doc_id)?
        .ok_or_else(|| Error::NotFound(format!("document {}", doc_id)))?;
    if document.deleted_at.is_some() {
        return Err(Error::NotFound(format!("document {}", doc_id)));
    }
    Ok(document)
}

fn alive_entity(
    state: &SidecarState,
    kind: EntityKind,
    entity_id: &str,
) -> Result<EntityRef> {
    match kind {
        EntityKind::Workspace => alive_workspace(state, entity_id),
        EntityKind::Folder => {
            alive_folder(state, entity_id)?;
            Ok(EntityRef::folder(entity_id))
        }
        EntityKind::Document => {
            alive_document(state, entity_id)?;
            Ok(EntityRef::document(entity_id))
        }
    }
}

fn refetch_folder(state: &SidecarState, folder_id: &str) -> Result<FolderRecord> {
    state
        .store
        .get_folder(folder_id)?
        .ok_or_else(|| Error::NotFound(format!("folder {}", folder_id)))
}

fn refetch_document(state: &SidecarState, doc_id: &str) -> Result<DocumentRecord> {
    state
        .store
        .get_document(doc_id)?
        .ok_or_else(|| Error::NotFound(format!("document {}", doc_id)))
}

/// Resolve the workspace an entity lives in (for broadcast scoping).
fn entity_workspace(state: &SidecarState, entity: &EntityRef) -> Result<String> {
    match entity.kind {
        EntityKind::Workspace => Ok(entity.id.clone()),
        EntityKind::Folder => Ok(refetch_folder(state, &entity.id)?.workspace_id),
        EntityKind::Document => Ok(refetch_document(state, &entity.id)?.workspace_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::swarm::NullSwarmAdapter;
    use crate::state::SidecarConfig;
    use nahma_core::storage::Store;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn setup() -> SidecarState {
        let store = Arc::new(Store::open_in_memory().unwrap());
        SidecarState::new(
            store,
            [7u8; 32],
            Arc::new(NullSwarmAdapter),
            SidecarConfig::default(),
        )
    }

    fn keyed_conn(
        state: &SidecarState,
        conn_id: &str,
        user: &str,
    ) -> mpsc::UnboundedReceiver<ServerFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        state.register_meta_conn(conn_id, user, tx);
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn owner_key() -> String {
        "aa".repeat(32)
    }

    fn other_key() -> String {
        "bb".repeat(32)
    }

    fn create_ws(state: &SidecarState, conn_id: &str, user: &str, name: &str) -> String {
        handle_frame(
            state,
            conn_id,
            user,
            ClientFrame::CreateWorkspace {
                workspace: WorkspaceInit {
                    id: None,
                    name: name.to_string(),
                },
            },
        );
        // Read the id back out of the store
        state.store.list_workspaces_for_user(user).unwrap()
            .into_iter()
            .find(|w| w.name == name)
            .map(|w| w.id)
            .expect("workspace was created")
    }

    #[test]
    fn test_create_workspace_grants_owner_and_replies() {
        let state = setup();
        let owner = owner_key();
        let mut rx = keyed_conn(&state, "c1", &owner);

        let ws_id = create_ws(&state, "c1", &owner, "Home");

        let frames = drain(&mut rx);
        assert!(matches!(frames[0], ServerFrame::WorkspaceCreated { .. }));
        assert_eq!(
            state
                .permissions
                .effective(&owner, &EntityRef::workspace(&ws_id))
                .unwrap(),
            PermissionLevel::Owner
        );
    }

    #[test]
    fn test_workspace_isolation_in_listing() {
        // S6: a key that never joined W1 sees no trace of it
        let state = setup();
        let owner = owner_key();
        let stranger = other_key();
        let mut rx_owner = keyed_conn(&state, "c1", &owner);
        let mut rx_stranger = keyed_conn(&state, "c2", &stranger);

        let ws_id = create_ws(&state, "c1", &owner, "Secret");
        drain(&mut rx_owner);

        handle_frame(&state, "c2", &stranger, ClientFrame::ListWorkspaces);
        match drain(&mut rx_stranger).pop().unwrap() {
            ServerFrame::WorkspaceList { workspaces } => {
                assert!(workspaces.iter().all(|w| w.id != ws_id));
                assert!(workspaces.is_empty());
            }
            other => panic!("Expected workspace-list, got {:?}", other),
        }
    }

    #[test]
    fn test_join_workspace_requires_permission() {
        let state = setup();
        let owner = owner_key();
        let stranger = other_key();
        keyed_conn(&state, "c1", &owner);
        let mut rx_stranger = keyed_conn(&state, "c2", &stranger);

        let ws_id = create_ws(&state, "c1", &owner, "Home");

        handle_frame(
            &state,
            "c2",
            &stranger,
            ClientFrame::JoinWorkspace {
                workspace: ws_id.clone(),
            },
        );

        match drain(&mut rx_stranger).pop().unwrap() {
            ServerFrame::Error { code, .. } => {
                assert_eq!(code, crate::protocol::ErrorCode::PermissionDenied)
            }
            other => panic!("Expected error, got {:?}", other),
        }
        // And no subscription was made
        assert!(state.workspace_subs.get(&ws_id).map(|s| !s.contains("c2")).unwrap_or(true));
    }

    #[test]
    fn test_broadcast_reaches_joined_subscriber() {
        let state = setup();
        let owner = owner_key();
        let member = other_key();
        let mut rx_owner = keyed_conn(&state, "c1", &owner);
        let mut rx_member = keyed_conn(&state, "c2", &member);

        let ws_id = create_ws(&state, "c1", &owner, "Home");
        drain(&mut rx_owner);

        // Grant and join the member
        state
            .permissions
            .grant(&member, &EntityRef::workspace(&ws_id), PermissionLevel::Editor)
            .unwrap();
        handle_frame(
            &state,
            "c2",
            &member,
            ClientFrame::JoinWorkspace {
                workspace: ws_id.clone(),
            },
        );
        drain(&mut rx_member);

        // Owner creates a document; member hears the broadcast
        handle_frame(
            &state,
            "c1",
            &owner,
            ClientFrame::CreateDocument {
                document: DocumentSpec {
                    id: Some("d-1".to_string()),
                    workspace_id: ws_id.clone(),
                    folder_id: None,
                    name: "Notes".to_string(),
                    doc_type: None,
                },
            },
        );

        let owner_frames = drain(&mut rx_owner);
        assert!(matches!(
            owner_frames[0],
            ServerFrame::DocumentCreated { .. }
        ));

        let member_frames = drain(&mut rx_member);
        assert!(matches!(
            member_frames[0],
            ServerFrame::DocumentCreated { .. }
        ));
    }

    #[test]
    fn test_folder_cascade_reports_ids_and_open_users() {
        let state = setup();
        let owner = owner_key();
        let mut rx = keyed_conn(&state, "c1", &owner);

        let ws_id = create_ws(&state, "c1", &owner, "Home");
        handle_frame(
            &state,
            "c1",
            &owner,
            ClientFrame::CreateFolder {
                folder: FolderSpec {
                    id: Some("f-1".to_string()),
                    workspace_id: ws_id.clone(),
                    parent_id: None,
                    name: "Docs".to_string(),
                    icon: None,
                    color: None,
                    is_system: None,
                },
            },
        );
        handle_frame(
            &state,
            "c1",
            &owner,
            ClientFrame::CreateDocument {
                document: DocumentSpec {
                    id: Some("d-1".to_string()),
                    workspace_id: ws_id.clone(),
                    folder_id: Some("f-1".to_string()),
                    name: "Inside".to_string(),
                    doc_type: None,
                },
            },
        );
        handle_frame(
            &state,
            "c1",
            &owner,
            ClientFrame::OpenDocument {
                doc_id: "d-1".to_string(),
            },
        );
        drain(&mut rx);

        handle_frame(
            &state,
            "c1",
            &owner,
            ClientFrame::DeleteFolder {
                folder_id: "f-1".to_string(),
            },
        );

        match drain(&mut rx).pop().unwrap() {
            ServerFrame::FolderDeleted {
                folder_ids,
                document_ids,
                affected_users,
                ..
            } => {
                assert_eq!(folder_ids, vec!["f-1"]);
                assert_eq!(document_ids, vec!["d-1"]);
                assert_eq!(affected_users, vec![owner.clone()]);
            }
            other => panic!("Expected folder-deleted, got {:?}", other),
        }
    }

    #[test]
    fn test_permission_downgrade_path() {
        // S3 precondition: owner downgrades a collaborator; the engine now
        // resolves viewer, so the doc endpoint rejects the next edit.
        let state = setup();
        let owner = owner_key();
        let member = other_key();
        keyed_conn(&state, "c1", &owner);
        let mut rx_member = keyed_conn(&state, "c2", &member);

        let ws_id = create_ws(&state, "c1", &owner, "Home");
        state
            .permissions
            .grant(&member, &EntityRef::workspace(&ws_id), PermissionLevel::Editor)
            .unwrap();
        handle_frame(
            &state,
            "c2",
            &member,
            ClientFrame::JoinWorkspace {
                workspace: ws_id.clone(),
            },
        );
        drain(&mut rx_member);

        handle_frame(
            &state,
            "c1",
            &owner,
            ClientFrame::UpdateCollaboratorPermission {
                entity_type: Some(EntityKind::Workspace),
                entity_id: ws_id.clone(),
                user_id: member.clone(),
                permission: PermissionLevel::Viewer,
            },
        );

        // The affected member hears permission-changed
        let frames = drain(&mut rx_member);
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerFrame::PermissionChanged { new_permission, .. }
                if *new_permission == PermissionLevel::Viewer
        )));

        assert_eq!(
            state
                .permissions
                .effective(&member, &EntityRef::workspace(&ws_id))
                .unwrap(),
            PermissionLevel::Viewer
        );
    }

    #[test]
    fn test_downgrade_requires_owner() {
        let state = setup();
        let owner = owner_key();
        let editor = other_key();
        keyed_conn(&state, "c1", &owner);
        let mut rx_editor = keyed_conn(&state, "c2", &editor);

        let ws_id = create_ws(&state, "c1", &owner, "Home");
        state
            .permissions
            .grant(&editor, &EntityRef::workspace(&ws_id), PermissionLevel::Editor)
            .unwrap();

        // An editor cannot downgrade the owner
        handle_frame(
            &state,
            "c2",
            &editor,
            ClientFrame::UpdateCollaboratorPermission {
                entity_type: Some(EntityKind::Workspace),
                entity_id: ws_id.clone(),
                user_id: owner.clone(),
                permission: PermissionLevel::Viewer,
            },
        );

        match drain(&mut rx_editor).pop().unwrap() {
            ServerFrame::Error { code, .. } => {
                assert_eq!(code, crate::protocol::ErrorCode::PermissionDenied)
            }
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_invite_create_redeem_invalidate_flow() {
        let state = setup();
        let owner = owner_key();
        let guest = other_key();
        let mut rx_owner = keyed_conn(&state, "c1", &owner);
        let mut rx_guest = keyed_conn(&state, "c2", &guest);

        let ws_id = create_ws(&state, "c1", &owner, "Home");
        drain(&mut rx_owner);

        handle_frame(
            &state,
            "c1",
            &owner,
            ClientFrame::CreateInvite {
                entity_type: EntityKind::Workspace,
                entity_id: ws_id.clone(),
                permission: PermissionLevel::Editor,
                expires_at: None,
                max_uses: Some(2),
            },
        );
        let token = match drain(&mut rx_owner).pop().unwrap() {
            ServerFrame::InviteCreated { token, .. } => token,
            other => panic!("Expected invite-created, got {:?}", other),
        };

        handle_frame(
            &state,
            "c2",
            &guest,
            ClientFrame::RedeemInvite {
                token: token.clone(),
            },
        );
        match drain(&mut rx_guest).pop().unwrap() {
            ServerFrame::InviteRedeemed {
                entity_id,
                permission,
            } => {
                assert_eq!(entity_id, ws_id);
                assert_eq!(permission, PermissionLevel::Editor);
            }
            other => panic!("Expected invite-redeemed, got {:?}", other),
        }

        handle_frame(
            &state,
            "c1",
            &owner,
            ClientFrame::InvalidateInvite {
                token: token.clone(),
            },
        );
        drain(&mut rx_owner);

        // The redeemer was told the link died
        let guest_frames = drain(&mut rx_guest);
        assert!(guest_frames
            .iter()
            .any(|f| matches!(f, ServerFrame::LinkInvalidated { .. })));
    }

    #[test]
    fn test_create_invite_requires_share_level() {
        let state = setup();
        let owner = owner_key();
        let viewer = other_key();
        keyed_conn(&state, "c1", &owner);
        let mut rx_viewer = keyed_conn(&state, "c2", &viewer);

        let ws_id = create_ws(&state, "c1", &owner, "Home");
        state
            .permissions
            .grant(&viewer, &EntityRef::workspace(&ws_id), PermissionLevel::Viewer)
            .unwrap();

        // A viewer can share as viewer
        handle_frame(
            &state,
            "c2",
            &viewer,
            ClientFrame::CreateInvite {
                entity_type: EntityKind::Workspace,
                entity_id: ws_id.clone(),
                permission: PermissionLevel::Viewer,
                expires_at: None,
                max_uses: None,
            },
        );
        assert!(matches!(
            drain(&mut rx_viewer).pop().unwrap(),
            ServerFrame::InviteCreated { .. }
        ));

        // But not as editor
        handle_frame(
            &state,
            "c2",
            &viewer,
            ClientFrame::CreateInvite {
                entity_type: EntityKind::Workspace,
                entity_id: ws_id,
                permission: PermissionLevel::Editor,
                expires_at: None,
                max_uses: None,
            },
        );
        match drain(&mut rx_viewer).pop().unwrap() {
            ServerFrame::Error { code, .. } => {
                assert_eq!(code, crate::protocol::ErrorCode::PermissionDenied)
            }
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_delete_workspace_owner_only() {
        let state = setup();
        let owner = owner_key();
        let editor = other_key();
        keyed_conn(&state, "c1", &owner);
        let mut rx_editor = keyed_conn(&state, "c2", &editor);

        let ws_id = create_ws(&state, "c1", &owner, "Home");
        state
            .permissions
            .grant(&editor, &EntityRef::workspace(&ws_id), PermissionLevel::Editor)
            .unwrap();

        handle_frame(
            &state,
            "c2",
            &editor,
            ClientFrame::DeleteWorkspace {
                workspace_id: ws_id.clone(),
            },
        );
        match drain(&mut rx_editor).pop().unwrap() {
            ServerFrame::Error { code, .. } => {
                assert_eq!(code, crate::protocol::ErrorCode::PermissionDenied)
            }
            other => panic!("Expected error, got {:?}", other),
        }
        assert!(!state.store.get_workspace(&ws_id).unwrap().unwrap().is_deleted());
    }

    #[test]
    fn test_open_document_attaches_observer_once() {
        let state = setup();
        let owner = owner_key();
        let mut rx = keyed_conn(&state, "c1", &owner);

        let ws_id = create_ws(&state, "c1", &owner, "Home");
        handle_frame(
            &state,
            "c1",
            &owner,
            ClientFrame::CreateDocument {
                document: DocumentSpec {
                    id: Some("d-1".to_string()),
                    workspace_id: ws_id,
                    folder_id: None,
                    name: "Notes".to_string(),
                    doc_type: None,
                },
            },
        );
        drain(&mut rx);

        handle_frame(&state, "c1", &owner, ClientFrame::OpenDocument { doc_id: "d-1".to_string() });
        handle_frame(&state, "c1", &owner, ClientFrame::OpenDocument { doc_id: "d-1".to_string() });

        assert!(state.has_doc_observer("d-1"));
        let frames = drain(&mut rx);
        assert_eq!(
            frames
                .iter()
                .filter(|f| matches!(f, ServerFrame::DocumentOpened { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn test_move_folder_cycle_is_conflict() {
        let state = setup();
        let owner = owner_key();
        let mut rx = keyed_conn(&state, "c1", &owner);

        let ws_id = create_ws(&state, "c1", &owner, "Home");
        for (id, parent) in [("f-1", None), ("f-2", Some("f-1"))] {
            handle_frame(
                &state,
                "c1",
                &owner,
                ClientFrame::CreateFolder {
                    folder: FolderSpec {
                        id: Some(id.to_string()),
                        workspace_id: ws_id.clone(),
                        parent_id: parent.map(|s: &str| s.to_string()),
                        name: id.to_string(),
                        icon: None,
                        color: None,
                        is_system: None,
                    },
                },
            );
        }
        drain(&mut rx);

        handle_frame(
            &state,
            "c1",
            &owner,
            ClientFrame::MoveFolder {
                folder_id: "f-1".to_string(),
                parent_id: Some("f-2".to_string()),
            },
        );
        match drain(&mut rx).pop().unwrap() {
            ServerFrame::Error { code, .. } => {
                assert_eq!(code, crate::protocol::ErrorCode::Conflict)
            }
            other => panic!("Expected conflict, got {:?}", other),
        }
    }
}
