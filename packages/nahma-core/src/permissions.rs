//! # Permission Engine
//!
//! Hierarchy-resolving authorization over `{workspace, folder, document}`.
//!
//! ## Model
//!
//! Per (subject, entity) the effective permission is one of
//! `none < viewer < editor < owner`. Resolution walks the parent chain:
//! the nearest level carrying any source (a direct grant row, or a live
//! share link the subject has redeemed) wins, and within that level the
//! maximum over all sources applies. A workspace grant is therefore visible
//! on every descendant folder and document without writing descendant rows.
//!
//! ## Monotonic grants
//!
//! `grant` assigns `max(existing, new)` — a stale re-grant can never
//! accidentally downgrade anyone. Lowering a permission is always explicit:
//! `revoke` removes the row, `set` overwrites it (the broker uses `set` for
//! owner-driven collaborator updates, which is revoke-and-grant in one
//! step). Every change emits a [`PermissionChange`] so the broker can fan
//! out `permission-changed` events; open sessions are re-checked
//! server-side at execution time, not at submission time.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::Store;

/// Maximum parent-chain depth walked during resolution. A well-formed tree
/// never approaches this; it bounds damage from a corrupted parent graph.
const MAX_RESOLUTION_DEPTH: usize = 64;

/// Permission level with the strict ordering `none < viewer < editor < owner`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    #[default]
    None,
    Viewer,
    Editor,
    Owner,
}

impl PermissionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::None => "none",
            PermissionLevel::Viewer => "viewer",
            PermissionLevel::Editor => "editor",
            PermissionLevel::Owner => "owner",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(PermissionLevel::None),
            "viewer" => Ok(PermissionLevel::Viewer),
            "editor" => Ok(PermissionLevel::Editor),
            "owner" => Ok(PermissionLevel::Owner),
            other => Err(Error::Validation(format!(
                "Unknown permission level: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The entity kinds permissions attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Workspace,
    Folder,
    Document,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Workspace => "workspace",
            EntityKind::Folder => "folder",
            EntityKind::Document => "document",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "workspace" => Ok(EntityKind::Workspace),
            "folder" => Ok(EntityKind::Folder),
            "document" => Ok(EntityKind::Document),
            other => Err(Error::Validation(format!("Unknown entity type: {}", other))),
        }
    }
}

/// A tagged reference to a permission-bearing entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn workspace(id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Workspace,
            id: id.into(),
        }
    }

    pub fn folder(id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Folder,
            id: id.into(),
        }
    }

    pub fn document(id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Document,
            id: id.into(),
        }
    }
}

/// Actions gated by the permission engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    View,
    Edit,
    Create,
    Delete,
    Restore,
    ShareAsViewer,
    ShareAsEditor,
    ShareAsOwner,
    DeleteWorkspace,
    PromoteToOwner,
}

impl Action {
    /// Minimum permission level required to perform this action.
    pub fn required_level(&self) -> PermissionLevel {
        match self {
            Action::View | Action::ShareAsViewer => PermissionLevel::Viewer,
            Action::Edit
            | Action::Create
            | Action::Delete
            | Action::Restore
            | Action::ShareAsEditor => PermissionLevel::Editor,
            Action::ShareAsOwner | Action::DeleteWorkspace | Action::PromoteToOwner => {
                PermissionLevel::Owner
            }
        }
    }

    /// The action required to share at a given level.
    pub fn share_as(level: PermissionLevel) -> Action {
        match level {
            PermissionLevel::Owner => Action::ShareAsOwner,
            PermissionLevel::Editor => Action::ShareAsEditor,
            _ => Action::ShareAsViewer,
        }
    }
}

/// Emitted on every grant, set or revoke so the broker can notify affected
/// clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionChange {
    pub user_id: String,
    pub entity_id: String,
    pub old_permission: PermissionLevel,
    pub new_permission: PermissionLevel,
}

/// Hierarchy-resolving permission engine over the persistence store.
#[derive(Clone)]
pub struct PermissionEngine {
    store: Arc<Store>,
}

impl PermissionEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Resolve the effective permission of `user` on `entity`.
    ///
    /// Walks from the entity towards the workspace root; the first level
    /// with any source (direct grant or live redeemed link) decides, taking
    /// the maximum over that level's sources.
    pub fn effective(&self, user: &str, entity: &EntityRef) -> Result<PermissionLevel> {
        let now = crate::time::now_millis();
        let mut current = entity.clone();

        for _ in 0..MAX_RESOLUTION_DEPTH {
            let direct = self.store.get_grant(user, &current.id)?;
            let link = self.store.live_link_permission(
                user,
                &current.id,
                now,
                crate::invites::MAX_INVITE_AGE_MS,
            )?;
            let level = direct.max(link);
            if level > PermissionLevel::None {
                return Ok(level);
            }

            match self.store.entity_parent(&current)? {
                Some(parent) => current = parent,
                None => return Ok(PermissionLevel::None),
            }
        }

        tracing::warn!(
            entity_id = entity.id.as_str(),
            "Permission resolution hit depth limit; treating as none"
        );
        Ok(PermissionLevel::None)
    }

    /// Monotonic grant: assigns `max(existing, level)`.
    pub fn grant(
        &self,
        user: &str,
        entity: &EntityRef,
        level: PermissionLevel,
    ) -> Result<PermissionChange> {
        let (old, new) = self.store.grant_max(user, entity, level)?;
        Ok(PermissionChange {
            user_id: user.to_string(),
            entity_id: entity.id.clone(),
            old_permission: old,
            new_permission: new,
        })
    }

    /// Explicit overwrite (revoke-and-grant). Used for owner-driven
    /// collaborator updates, which may downgrade.
    pub fn set(
        &self,
        user: &str,
        entity: &EntityRef,
        level: PermissionLevel,
    ) -> Result<PermissionChange> {
        let old = self.store.get_grant(user, &entity.id)?;
        if level == PermissionLevel::None {
            self.store.revoke_grant(user, &entity.id)?;
        } else {
            self.store.set_grant(user, entity, level)?;
        }
        Ok(PermissionChange {
            user_id: user.to_string(),
            entity_id: entity.id.clone(),
            old_permission: old,
            new_permission: level,
        })
    }

    /// Explicit revocation of the direct grant on `entity`.
    pub fn revoke(&self, user: &str, entity: &EntityRef) -> Result<PermissionChange> {
        let old = self.store.get_grant(user, &entity.id)?;
        self.store.revoke_grant(user, &entity.id)?;
        Ok(PermissionChange {
            user_id: user.to_string(),
            entity_id: entity.id.clone(),
            old_permission: old,
            new_permission: PermissionLevel::None,
        })
    }

    /// Gate an action: error unless `effective(user, entity)` meets the
    /// action's required level.
    pub fn check(&self, user: &str, entity: &EntityRef, action: Action) -> Result<()> {
        let actual = self.effective(user, entity)?;
        let required = action.required_level();
        if actual >= required {
            Ok(())
        } else {
            Err(Error::PermissionDenied {
                required: required.to_string(),
                actual: actual.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;

    fn setup() -> (Arc<Store>, PermissionEngine) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine = PermissionEngine::new(store.clone());
        (store, engine)
    }

    /// workspace ws-1 > folder f-1 > document d-1
    fn seed_tree(store: &Store) {
        let now = 1_000;
        store
            .create_workspace("ws-1", "Workspace", "owner-key", now)
            .unwrap();
        store
            .create_folder(
                crate::storage::FolderInit {
                    id: "f-1".to_string(),
                    workspace_id: "ws-1".to_string(),
                    parent_id: None,
                    name: "Notes".to_string(),
                    icon: None,
                    color: None,
                    is_system: false,
                },
                now,
            )
            .unwrap();
        store
            .create_document(
                crate::storage::DocumentInit {
                    id: "d-1".to_string(),
                    workspace_id: "ws-1".to_string(),
                    folder_id: Some("f-1".to_string()),
                    name: "Doc".to_string(),
                    doc_type: "doc".to_string(),
                },
                now,
            )
            .unwrap();
    }

    #[test]
    fn test_ordering() {
        assert!(PermissionLevel::None < PermissionLevel::Viewer);
        assert!(PermissionLevel::Viewer < PermissionLevel::Editor);
        assert!(PermissionLevel::Editor < PermissionLevel::Owner);
    }

    #[test]
    fn test_action_table() {
        assert_eq!(Action::View.required_level(), PermissionLevel::Viewer);
        assert_eq!(Action::Edit.required_level(), PermissionLevel::Editor);
        assert_eq!(Action::Create.required_level(), PermissionLevel::Editor);
        assert_eq!(Action::Delete.required_level(), PermissionLevel::Editor);
        assert_eq!(Action::Restore.required_level(), PermissionLevel::Editor);
        assert_eq!(
            Action::ShareAsViewer.required_level(),
            PermissionLevel::Viewer
        );
        assert_eq!(
            Action::ShareAsEditor.required_level(),
            PermissionLevel::Editor
        );
        assert_eq!(Action::ShareAsOwner.required_level(), PermissionLevel::Owner);
        assert_eq!(
            Action::DeleteWorkspace.required_level(),
            PermissionLevel::Owner
        );
        assert_eq!(
            Action::PromoteToOwner.required_level(),
            PermissionLevel::Owner
        );
    }

    #[test]
    fn test_no_grant_resolves_none() {
        let (store, engine) = setup();
        seed_tree(&store);

        let level = engine
            .effective("nobody", &EntityRef::document("d-1"))
            .unwrap();
        assert_eq!(level, PermissionLevel::None);
    }

    #[test]
    fn test_workspace_grant_cascades_to_descendants() {
        let (store, engine) = setup();
        seed_tree(&store);

        engine
            .grant(
                "alice",
                &EntityRef::workspace("ws-1"),
                PermissionLevel::Editor,
            )
            .unwrap();

        // Visible on folder and document through resolution alone
        assert_eq!(
            engine.effective("alice", &EntityRef::folder("f-1")).unwrap(),
            PermissionLevel::Editor
        );
        assert_eq!(
            engine
                .effective("alice", &EntityRef::document("d-1"))
                .unwrap(),
            PermissionLevel::Editor
        );
        // No descendant rows were written
        assert_eq!(store.get_grant("alice", "f-1").unwrap(), PermissionLevel::None);
        assert_eq!(store.get_grant("alice", "d-1").unwrap(), PermissionLevel::None);
    }

    #[test]
    fn test_grant_is_monotonic() {
        let (store, engine) = setup();
        seed_tree(&store);
        let ws = EntityRef::workspace("ws-1");

        engine.grant("alice", &ws, PermissionLevel::Editor).unwrap();
        // A stale viewer re-grant must not downgrade
        let change = engine.grant("alice", &ws, PermissionLevel::Viewer).unwrap();

        assert_eq!(change.old_permission, PermissionLevel::Editor);
        assert_eq!(change.new_permission, PermissionLevel::Editor);
        assert_eq!(
            engine.effective("alice", &ws).unwrap(),
            PermissionLevel::Editor
        );
    }

    #[test]
    fn test_set_can_downgrade() {
        let (store, engine) = setup();
        seed_tree(&store);
        let ws = EntityRef::workspace("ws-1");

        engine.grant("alice", &ws, PermissionLevel::Editor).unwrap();
        let change = engine.set("alice", &ws, PermissionLevel::Viewer).unwrap();

        assert_eq!(change.old_permission, PermissionLevel::Editor);
        assert_eq!(change.new_permission, PermissionLevel::Viewer);
        assert_eq!(
            engine.effective("alice", &ws).unwrap(),
            PermissionLevel::Viewer
        );
    }

    #[test]
    fn test_revoke_is_explicit() {
        let (store, engine) = setup();
        seed_tree(&store);
        let ws = EntityRef::workspace("ws-1");

        engine.grant("alice", &ws, PermissionLevel::Owner).unwrap();
        let change = engine.revoke("alice", &ws).unwrap();

        assert_eq!(change.old_permission, PermissionLevel::Owner);
        assert_eq!(change.new_permission, PermissionLevel::None);
        assert_eq!(engine.effective("alice", &ws).unwrap(), PermissionLevel::None);
    }

    #[test]
    fn test_nearest_level_wins() {
        let (store, engine) = setup();
        seed_tree(&store);

        engine
            .grant("alice", &EntityRef::workspace("ws-1"), PermissionLevel::Owner)
            .unwrap();
        engine
            .grant("alice", &EntityRef::document("d-1"), PermissionLevel::Viewer)
            .unwrap();

        // The direct source on the document stops the walk
        assert_eq!(
            engine
                .effective("alice", &EntityRef::document("d-1"))
                .unwrap(),
            PermissionLevel::Viewer
        );
    }

    #[test]
    fn test_check_gates_actions() {
        let (store, engine) = setup();
        seed_tree(&store);
        let doc = EntityRef::document("d-1");

        engine
            .grant("alice", &EntityRef::workspace("ws-1"), PermissionLevel::Viewer)
            .unwrap();

        assert!(engine.check("alice", &doc, Action::View).is_ok());
        assert!(matches!(
            engine.check("alice", &doc, Action::Edit),
            Err(Error::PermissionDenied { .. })
        ));
        assert!(matches!(
            engine.check("nobody", &doc, Action::View),
            Err(Error::PermissionDenied { .. })
        ));
    }

    #[test]
    fn test_link_redemption_feeds_resolution() {
        let (store, engine) = setup();
        seed_tree(&store);
        let now = crate::time::now_millis();

        // A live link on the workspace, redeemed by bob, grants through
        // resolution even before a grant row exists.
        store
            .insert_invite(&crate::storage::InviteRecord {
                token: "tok-1".to_string(),
                entity_type: EntityKind::Workspace,
                entity_id: "ws-1".to_string(),
                permission: PermissionLevel::Editor,
                created_at: now,
                expires_at: None,
                max_uses: None,
                uses: 1,
                redeemed_by: vec!["bob".to_string()],
            })
            .unwrap();

        assert_eq!(
            engine
                .effective("bob", &EntityRef::document("d-1"))
                .unwrap(),
            PermissionLevel::Editor
        );
        // Other users see nothing from the link
        assert_eq!(
            engine
                .effective("mallory", &EntityRef::document("d-1"))
                .unwrap(),
            PermissionLevel::None
        );
    }
}
