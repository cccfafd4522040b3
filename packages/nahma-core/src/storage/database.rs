//! # Store
//!
//! SQLite-backed persistence façade. All mutations are atomic at the row
//! level; multi-row operations (cascade soft-delete, invite redemption,
//! update-log append) run inside a single transaction.
//!
//! The connection sits behind a `parking_lot::Mutex`; callers on the async
//! side treat every method as a potential suspension point and never hold
//! the lock across awaits.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::schema;
use crate::error::{Error, Result};
use crate::invites::MAX_INVITE_AGE_MS;
use crate::permissions::{EntityKind, EntityRef, PermissionLevel};

/// Document lifecycle state. `Purged` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocState {
    Active,
    Trashed,
    Purged,
}

impl DocState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocState::Active => "active",
            DocState::Trashed => "trashed",
            DocState::Purged => "purged",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(DocState::Active),
            "trashed" => Ok(DocState::Trashed),
            "purged" => Ok(DocState::Purged),
            other => Err(Error::DatabaseError(format!(
                "Unknown document state: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRecord {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl WorkspaceRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FolderRecord {
    pub id: String,
    pub workspace_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub is_system: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub id: String,
    pub workspace_id: String,
    pub folder_id: Option<String>,
    pub name: String,
    pub doc_type: String,
    pub state: DocState,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

/// One record of the append-only per-document update log.
#[derive(Debug, Clone)]
pub struct UpdateRecord {
    pub doc_id: String,
    pub seq: i64,
    pub ciphertext: Vec<u8>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteRecord {
    pub token: String,
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub permission: PermissionLevel,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub max_uses: Option<i64>,
    pub uses: i64,
    pub redeemed_by: Vec<String>,
}

/// Creation parameters for a folder row.
#[derive(Debug, Clone)]
pub struct FolderInit {
    pub id: String,
    pub workspace_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub is_system: bool,
}

/// Creation parameters for a document row.
#[derive(Debug, Clone)]
pub struct DocumentInit {
    pub id: String,
    pub workspace_id: String,
    pub folder_id: Option<String>,
    pub name: String,
    pub doc_type: String,
}

/// Ids touched by a cascade soft-delete or restore.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeResult {
    pub folder_ids: Vec<String>,
    pub document_ids: Vec<String>,
}

/// Row counts for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub workspaces: i64,
    pub documents: i64,
    pub invites: i64,
}

/// The main persistence handle.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| Error::DatabaseError(format!("Failed to open database: {}", e)))?;
        Self::from_connection(conn)
    }

    /// In-memory database (`NO_PERSIST` mode and tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            Error::DatabaseError(format!("Failed to create in-memory database: {}", e))
        })?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        let version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .ok();

        match version {
            None => {
                conn.execute_batch(schema::CREATE_TABLES)
                    .map_err(|e| Error::DatabaseError(format!("Failed to create tables: {}", e)))?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    params![schema::SCHEMA_VERSION],
                )?;
                tracing::info!(version = schema::SCHEMA_VERSION, "Database schema created");
            }
            Some(v) if v < schema::SCHEMA_VERSION => {
                // No migrations yet; the version gate is where they will go.
                return Err(Error::DatabaseError(format!(
                    "Schema version {} has no migration path to {}",
                    v,
                    schema::SCHEMA_VERSION
                )));
            }
            Some(v) => {
                tracing::debug!(version = v, "Database schema up to date");
            }
        }

        Ok(())
    }

    // ── Workspaces ────────────────────────────────────────────────────────

    pub fn create_workspace(
        &self,
        id: &str,
        name: &str,
        owner_id: &str,
        now: i64,
    ) -> Result<WorkspaceRecord> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO workspaces (id, name, owner_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
            params![id, name, owner_id, now, now],
        )?;

        Ok(WorkspaceRecord {
            id: id.to_string(),
            name: name.to_string(),
            owner_id: owner_id.to_string(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    pub fn get_workspace(&self, id: &str) -> Result<Option<WorkspaceRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, owner_id, created_at, updated_at, deleted_at
             FROM workspaces WHERE id = ?",
            params![id],
            workspace_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn update_workspace_name(&self, id: &str, name: &str, now: i64) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE workspaces SET name = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
            params![name, now, id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("workspace {}", id)));
        }
        Ok(())
    }

    /// Soft-delete a workspace and cascade to every folder and document in
    /// it, in one transaction.
    pub fn soft_delete_workspace(&self, id: &str, now: i64) -> Result<CascadeResult> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let rows = tx.execute(
            "UPDATE workspaces SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
            params![now, now, id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("workspace {}", id)));
        }

        let folder_ids = collect_ids(
            &tx,
            "SELECT id FROM folders WHERE workspace_id = ? AND deleted_at IS NULL",
            id,
        )?;
        let document_ids = collect_ids(
            &tx,
            "SELECT id FROM documents WHERE workspace_id = ? AND deleted_at IS NULL",
            id,
        )?;

        tx.execute(
            "UPDATE folders SET deleted_at = ?, updated_at = ? WHERE workspace_id = ? AND deleted_at IS NULL",
            params![now, now, id],
        )?;
        tx.execute(
            "UPDATE documents SET deleted_at = ?, updated_at = ?, state = 'trashed'
             WHERE workspace_id = ? AND deleted_at IS NULL AND state = 'active'",
            params![now, now, id],
        )?;

        tx.commit()?;
        Ok(CascadeResult {
            folder_ids,
            document_ids,
        })
    }

    /// Workspaces the user holds a direct grant on, alive only.
    pub fn list_workspaces_for_user(&self, user_id: &str) -> Result<Vec<WorkspaceRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT w.id, w.name, w.owner_id, w.created_at, w.updated_at, w.deleted_at
             FROM workspaces w
             JOIN grants g ON g.entity_id = w.id AND g.entity_type = 'workspace'
             WHERE g.user_id = ? AND w.deleted_at IS NULL
             ORDER BY w.created_at",
        )?;

        let rows = stmt.query_map(params![user_id], workspace_from_row)?;
        let mut workspaces = Vec::new();
        for row in rows {
            workspaces.push(row?);
        }
        Ok(workspaces)
    }

    // ── Folders ───────────────────────────────────────────────────────────

    pub fn create_folder(&self, init: FolderInit, now: i64) -> Result<FolderRecord> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO folders (id, workspace_id, parent_id, name, icon, color, is_system, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                init.id,
                init.workspace_id,
                init.parent_id,
                init.name,
                init.icon,
                init.color,
                init.is_system,
                now,
                now,
            ],
        )?;

        Ok(FolderRecord {
            id: init.id,
            workspace_id: init.workspace_id,
            parent_id: init.parent_id,
            name: init.name,
            icon: init.icon,
            color: init.color,
            is_system: init.is_system,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    pub fn get_folder(&self, id: &str) -> Result<Option<FolderRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, workspace_id, parent_id, name, icon, color, is_system, created_at, updated_at, deleted_at
             FROM folders WHERE id = ?",
            params![id],
            folder_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn rename_folder(&self, id: &str, name: &str, now: i64) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE folders SET name = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
            params![name, now, id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("folder {}", id)));
        }
        Ok(())
    }

    /// Re-parent a folder. Rejects moves into the folder's own subtree —
    /// the parent graph must stay acyclic.
    pub fn move_folder(&self, id: &str, new_parent: Option<&str>, now: i64) -> Result<()> {
        if let Some(parent) = new_parent {
            if parent == id {
                return Err(Error::Conflict(
                    "Cannot move a folder into itself".to_string(),
                ));
            }
            let descendants = self.folder_subtree(id)?;
            if descendants.folder_ids.iter().any(|f| f == parent) {
                return Err(Error::Conflict(
                    "Cannot move a folder into its own subtree".to_string(),
                ));
            }
        }

        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE folders SET parent_id = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
            params![new_parent, now, id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("folder {}", id)));
        }
        Ok(())
    }

    /// Every descendant folder id (excluding `id` itself) and every document
    /// in the subtree including documents directly under `id`.
    pub fn folder_subtree(&self, id: &str) -> Result<CascadeResult> {
        let conn = self.conn.lock();

        let mut folder_ids: Vec<String> = Vec::new();
        let mut frontier = vec![id.to_string()];

        // BFS over the parent-pointer graph, depth-limited as a guard
        // against corruption-induced cycles.
        for _depth in 0..64 {
            if frontier.is_empty() {
                break;
            }
            let mut next = Vec::new();
            for parent in &frontier {
                let mut stmt =
                    conn.prepare("SELECT id FROM folders WHERE parent_id = ?")?;
                let rows = stmt.query_map(params![parent], |row| row.get::<_, String>(0))?;
                for row in rows {
                    let child = row?;
                    if !folder_ids.contains(&child) {
                        folder_ids.push(child.clone());
                        next.push(child);
                    }
                }
            }
            frontier = next;
        }

        let mut document_ids = Vec::new();
        let mut all_folders = vec![id.to_string()];
        all_folders.extend(folder_ids.iter().cloned());
        for folder in &all_folders {
            let mut stmt = conn.prepare("SELECT id FROM documents WHERE folder_id = ?")?;
            let rows = stmt.query_map(params![folder], |row| row.get::<_, String>(0))?;
            for row in rows {
                document_ids.push(row?);
            }
        }

        Ok(CascadeResult {
            folder_ids,
            document_ids,
        })
    }

    /// Soft-delete a folder and its entire subtree in one transaction.
    /// Returns every id that was marked, the folder itself included.
    pub fn soft_delete_folder_subtree(&self, id: &str, now: i64) -> Result<CascadeResult> {
        let subtree = self.folder_subtree(id)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let rows = tx.execute(
            "UPDATE folders SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
            params![now, now, id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("folder {}", id)));
        }

        for folder in &subtree.folder_ids {
            tx.execute(
                "UPDATE folders SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
                params![now, now, folder],
            )?;
        }
        for doc in &subtree.document_ids {
            tx.execute(
                "UPDATE documents SET deleted_at = ?, updated_at = ?, state = 'trashed'
                 WHERE id = ? AND deleted_at IS NULL AND state != 'purged'",
                params![now, now, doc],
            )?;
        }

        tx.commit()?;

        let mut folder_ids = vec![id.to_string()];
        folder_ids.extend(subtree.folder_ids);
        Ok(CascadeResult {
            folder_ids,
            document_ids: subtree.document_ids,
        })
    }

    /// Undo a subtree soft-delete. Purged documents stay purged.
    pub fn restore_folder_subtree(&self, id: &str, now: i64) -> Result<CascadeResult> {
        let subtree = self.folder_subtree(id)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let rows = tx.execute(
            "UPDATE folders SET deleted_at = NULL, updated_at = ? WHERE id = ?",
            params![now, id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("folder {}", id)));
        }

        for folder in &subtree.folder_ids {
            tx.execute(
                "UPDATE folders SET deleted_at = NULL, updated_at = ? WHERE id = ?",
                params![now, folder],
            )?;
        }
        for doc in &subtree.document_ids {
            tx.execute(
                "UPDATE documents SET deleted_at = NULL, updated_at = ?, state = 'active'
                 WHERE id = ? AND state = 'trashed'",
                params![now, doc],
            )?;
        }

        tx.commit()?;

        let mut folder_ids = vec![id.to_string()];
        folder_ids.extend(subtree.folder_ids);
        Ok(CascadeResult {
            folder_ids,
            document_ids: subtree.document_ids,
        })
    }

    /// Alive folders in a workspace.
    pub fn list_folders(&self, workspace_id: &str) -> Result<Vec<FolderRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, workspace_id, parent_id, name, icon, color, is_system, created_at, updated_at, deleted_at
             FROM folders WHERE workspace_id = ? AND deleted_at IS NULL ORDER BY created_at",
        )?;

        let rows = stmt.query_map(params![workspace_id], folder_from_row)?;
        let mut folders = Vec::new();
        for row in rows {
            folders.push(row?);
        }
        Ok(folders)
    }

    // ── Documents ─────────────────────────────────────────────────────────

    pub fn create_document(&self, init: DocumentInit, now: i64) -> Result<DocumentRecord> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO documents (id, workspace_id, folder_id, name, doc_type, state, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, 'active', ?, ?)",
            params![
                init.id,
                init.workspace_id,
                init.folder_id,
                init.name,
                init.doc_type,
                now,
                now,
            ],
        )?;

        Ok(DocumentRecord {
            id: init.id,
            workspace_id: init.workspace_id,
            folder_id: init.folder_id,
            name: init.name,
            doc_type: init.doc_type,
            state: DocState::Active,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    pub fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, workspace_id, folder_id, name, doc_type, state, created_at, updated_at, deleted_at
                 FROM documents WHERE id = ?",
                params![id],
                document_from_row,
            )
            .optional()?;
        row.transpose()
    }

    pub fn rename_document(&self, id: &str, name: &str, now: i64) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE documents SET name = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
            params![name, now, id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("document {}", id)));
        }
        Ok(())
    }

    pub fn move_document(&self, id: &str, folder_id: Option<&str>, now: i64) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE documents SET folder_id = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
            params![folder_id, now, id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("document {}", id)));
        }
        Ok(())
    }

    /// Move a document to the trash. Purged documents cannot transition.
    pub fn soft_delete_document(&self, id: &str, now: i64) -> Result<()> {
        self.transition_document(id, DocState::Trashed, Some(now), now)
    }

    /// Bring a trashed document back. Purged documents cannot transition.
    pub fn restore_document(&self, id: &str, now: i64) -> Result<()> {
        self.transition_document(id, DocState::Active, None, now)
    }

    /// Irreversibly purge a document and drop its update log.
    pub fn purge_document(&self, id: &str, now: i64) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let state: Option<String> = tx
            .query_row(
                "SELECT state FROM documents WHERE id = ?",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match state.as_deref() {
            None => return Err(Error::NotFound(format!("document {}", id))),
            Some("purged") => {
                return Err(Error::Conflict("Document is already purged".to_string()))
            }
            Some(_) => {}
        }

        tx.execute(
            "UPDATE documents SET state = 'purged', deleted_at = COALESCE(deleted_at, ?), updated_at = ? WHERE id = ?",
            params![now, now, id],
        )?;
        tx.execute("DELETE FROM doc_updates WHERE doc_id = ?", params![id])?;

        tx.commit()?;
        Ok(())
    }

    fn transition_document(
        &self,
        id: &str,
        target: DocState,
        deleted_at: Option<i64>,
        now: i64,
    ) -> Result<()> {
        let conn = self.conn.lock();

        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM documents WHERE id = ?",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match state.as_deref() {
            None => return Err(Error::NotFound(format!("document {}", id))),
            Some("purged") => {
                return Err(Error::Conflict(
                    "Purged documents cannot change state".to_string(),
                ))
            }
            Some(_) => {}
        }

        conn.execute(
            "UPDATE documents SET state = ?, deleted_at = ?, updated_at = ? WHERE id = ?",
            params![target.as_str(), deleted_at, now, id],
        )?;
        Ok(())
    }

    /// Alive documents in a workspace.
    pub fn list_documents(&self, workspace_id: &str) -> Result<Vec<DocumentRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, workspace_id, folder_id, name, doc_type, state, created_at, updated_at, deleted_at
             FROM documents WHERE workspace_id = ? AND deleted_at IS NULL ORDER BY created_at",
        )?;

        let rows = stmt.query_map(params![workspace_id], document_from_row)?;
        let mut documents = Vec::new();
        for row in rows {
            documents.push(row??);
        }
        Ok(documents)
    }

    // ── Update log ────────────────────────────────────────────────────────

    /// Append one encrypted update; returns the assigned sequence number.
    /// Sequence numbers are monotonic per document and reflect server-side
    /// arrival order.
    pub fn append_update(&self, doc_id: &str, ciphertext: &[u8], now: i64) -> Result<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM doc_updates WHERE doc_id = ?",
            params![doc_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO doc_updates (doc_id, seq, ciphertext, created_at) VALUES (?, ?, ?, ?)",
            params![doc_id, seq, ciphertext, now],
        )?;

        tx.commit()?;
        Ok(seq)
    }

    /// The full update log in insertion order.
    pub fn load_updates(&self, doc_id: &str) -> Result<Vec<UpdateRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT doc_id, seq, ciphertext, created_at FROM doc_updates
             WHERE doc_id = ? ORDER BY seq",
        )?;

        let rows = stmt.query_map(params![doc_id], |row| {
            Ok(UpdateRecord {
                doc_id: row.get(0)?,
                seq: row.get(1)?,
                ciphertext: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;

        let mut updates = Vec::new();
        for row in rows {
            updates.push(row?);
        }
        Ok(updates)
    }

    // ── Invites ───────────────────────────────────────────────────────────

    pub fn insert_invite(&self, invite: &InviteRecord) -> Result<()> {
        let redeemed = serde_json::to_string(&invite.redeemed_by)
            .map_err(|e| Error::DatabaseError(format!("Failed to encode redeemers: {}", e)))?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO invites (token, entity_type, entity_id, permission, created_at, expires_at, max_uses, uses, redeemed_by)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                invite.token,
                invite.entity_type.as_str(),
                invite.entity_id,
                invite.permission.as_str(),
                invite.created_at,
                invite.expires_at,
                invite.max_uses,
                invite.uses,
                redeemed,
            ],
        )?;
        Ok(())
    }

    pub fn get_invite(&self, token: &str) -> Result<Option<InviteRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT token, entity_type, entity_id, permission, created_at, expires_at, max_uses, uses, redeemed_by
                 FROM invites WHERE token = ?",
                params![token],
                invite_from_row,
            )
            .optional()?;
        row.transpose()
    }

    /// Validate and redeem an invite, and apply the monotonic grant, all
    /// under one transaction (so two racing redeemers cannot both take the
    /// last use).
    ///
    /// Returns the post-redemption invite plus the grant's (old, new)
    /// levels.
    pub fn redeem_invite(
        &self,
        token: &str,
        user_id: &str,
        now: i64,
    ) -> Result<(InviteRecord, PermissionLevel, PermissionLevel)> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let invite = tx
            .query_row(
                "SELECT token, entity_type, entity_id, permission, created_at, expires_at, max_uses, uses, redeemed_by
                 FROM invites WHERE token = ?",
                params![token],
                invite_from_row,
            )
            .optional()?
            .transpose()?;

        let mut invite = match invite {
            Some(invite) => invite,
            None => return Err(Error::InviteNotFound),
        };

        if let Some(expires_at) = invite.expires_at {
            if now >= expires_at {
                return Err(Error::InviteExpired);
            }
        }
        if now >= invite.created_at + MAX_INVITE_AGE_MS {
            return Err(Error::InviteExpired);
        }
        if let Some(max_uses) = invite.max_uses {
            if invite.uses >= max_uses {
                return Err(Error::InviteExpired);
            }
        }

        invite.uses += 1;
        if !invite.redeemed_by.iter().any(|u| u == user_id) {
            invite.redeemed_by.push(user_id.to_string());
        }

        let redeemed = serde_json::to_string(&invite.redeemed_by)
            .map_err(|e| Error::DatabaseError(format!("Failed to encode redeemers: {}", e)))?;
        tx.execute(
            "UPDATE invites SET uses = ?, redeemed_by = ? WHERE token = ?",
            params![invite.uses, redeemed, token],
        )?;

        // Monotonic grant inside the same transaction
        let old = grant_level_tx(&tx, user_id, &invite.entity_id)?;
        let new = old.max(invite.permission);
        if new > PermissionLevel::None {
            tx.execute(
                "INSERT OR REPLACE INTO grants (user_id, entity_type, entity_id, permission)
                 VALUES (?, ?, ?, ?)",
                params![
                    user_id,
                    invite.entity_type.as_str(),
                    invite.entity_id,
                    new.as_str()
                ],
            )?;
        }

        tx.commit()?;
        Ok((invite, old, new))
    }

    /// Force-expire an invite now. Returns its redeemer set.
    pub fn invalidate_invite(&self, token: &str, now: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock();

        let redeemed: Option<String> = conn
            .query_row(
                "SELECT redeemed_by FROM invites WHERE token = ?",
                params![token],
                |row| row.get(0),
            )
            .optional()?;
        let redeemed = match redeemed {
            Some(r) => r,
            None => return Err(Error::InviteNotFound),
        };

        conn.execute(
            "UPDATE invites SET expires_at = ? WHERE token = ?",
            params![now, token],
        )?;

        serde_json::from_str(&redeemed)
            .map_err(|e| Error::DatabaseError(format!("Corrupt redeemer list: {}", e)))
    }

    /// Tier-1 sweep: drop invites whose declared expiry has passed. Invites
    /// with no expiry are untouched.
    pub fn delete_expired_invites(&self, now: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM invites WHERE expires_at IS NOT NULL AND expires_at < ?",
            params![now],
        )?;
        Ok(rows)
    }

    /// Tier-2 (nuclear) sweep: drop every invite created before `cutoff`,
    /// regardless of `expires_at`. Nothing outlives the maximum invite age.
    pub fn delete_invites_created_before(&self, cutoff: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM invites WHERE created_at < ?",
            params![cutoff],
        )?;
        Ok(rows)
    }

    // ── Grants ────────────────────────────────────────────────────────────

    /// Direct grant level, `None` if no row exists.
    pub fn get_grant(&self, user_id: &str, entity_id: &str) -> Result<PermissionLevel> {
        let conn = self.conn.lock();
        grant_level_tx(&conn, user_id, entity_id)
    }

    /// Monotonic upsert: the stored level only ever goes up.
    pub fn grant_max(
        &self,
        user_id: &str,
        entity: &EntityRef,
        level: PermissionLevel,
    ) -> Result<(PermissionLevel, PermissionLevel)> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let old = grant_level_tx(&tx, user_id, &entity.id)?;
        let new = old.max(level);
        if new > PermissionLevel::None {
            tx.execute(
                "INSERT OR REPLACE INTO grants (user_id, entity_type, entity_id, permission)
                 VALUES (?, ?, ?, ?)",
                params![user_id, entity.kind.as_str(), entity.id, new.as_str()],
            )?;
        }

        tx.commit()?;
        Ok((old, new))
    }

    /// Explicit overwrite used by `PermissionEngine::set`.
    pub fn set_grant(
        &self,
        user_id: &str,
        entity: &EntityRef,
        level: PermissionLevel,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO grants (user_id, entity_type, entity_id, permission)
             VALUES (?, ?, ?, ?)",
            params![user_id, entity.kind.as_str(), entity.id, level.as_str()],
        )?;
        Ok(())
    }

    pub fn revoke_grant(&self, user_id: &str, entity_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM grants WHERE user_id = ? AND entity_id = ?",
            params![user_id, entity_id],
        )?;
        Ok(rows > 0)
    }

    /// Users holding any direct grant on an entity.
    pub fn users_with_grant(&self, entity_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT user_id FROM grants WHERE entity_id = ?")?;
        let rows = stmt.query_map(params![entity_id], |row| row.get::<_, String>(0))?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    /// Best permission reachable through a live share link the user has
    /// redeemed on this entity. A link stops being live once expired,
    /// invalidated, older than the nuclear age, or fully spent.
    pub fn live_link_permission(
        &self,
        user_id: &str,
        entity_id: &str,
        now: i64,
        max_age_ms: i64,
    ) -> Result<PermissionLevel> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT permission, max_uses, uses, redeemed_by FROM invites
             WHERE entity_id = ?
               AND (expires_at IS NULL OR expires_at > ?)
               AND created_at > ?",
        )?;

        let rows = stmt.query_map(params![entity_id, now, now - max_age_ms], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut best = PermissionLevel::None;
        for row in rows {
            let (permission, max_uses, uses, redeemed_by) = row?;
            if let Some(max) = max_uses {
                if uses >= max {
                    continue;
                }
            }
            let redeemers: Vec<String> = serde_json::from_str(&redeemed_by)
                .map_err(|e| Error::DatabaseError(format!("Corrupt redeemer list: {}", e)))?;
            if !redeemers.iter().any(|u| u == user_id) {
                continue;
            }
            best = best.max(PermissionLevel::parse(&permission)?);
        }
        Ok(best)
    }

    // ── Entity graph ──────────────────────────────────────────────────────

    /// Resolve the parent of an entity in the permission hierarchy:
    /// document → folder (or workspace), folder → parent folder (or
    /// workspace), workspace → root.
    pub fn entity_parent(&self, entity: &EntityRef) -> Result<Option<EntityRef>> {
        match entity.kind {
            EntityKind::Workspace => Ok(None),
            EntityKind::Folder => {
                let folder = self
                    .get_folder(&entity.id)?
                    .ok_or_else(|| Error::NotFound(format!("folder {}", entity.id)))?;
                Ok(Some(match folder.parent_id {
                    Some(parent) => EntityRef::folder(parent),
                    None => EntityRef::workspace(folder.workspace_id),
                }))
            }
            EntityKind::Document => {
                let doc = self
                    .get_document(&entity.id)?
                    .ok_or_else(|| Error::NotFound(format!("document {}", entity.id)))?;
                Ok(Some(match doc.folder_id {
                    Some(folder) => EntityRef::folder(folder),
                    None => EntityRef::workspace(doc.workspace_id),
                }))
            }
        }
    }

    // ── Stats ─────────────────────────────────────────────────────────────

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock();
        let count = |sql: &str| -> Result<i64> {
            conn.query_row(sql, [], |row| row.get(0)).map_err(Into::into)
        };
        Ok(StoreStats {
            workspaces: count("SELECT COUNT(*) FROM workspaces WHERE deleted_at IS NULL")?,
            documents: count("SELECT COUNT(*) FROM documents WHERE deleted_at IS NULL")?,
            invites: count("SELECT COUNT(*) FROM invites")?,
        })
    }
}

// ── Row mappers ───────────────────────────────────────────────────────────────

fn workspace_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkspaceRecord> {
    Ok(WorkspaceRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        owner_id: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        deleted_at: row.get(5)?,
    })
}

fn folder_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FolderRecord> {
    Ok(FolderRecord {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        parent_id: row.get(2)?,
        name: row.get(3)?,
        icon: row.get(4)?,
        color: row.get(5)?,
        is_system: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        deleted_at: row.get(9)?,
    })
}

/// Invite rows carry enum strings; parsing can fail, so the mapper returns
/// a nested Result the caller transposes.
fn invite_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<InviteRecord>> {
    let entity_type: String = row.get(1)?;
    let permission: String = row.get(3)?;
    let redeemed_by: String = row.get(8)?;

    Ok((|| {
        Ok(InviteRecord {
            token: row.get(0)?,
            entity_type: EntityKind::parse(&entity_type)?,
            entity_id: row.get(2)?,
            permission: PermissionLevel::parse(&permission)?,
            created_at: row.get(4)?,
            expires_at: row.get(5)?,
            max_uses: row.get(6)?,
            uses: row.get(7)?,
            redeemed_by: serde_json::from_str(&redeemed_by)
                .map_err(|e| Error::DatabaseError(format!("Corrupt redeemer list: {}", e)))?,
        })
    })())
}

/// Document rows carry the lifecycle state as an enum string; parsing can
/// fail, so the mapper returns a nested Result the caller transposes. A
/// corrupt `state` column surfaces as an error instead of quietly
/// resurfacing a trashed or purged document as active.
fn document_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<DocumentRecord>> {
    let state: String = row.get(5)?;
    Ok((|| {
        Ok(DocumentRecord {
            id: row.get(0)?,
            workspace_id: row.get(1)?,
            folder_id: row.get(2)?,
            name: row.get(3)?,
            doc_type: row.get(4)?,
            state: DocState::parse(&state)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            deleted_at: row.get(8)?,
        })
    })())
}

fn collect_ids(conn: &Connection, sql: &str, param: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![param], |row| row.get::<_, String>(0))?;
    let mut ids = Vec::new();
    for row in rows {
        ids.push(row?);
    }
    Ok(ids)
}

fn grant_level_tx(
    conn: &Connection,
    user_id: &str,
    entity_id: &str,
) -> Result<PermissionLevel> {
    let level: Option<String> = conn
        .query_row(
            "SELECT permission FROM grants WHERE user_id = ? AND entity_id = ?",
            params![user_id, entity_id],
            |row| row.get(0),
        )
        .optional()?;
    match level {
        Some(level) => PermissionLevel::parse(&level),
        None => Ok(PermissionLevel::None),
    }
}
