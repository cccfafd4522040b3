//! Database schema definitions.
//!
//! Single source of truth for the SQLite layout. Bump `SCHEMA_VERSION` and
//! add a migration batch to `Store::init_schema` whenever tables change.

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// All tables, created in one batch on a fresh database.
///
/// Conventions: ids are opaque strings (UUIDs / hex keys), timestamps are
/// Unix milliseconds, soft deletion is a nullable `deleted_at` marker.
/// `doc_updates` is the append-only per-document CRDT log; `(doc_id, seq)`
/// preserves insertion order. `invites.redeemed_by` is a JSON array of
/// identity public keys.
pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS workspaces (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    owner_id    TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL,
    deleted_at  INTEGER
);

CREATE TABLE IF NOT EXISTS folders (
    id           TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    parent_id    TEXT,
    name         TEXT NOT NULL,
    icon         TEXT,
    color        TEXT,
    is_system    INTEGER NOT NULL DEFAULT 0,
    created_at   INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL,
    deleted_at   INTEGER
);
CREATE INDEX IF NOT EXISTS idx_folders_workspace ON folders(workspace_id);
CREATE INDEX IF NOT EXISTS idx_folders_parent ON folders(parent_id);

CREATE TABLE IF NOT EXISTS documents (
    id           TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    folder_id    TEXT,
    name         TEXT NOT NULL,
    doc_type     TEXT NOT NULL DEFAULT 'doc',
    state        TEXT NOT NULL DEFAULT 'active',
    created_at   INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL,
    deleted_at   INTEGER
);
CREATE INDEX IF NOT EXISTS idx_documents_workspace ON documents(workspace_id);
CREATE INDEX IF NOT EXISTS idx_documents_folder ON documents(folder_id);

CREATE TABLE IF NOT EXISTS doc_updates (
    doc_id     TEXT NOT NULL,
    seq        INTEGER NOT NULL,
    ciphertext BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (doc_id, seq)
);

CREATE TABLE IF NOT EXISTS invites (
    token       TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    entity_id   TEXT NOT NULL,
    permission  TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    expires_at  INTEGER,
    max_uses    INTEGER,
    uses        INTEGER NOT NULL DEFAULT 0,
    redeemed_by TEXT NOT NULL DEFAULT '[]'
);
CREATE INDEX IF NOT EXISTS idx_invites_entity ON invites(entity_id);

CREATE TABLE IF NOT EXISTS grants (
    user_id     TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id   TEXT NOT NULL,
    permission  TEXT NOT NULL,
    PRIMARY KEY (user_id, entity_id)
);
CREATE INDEX IF NOT EXISTS idx_grants_entity ON grants(entity_id);
"#;
