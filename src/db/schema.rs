//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::StorageError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate_schema(conn, current_version)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, StorageError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| StorageError::Internal(format!("Failed to create schema_version table: {}", e)))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StorageError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| StorageError::Internal(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| StorageError::Internal(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(CURRICULUM_SCHEMA)
        .map_err(|e| StorageError::Internal(format!("Failed to create curriculum tables: {}", e)))?;

    conn.execute_batch(DUPLICATION_SCHEMA)
        .map_err(|e| StorageError::Internal(format!("Failed to create duplication tables: {}", e)))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| StorageError::Internal(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), StorageError> {
    info!(from_version, "No migration steps registered");
    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Curriculum tree: paths → chapters → steps → blocks → fields / media
const CURRICULUM_SCHEMA: &str = r#"
-- Learning paths (duplication roots)
CREATE TABLE IF NOT EXISTS paths (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    description TEXT,
    path_type TEXT NOT NULL DEFAULT 'guided',
    difficulty TEXT DEFAULT 'beginner',
    estimated_duration TEXT,

    -- Metadata as JSON
    metadata_json TEXT,

    -- Visibility
    visibility TEXT NOT NULL DEFAULT 'public',

    -- Private share link secret, never copied
    share_token TEXT,

    -- Authorship
    created_by TEXT,
    forked_from_id INTEGER,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),

    FOREIGN KEY (forked_from_id) REFERENCES paths(id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS chapters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    description TEXT,
    order_index INTEGER NOT NULL DEFAULT 0,
    estimated_duration TEXT,

    FOREIGN KEY (path_id) REFERENCES paths(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS steps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chapter_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    description TEXT,
    step_type TEXT NOT NULL DEFAULT 'learn',

    -- NOTE: No FK on resource_id, content lives in another store
    resource_id TEXT,

    order_index INTEGER NOT NULL DEFAULT 0,
    estimated_duration TEXT,
    metadata_json TEXT,

    FOREIGN KEY (chapter_id) REFERENCES chapters(id) ON DELETE CASCADE
);

-- Content blocks. Top-level blocks hang off a step, nested blocks off
-- another block.
CREATE TABLE IF NOT EXISTS step_blocks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    step_id INTEGER,
    parent_block_id INTEGER,
    block_type TEXT NOT NULL DEFAULT 'text',
    body TEXT,
    order_index INTEGER NOT NULL DEFAULT 0,

    -- top-level blocks hang off a step, nested blocks off a block, never both
    CHECK ((step_id IS NULL) <> (parent_block_id IS NULL)),
    FOREIGN KEY (step_id) REFERENCES steps(id) ON DELETE CASCADE,
    FOREIGN KEY (parent_block_id) REFERENCES step_blocks(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS block_fields (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    block_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    value TEXT,

    FOREIGN KEY (block_id) REFERENCES step_blocks(id) ON DELETE CASCADE
);

-- Media blobs live in the blob store, referenced by storage_location
CREATE TABLE IF NOT EXISTS block_media (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    block_id INTEGER NOT NULL,
    media_type TEXT NOT NULL DEFAULT 'image',
    storage_location TEXT NOT NULL,
    caption TEXT,

    -- Set when the blob behind storage_location could not be copied
    broken INTEGER NOT NULL DEFAULT 0,

    FOREIGN KEY (block_id) REFERENCES step_blocks(id) ON DELETE CASCADE
);
"#;

/// Duplication bookkeeping: idempotency records, jobs, attachment outbox
const DUPLICATION_SCHEMA: &str = r#"
-- One duplicate per (source, actor)
CREATE TABLE IF NOT EXISTS duplication_records (
    source_root_id INTEGER NOT NULL,
    actor_id TEXT NOT NULL,
    duplicate_root_id INTEGER NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (source_root_id, actor_id),
    FOREIGN KEY (duplicate_root_id) REFERENCES paths(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS duplication_jobs (
    id TEXT PRIMARY KEY NOT NULL,
    source_root_id INTEGER NOT NULL,
    actor_id TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'queued',
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    duplicate_root_id INTEGER,
    last_error TEXT,
    error_class TEXT,
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    -- queued: earliest claim time; running: lease deadline
    next_attempt_at_ms INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attachment_copy_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    root_id INTEGER NOT NULL,
    entity_table TEXT NOT NULL,
    entity_id INTEGER NOT NULL,
    broken_column TEXT NOT NULL,
    source_location TEXT NOT NULL,
    dest_location TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    next_attempt_at_ms INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Index definitions for fast queries
const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_paths_created_by ON paths(created_by);
CREATE INDEX IF NOT EXISTS idx_paths_forked_from ON paths(forked_from_id);

CREATE INDEX IF NOT EXISTS idx_chapters_order ON chapters(path_id, order_index);
CREATE INDEX IF NOT EXISTS idx_steps_order ON steps(chapter_id, order_index);
CREATE INDEX IF NOT EXISTS idx_blocks_step_order ON step_blocks(step_id, order_index);
CREATE INDEX IF NOT EXISTS idx_blocks_parent_order ON step_blocks(parent_block_id, order_index);
CREATE INDEX IF NOT EXISTS idx_block_fields_block ON block_fields(block_id);
CREATE INDEX IF NOT EXISTS idx_block_media_block ON block_media(block_id);

CREATE INDEX IF NOT EXISTS idx_jobs_source_actor ON duplication_jobs(source_root_id, actor_id);
CREATE INDEX IF NOT EXISTS idx_jobs_state ON duplication_jobs(state, next_attempt_at_ms);

CREATE INDEX IF NOT EXISTS idx_attachment_tasks_due ON attachment_copy_tasks(state, next_attempt_at_ms);
CREATE INDEX IF NOT EXISTS idx_attachment_tasks_root ON attachment_copy_tasks(root_id);
"#;
