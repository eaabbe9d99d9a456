//! SQLite database module for curriculum storage
//!
//! ## Tables
//!
//! - `paths`, `chapters`, `steps`, `step_blocks`, `block_fields`, `block_media` -
//!   the curriculum tree, ordered by `order_index` within each parent
//! - `duplication_records` - one duplicate per (source path, actor)
//! - `duplication_jobs` - persistent job state for the coordinator
//! - `attachment_copy_tasks` - outbox of blob copies owed by duplications
//!
//! `CurriculumDb` implements the store seams used by the engine:
//! [`SiblingStore`](crate::ordering::SiblingStore) in `siblings`,
//! [`HierarchyStore`](crate::duplication::HierarchyStore) in `hierarchy`,
//! [`JobStore`](crate::jobs::JobStore) in `jobs` and
//! [`AttachmentTaskStore`](crate::attachments::AttachmentTaskStore) in `attachments`.

pub mod attachments;
pub mod hierarchy;
pub mod jobs;
pub mod paths;
pub mod schema;
pub mod siblings;
mod sql;

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::StorageError;

/// Default database file name inside the storage directory
pub const DATABASE_FILE: &str = "curriculum.db";

/// How long a writer waits on another process's lock before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite database for the curriculum tree and duplication bookkeeping
pub struct CurriculumDb {
    conn: Mutex<Connection>,
}

impl CurriculumDb {
    /// Open or create the database in `storage_dir`
    pub fn open(storage_dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(storage_dir)?;
        Self::open_file(&storage_dir.join(DATABASE_FILE))
    }

    /// Open or create the database at an explicit file path
    pub fn open_file(db_path: &Path) -> Result<Self, StorageError> {
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(db_path)
            .map_err(|e| StorageError::Internal(format!("Failed to open SQLite: {}", e)))?;

        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| StorageError::Internal(format!("Failed to set busy timeout: {}", e)))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StorageError::Internal(format!("Failed to set PRAGMA: {}", e)))?;

        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StorageError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::Internal(format!("Failed to open in-memory SQLite: {}", e)))?;

        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| StorageError::Internal(format!("Failed to set PRAGMA: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        self.with_conn(schema::init_schema)
    }

    /// Get a reference to the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError>,
    {
        let conn = self.conn.lock()
            .map_err(|e| StorageError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a write operation with exclusive access
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError>,
    {
        let mut conn = self.conn.lock()
            .map_err(|e| StorageError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, StorageError> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<u64, StorageError> {
                let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
                Ok(n as u64)
            };

            Ok(DbStats {
                path_count: count("SELECT COUNT(*) FROM paths")?,
                chapter_count: count("SELECT COUNT(*) FROM chapters")?,
                step_count: count("SELECT COUNT(*) FROM steps")?,
                block_count: count("SELECT COUNT(*) FROM step_blocks")?,
                field_count: count("SELECT COUNT(*) FROM block_fields")?,
                media_count: count("SELECT COUNT(*) FROM block_media")?,
                broken_media_count: count("SELECT COUNT(*) FROM block_media WHERE broken != 0")?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct DbStats {
    pub path_count: u64,
    pub chapter_count: u64,
    pub step_count: u64,
    pub block_count: u64,
    pub field_count: u64,
    pub media_count: u64,
    pub broken_media_count: u64,
}

impl DbStats {
    /// Rows in the curriculum tables
    pub fn entity_count(&self) -> u64 {
        self.path_count
            + self.chapter_count
            + self.step_count
            + self.block_count
            + self.field_count
            + self.media_count
    }
}

// Re-exports
pub use paths::{
    BlockRow, ChapterRow, CreateBlockInput, CreateChapterInput, CreateMediaInput, CreatePathInput,
    CreateStepInput, FieldRow, MediaRow, PathRow, PathTree, StepRow,
};
pub use siblings::{BLOCKS, CHAPTERS, NESTED_BLOCKS, STEPS};
