//! Attachment copying
//!
//! Duplicated media rows point at fresh blob locations. The blobs themselves
//! are copied after the duplication commits, from an outbox of
//! [`AttachmentCopyTask`]s written in the same transaction as the rows.

pub mod blob_store;
pub mod copier;

use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::StorageError;

pub use blob_store::{BlobStore, BlobStoreStats, PutResult};
pub use copier::{AttachmentCopier, CopierSettings, CopyRound};

/// Prefix under which duplicated blobs are placed
pub const DUPLICATE_PREFIX: &str = "attachments";

/// New location for a copy of the blob at `source`.
///
/// Keeps the file name so content types stay recognisable.
pub fn duplicate_location(source: &str) -> String {
    let name = Path::new(source)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("blob");
    format!("{}/{}/{}", DUPLICATE_PREFIX, uuid::Uuid::new_v4(), name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentState {
    Pending,
    Succeeded,
    Failed,
}

impl AttachmentState {
    pub fn as_str(self) -> &'static str {
        match self {
            AttachmentState::Pending => "pending",
            AttachmentState::Succeeded => "succeeded",
            AttachmentState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "pending" => Ok(AttachmentState::Pending),
            "succeeded" => Ok(AttachmentState::Succeeded),
            "failed" => Ok(AttachmentState::Failed),
            other => Err(StorageError::Internal(format!("unknown attachment state '{}'", other))),
        }
    }
}

/// One external blob copy owed by a committed duplication
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentCopyTask {
    pub id: i64,
    /// Duplicate root the owning entity belongs to
    pub root_id: i64,
    pub entity_table: String,
    pub entity_id: i64,
    pub source_location: String,
    pub dest_location: String,
    pub state: AttachmentState,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Attachment task counts for one duplicate root
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AttachmentSummary {
    pub pending: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl AttachmentSummary {
    pub fn total(&self) -> u64 {
        self.pending + self.succeeded + self.failed
    }
}

/// Blob store collaborator. `copy` should copy server-side without
/// buffering the blob in process memory.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn copy(&self, source_location: &str, dest_location: &str) -> Result<(), StorageError>;
}

/// Persistence for the attachment outbox
pub trait AttachmentTaskStore: Send + Sync {
    /// Pending tasks that are due, oldest first
    fn pending_attachments(&self, now_ms: i64, limit: usize) -> Result<Vec<AttachmentCopyTask>, StorageError>;

    /// Count a failed attempt and schedule the next one
    fn record_attachment_retry(
        &self,
        task_id: i64,
        error: &str,
        next_attempt_at_ms: i64,
    ) -> Result<(), StorageError>;

    /// Mark a task succeeded and clear the owning entity's broken flag
    fn complete_attachment(&self, task_id: i64) -> Result<(), StorageError>;

    /// Mark a task failed and flag the owning entity broken
    fn fail_attachment(&self, task_id: i64, error: &str) -> Result<(), StorageError>;

    fn attachment_summary(&self, root_id: i64) -> Result<AttachmentSummary, StorageError>;

    /// Put failed tasks back to pending with a fresh attempt budget.
    ///
    /// Returns the number of tasks re-queued.
    fn retry_failed_attachments(&self, root_id: Option<i64>) -> Result<usize, StorageError>;
}
