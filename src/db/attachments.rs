//! Attachment copy outbox

use rusqlite::{params, Connection, Row, TransactionBehavior};

use crate::attachments::{AttachmentCopyTask, AttachmentState, AttachmentSummary, AttachmentTaskStore};
use crate::error::StorageError;

use super::sql::ensure_identifier;
use super::CurriculumDb;

const TASK_COLUMNS: &str = "id, root_id, entity_table, entity_id, source_location, dest_location, \
    state, attempts, last_error";

fn task_from_row(row: &Row) -> Result<AttachmentCopyTask, rusqlite::Error> {
    let state: String = row.get("state")?;
    let state = AttachmentState::parse(&state).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(AttachmentCopyTask {
        id: row.get("id")?,
        root_id: row.get("root_id")?,
        entity_table: row.get("entity_table")?,
        entity_id: row.get("entity_id")?,
        source_location: row.get("source_location")?,
        dest_location: row.get("dest_location")?,
        state,
        attempts: row.get("attempts")?,
        last_error: row.get("last_error")?,
    })
}

/// Finish a task and set the owning row's broken flag, in one transaction
fn finish_task(
    conn: &mut Connection,
    task_id: i64,
    state: AttachmentState,
    error: Option<&str>,
) -> Result<(), StorageError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let (entity_table, entity_id, broken_column): (String, i64, String) = tx
        .query_row(
            "SELECT entity_table, entity_id, broken_column FROM attachment_copy_tasks WHERE id = ?1",
            params![task_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                StorageError::NotFound(format!("attachment task {}", task_id))
            }
            other => other.into(),
        })?;
    ensure_identifier(&entity_table)?;
    ensure_identifier(&broken_column)?;

    tx.execute(
        "UPDATE attachment_copy_tasks
         SET state = ?2, attempts = attempts + 1, last_error = ?3, updated_at = ?4
         WHERE id = ?1",
        params![task_id, state.as_str(), error, chrono::Utc::now().to_rfc3339()],
    )?;

    let broken = state == AttachmentState::Failed;
    tx.execute(
        &format!(
            "UPDATE {} SET {} = ?2 WHERE id = ?1",
            entity_table, broken_column
        ),
        params![entity_id, broken],
    )?;

    tx.commit()?;
    Ok(())
}

impl CurriculumDb {
    /// Every copy task owed by one duplicate root, oldest first
    pub fn list_attachment_tasks(&self, root_id: i64) -> Result<Vec<AttachmentCopyTask>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM attachment_copy_tasks WHERE root_id = ?1 ORDER BY id",
                TASK_COLUMNS
            ))?;
            let tasks = stmt
                .query_map(params![root_id], task_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }
}

impl AttachmentTaskStore for CurriculumDb {
    fn pending_attachments(&self, now_ms: i64, limit: usize) -> Result<Vec<AttachmentCopyTask>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM attachment_copy_tasks
                 WHERE state = 'pending' AND next_attempt_at_ms <= ?1
                 ORDER BY id LIMIT ?2",
                TASK_COLUMNS
            ))?;
            let tasks = stmt
                .query_map(params![now_ms, limit as i64], task_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }

    fn record_attachment_retry(
        &self,
        task_id: i64,
        error: &str,
        next_attempt_at_ms: i64,
    ) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE attachment_copy_tasks
                 SET attempts = attempts + 1, last_error = ?2, next_attempt_at_ms = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![task_id, error, next_attempt_at_ms, chrono::Utc::now().to_rfc3339()],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound(format!("attachment task {}", task_id)));
            }
            Ok(())
        })
    }

    fn complete_attachment(&self, task_id: i64) -> Result<(), StorageError> {
        self.with_conn_mut(|conn| finish_task(conn, task_id, AttachmentState::Succeeded, None))
    }

    fn fail_attachment(&self, task_id: i64, error: &str) -> Result<(), StorageError> {
        self.with_conn_mut(|conn| finish_task(conn, task_id, AttachmentState::Failed, Some(error)))
    }

    fn attachment_summary(&self, root_id: i64) -> Result<AttachmentSummary, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT state, COUNT(*) FROM attachment_copy_tasks WHERE root_id = ?1 GROUP BY state",
            )?;
            let mut summary = AttachmentSummary::default();
            let rows = stmt.query_map(params![root_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (state, count) = row?;
                match AttachmentState::parse(&state)? {
                    AttachmentState::Pending => summary.pending = count as u64,
                    AttachmentState::Succeeded => summary.succeeded = count as u64,
                    AttachmentState::Failed => summary.failed = count as u64,
                }
            }
            Ok(summary)
        })
    }

    fn retry_failed_attachments(&self, root_id: Option<i64>) -> Result<usize, StorageError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE attachment_copy_tasks
                 SET state = 'pending', attempts = 0, next_attempt_at_ms = 0, updated_at = ?2
                 WHERE state = 'failed' AND (?1 IS NULL OR root_id = ?1)",
                params![root_id, chrono::Utc::now().to_rfc3339()],
            )?;
            Ok(changed)
        })
    }
}
