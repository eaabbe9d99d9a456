//! Duplication job table

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;

use crate::error::{ErrorClass, StorageError};
use crate::jobs::{CancelResult, DuplicationJob, JobState, JobStore};

use super::CurriculumDb;

const JOB_COLUMNS: &str = "id, source_root_id, actor_id, state, attempts, max_attempts, \
    duplicate_root_id, last_error, error_class, cancel_requested, created_at, updated_at";

fn job_from_row(row: &Row) -> Result<DuplicationJob, rusqlite::Error> {
    let state: String = row.get("state")?;
    let state = JobState::parse(&state).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(DuplicationJob {
        id: row.get("id")?,
        source_root_id: row.get("source_root_id")?,
        actor_id: row.get("actor_id")?,
        state,
        attempts: row.get("attempts")?,
        max_attempts: row.get("max_attempts")?,
        duplicate_root_id: row.get("duplicate_root_id")?,
        last_error: row.get("last_error")?,
        error_class: row.get("error_class")?,
        cancel_requested: row.get("cancel_requested")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn load_job(conn: &Connection, job_id: &str) -> Result<Option<DuplicationJob>, StorageError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM duplication_jobs WHERE id = ?1",
        JOB_COLUMNS
    ))?;
    Ok(stmt.query_row(params![job_id], job_from_row).optional()?)
}

fn require_job(conn: &Connection, job_id: &str) -> Result<DuplicationJob, StorageError> {
    load_job(conn, job_id)?.ok_or_else(|| StorageError::NotFound(format!("job {}", job_id)))
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl JobStore for CurriculumDb {
    fn create_or_get_job(
        &self,
        source_root_id: i64,
        actor_id: &str,
        max_attempts: u32,
    ) -> Result<(DuplicationJob, bool), StorageError> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM duplication_jobs
                     WHERE source_root_id = ?1 AND actor_id = ?2
                       AND state IN ('queued', 'running', 'succeeded')
                     ORDER BY created_at DESC LIMIT 1",
                    params![source_root_id, actor_id],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(id) = existing {
                let job = require_job(&tx, &id)?;
                tx.commit()?;
                return Ok((job, false));
            }

            let id = uuid::Uuid::new_v4().to_string();
            let now = now();
            tx.execute(
                "INSERT INTO duplication_jobs (
                    id, source_root_id, actor_id, state, attempts, max_attempts,
                    next_attempt_at_ms, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, 'queued', 0, ?4, 0, ?5, ?5)",
                params![id, source_root_id, actor_id, max_attempts.max(1), now],
            )?;
            let job = require_job(&tx, &id)?;
            tx.commit()?;

            debug!(job_id = %id, source_root_id, actor_id = %actor_id, "Created duplication job");
            Ok((job, true))
        })
    }

    fn get_job(&self, job_id: &str) -> Result<Option<DuplicationJob>, StorageError> {
        self.with_conn(|conn| load_job(conn, job_id))
    }

    fn claim_job(
        &self,
        job_id: &str,
        now_ms: i64,
        lease_until_ms: i64,
    ) -> Result<Option<DuplicationJob>, StorageError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE duplication_jobs
                 SET state = 'running', attempts = attempts + 1,
                     next_attempt_at_ms = ?3, updated_at = ?4
                 WHERE id = ?1 AND state = 'queued' AND next_attempt_at_ms <= ?2",
                params![job_id, now_ms, lease_until_ms, now()],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            load_job(conn, job_id)
        })
    }

    fn complete_job(&self, job_id: &str, duplicate_root_id: i64) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE duplication_jobs
                 SET state = 'succeeded', duplicate_root_id = ?2,
                     last_error = NULL, error_class = NULL, updated_at = ?3
                 WHERE id = ?1",
                params![job_id, duplicate_root_id, now()],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound(format!("job {}", job_id)));
            }
            Ok(())
        })
    }

    fn requeue_job(
        &self,
        job_id: &str,
        error: &str,
        class: ErrorClass,
        next_attempt_at_ms: i64,
    ) -> Result<JobState, StorageError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE duplication_jobs
                 SET state = CASE WHEN cancel_requested != 0 THEN 'cancelled' ELSE 'queued' END,
                     last_error = ?2, error_class = ?3, next_attempt_at_ms = ?4, updated_at = ?5
                 WHERE id = ?1 AND state = 'running'",
                params![job_id, error, class.as_str(), next_attempt_at_ms, now()],
            )?;
            Ok(require_job(conn, job_id)?.state)
        })
    }

    fn dead_letter_job(&self, job_id: &str, error: &str, class: ErrorClass) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE duplication_jobs
                 SET state = 'dead_lettered', last_error = ?2, error_class = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![job_id, error, class.as_str(), now()],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound(format!("job {}", job_id)));
            }
            Ok(())
        })
    }

    fn request_cancel(&self, job_id: &str) -> Result<CancelResult, StorageError> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let job = require_job(&tx, job_id)?;
            let result = match job.state {
                JobState::Queued => {
                    tx.execute(
                        "UPDATE duplication_jobs
                         SET state = 'cancelled', cancel_requested = 1, updated_at = ?2
                         WHERE id = ?1",
                        params![job_id, now()],
                    )?;
                    CancelResult::Cancelled
                }
                JobState::Running => {
                    tx.execute(
                        "UPDATE duplication_jobs SET cancel_requested = 1, updated_at = ?2 WHERE id = ?1",
                        params![job_id, now()],
                    )?;
                    CancelResult::Requested
                }
                finished => CancelResult::AlreadyFinished(finished),
            };
            tx.commit()?;
            Ok(result)
        })
    }

    fn list_jobs(&self, state: Option<JobState>, limit: usize) -> Result<Vec<DuplicationJob>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM duplication_jobs
                 WHERE (?1 IS NULL OR state = ?1)
                 ORDER BY created_at DESC, id LIMIT ?2",
                JOB_COLUMNS
            ))?;
            let jobs = stmt
                .query_map(params![state.map(JobState::as_str), limit as i64], job_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(jobs)
        })
    }

    fn requeue_stale_running(&self, lease_expired_at_ms: Option<i64>) -> Result<usize, StorageError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE duplication_jobs
                 SET state = CASE WHEN cancel_requested != 0 THEN 'cancelled' ELSE 'queued' END,
                     next_attempt_at_ms = 0, updated_at = ?1
                 WHERE state = 'running' AND (?2 IS NULL OR next_attempt_at_ms <= ?2)",
                params![now(), lease_expired_at_ms],
            )?;
            Ok(changed)
        })
    }

    fn revive_dead_letter(&self, job_id: &str) -> Result<DuplicationJob, StorageError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE duplication_jobs
                 SET state = 'queued', attempts = 0, cancel_requested = 0,
                     next_attempt_at_ms = 0, updated_at = ?2
                 WHERE id = ?1 AND state = 'dead_lettered'",
                params![job_id, now()],
            )?;
            let job = require_job(conn, job_id)?;
            if changed == 0 {
                return Err(StorageError::InvalidInput(format!(
                    "job {} is {}, only dead-lettered jobs can be revived",
                    job_id, job.state
                )));
            }
            Ok(job)
        })
    }

    fn due_job_ids(&self, now_ms: i64, limit: usize) -> Result<Vec<String>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM duplication_jobs
                 WHERE state = 'queued' AND next_attempt_at_ms <= ?1
                 ORDER BY created_at, id LIMIT ?2",
            )?;
            let ids = stmt
                .query_map(params![now_ms, limit as i64], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(ids)
        })
    }
}
