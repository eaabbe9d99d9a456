//! Duplication jobs
//!
//! A job wraps one `(source_root_id, actor_id)` duplication request:
//!
//! ```text
//! queued ──claim──► running ──ok──────────────► succeeded
//!   ▲                  │
//!   └── retryable ─────┤ (attempts < max_attempts)
//!                      ├── terminal / exhausted ─► dead_lettered ──revive──► queued
//!                      └── cancel requested ─────► cancelled
//! ```

pub mod coordinator;
pub mod queue;

use serde::Serialize;

use crate::attachments::AttachmentSummary;
use crate::error::{ErrorClass, StorageError};

pub use coordinator::{CoordinatorSettings, JobCoordinator, SubmitReceipt};
pub use queue::{InMemoryQueue, JobMessage, JobQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    DeadLettered,
    Cancelled,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::DeadLettered => "dead_lettered",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "dead_lettered" => Ok(JobState::DeadLettered),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(StorageError::InvalidInput(format!("unknown job state '{}'", other))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::DeadLettered | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicationJob {
    pub id: String,
    pub source_root_id: i64,
    pub actor_id: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub duplicate_root_id: Option<i64>,
    pub last_error: Option<String>,
    pub error_class: Option<String>,
    pub cancel_requested: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Result of a request to cancel a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    /// The job was queued and is now cancelled
    Cancelled,
    /// The job is mid-attempt; it stops at its next retry point
    Requested,
    /// The job already finished in the given state
    AlreadyFinished(JobState),
}

/// Job row plus what is known about its attachments
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job: DuplicationJob,
    pub attachments: AttachmentSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Pending,
    Succeeded {
        duplicate_root_id: i64,
        pending_attachments: u64,
    },
    /// Rows were duplicated but some attachments could not be copied
    Degraded {
        duplicate_root_id: i64,
        broken_attachments: u64,
    },
    DeadLettered {
        error_class: String,
        error: String,
    },
    Cancelled,
}

impl JobStatus {
    pub fn outcome(&self) -> JobOutcome {
        match self.job.state {
            JobState::Queued | JobState::Running => JobOutcome::Pending,
            JobState::Succeeded => {
                let duplicate_root_id = self.job.duplicate_root_id.unwrap_or_default();
                if self.attachments.failed > 0 {
                    JobOutcome::Degraded {
                        duplicate_root_id,
                        broken_attachments: self.attachments.failed,
                    }
                } else {
                    JobOutcome::Succeeded {
                        duplicate_root_id,
                        pending_attachments: self.attachments.pending,
                    }
                }
            }
            JobState::DeadLettered => JobOutcome::DeadLettered {
                error_class: self.job.error_class.clone().unwrap_or_default(),
                error: self.job.last_error.clone().unwrap_or_default(),
            },
            JobState::Cancelled => JobOutcome::Cancelled,
        }
    }
}

/// Persistence for duplication jobs
pub trait JobStore: Send + Sync {
    /// Return the live or succeeded job for `(source_root_id, actor_id)`, or
    /// create a queued one. The flag is true when a job was created.
    fn create_or_get_job(
        &self,
        source_root_id: i64,
        actor_id: &str,
        max_attempts: u32,
    ) -> Result<(DuplicationJob, bool), StorageError>;

    fn get_job(&self, job_id: &str) -> Result<Option<DuplicationJob>, StorageError>;

    /// Move a due queued job to running and count the attempt. The claim
    /// holds until `lease_until_ms`; after that the job counts as abandoned.
    ///
    /// Returns None when the job is not queued or not yet due.
    fn claim_job(
        &self,
        job_id: &str,
        now_ms: i64,
        lease_until_ms: i64,
    ) -> Result<Option<DuplicationJob>, StorageError>;

    fn complete_job(&self, job_id: &str, duplicate_root_id: i64) -> Result<(), StorageError>;

    /// Put a running job back in the queue after a retryable failure.
    ///
    /// A job whose cancellation was requested becomes cancelled instead;
    /// the returned state says which happened.
    fn requeue_job(
        &self,
        job_id: &str,
        error: &str,
        class: ErrorClass,
        next_attempt_at_ms: i64,
    ) -> Result<JobState, StorageError>;

    fn dead_letter_job(&self, job_id: &str, error: &str, class: ErrorClass) -> Result<(), StorageError>;

    fn request_cancel(&self, job_id: &str) -> Result<CancelResult, StorageError>;

    /// Newest first
    fn list_jobs(&self, state: Option<JobState>, limit: usize) -> Result<Vec<DuplicationJob>, StorageError>;

    /// Return abandoned running jobs to the queue: those whose lease ended
    /// by `lease_expired_at_ms`, or every running job when it is None
    /// (startup, where nothing can still be running).
    fn requeue_stale_running(&self, lease_expired_at_ms: Option<i64>) -> Result<usize, StorageError>;

    /// Re-queue a dead-lettered job with a fresh attempt budget
    fn revive_dead_letter(&self, job_id: &str) -> Result<DuplicationJob, StorageError>;

    /// Queued jobs whose next attempt is due, oldest first
    fn due_job_ids(&self, now_ms: i64, limit: usize) -> Result<Vec<String>, StorageError>;
}
