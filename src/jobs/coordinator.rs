//! Job coordinator
//!
//! Accepts duplication requests, persists them as jobs and drives them
//! through the executor on a pool of tokio workers. Each attempt runs the
//! synchronous executor on the blocking pool under a per-attempt timeout.
//! Retryable failures go back on the queue with exponential backoff; anything
//! else, or a job out of attempts, is dead-lettered and logged for an operator.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::attachments::AttachmentTaskStore;
use crate::config::{DuplicationConfig, RetryPolicy};
use crate::duplication::{DuplicationExecutor, DuplicationRequest, HierarchyStore};
use crate::error::StorageError;
use crate::services::events::{EventBus, StorageEvent};

use super::queue::{JobMessage, JobQueue};
use super::{CancelResult, DuplicationJob, JobState, JobStatus, JobStore};

/// Jobs re-published per poll of the job table
const POLL_BATCH: usize = 256;

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub worker_count: usize,
    pub retry: RetryPolicy,
    pub attempt_timeout: Duration,
    pub poll_interval: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &DuplicationConfig) -> Self {
        Self {
            worker_count: config.worker_count.max(1),
            retry: config.retry_policy(),
            attempt_timeout: config.attempt_timeout(),
            poll_interval: config.poll_interval(),
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_config(&DuplicationConfig::default())
    }
}

/// Accepted-but-pending answer to a duplication request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub job_id: String,
    pub state: JobState,
    /// False when an existing job for the same source and actor was returned
    pub created: bool,
}

pub struct JobCoordinator<S, H, Q> {
    jobs: Arc<S>,
    executor: Arc<DuplicationExecutor<H>>,
    queue: Arc<Q>,
    events: Arc<EventBus>,
    settings: CoordinatorSettings,
    attachments_ready: Arc<Notify>,
}

impl<S, H, Q> JobCoordinator<S, H, Q>
where
    S: JobStore + AttachmentTaskStore + 'static,
    H: HierarchyStore + 'static,
    Q: JobQueue + 'static,
{
    pub fn new(
        jobs: Arc<S>,
        executor: Arc<DuplicationExecutor<H>>,
        queue: Arc<Q>,
        events: Arc<EventBus>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            jobs,
            executor,
            queue,
            events,
            settings,
            attachments_ready: Arc::new(Notify::new()),
        }
    }

    /// Share a wake-up signal with the attachment copier
    pub fn with_attachment_notify(mut self, notify: Arc<Notify>) -> Self {
        self.attachments_ready = notify;
        self
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Accept a duplication request and return without waiting for it.
    pub async fn submit(
        &self,
        source_root_id: i64,
        actor_id: &str,
    ) -> Result<SubmitReceipt, StorageError> {
        if source_root_id <= 0 {
            return Err(StorageError::InvalidInput(format!(
                "invalid source root id {}",
                source_root_id
            )));
        }
        let actor_id = actor_id.trim();
        if actor_id.is_empty() {
            return Err(StorageError::InvalidInput("actor id is required".into()));
        }

        let (job, created) =
            self.jobs
                .create_or_get_job(source_root_id, actor_id, self.settings.retry.max_attempts)?;

        if created {
            self.queue
                .publish(JobMessage::new(&job.id), Duration::ZERO)
                .await?;
            info!(
                job_id = %job.id,
                source_root_id,
                actor_id = %actor_id,
                "Duplication job queued"
            );
            self.events.emit(StorageEvent::JobQueued {
                job_id: job.id.clone(),
                source_root_id,
                actor_id: actor_id.to_string(),
            });
        } else {
            debug!(job_id = %job.id, state = %job.state, "Returning existing duplication job");
        }

        Ok(SubmitReceipt {
            job_id: job.id,
            state: job.state,
            created,
        })
    }

    pub fn status(&self, job_id: &str) -> Result<JobStatus, StorageError> {
        let job = self
            .jobs
            .get_job(job_id)?
            .ok_or_else(|| StorageError::NotFound(format!("job {}", job_id)))?;

        let attachments = match job.duplicate_root_id {
            Some(root_id) => self.jobs.attachment_summary(root_id)?,
            None => Default::default(),
        };

        Ok(JobStatus { job, attachments })
    }

    /// Cancel a job between attempts. A running attempt is never interrupted.
    pub fn cancel(&self, job_id: &str) -> Result<CancelResult, StorageError> {
        let result = self.jobs.request_cancel(job_id)?;
        match result {
            CancelResult::Cancelled => {
                info!(job_id = %job_id, "Duplication job cancelled");
                self.events.emit(StorageEvent::JobCancelled {
                    job_id: job_id.to_string(),
                });
            }
            CancelResult::Requested => {
                info!(job_id = %job_id, "Cancellation requested for running job");
            }
            CancelResult::AlreadyFinished(state) => {
                debug!(job_id = %job_id, state = %state, "Job already finished");
            }
        }
        Ok(result)
    }

    pub fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<DuplicationJob>, StorageError> {
        self.jobs.list_jobs(state, limit)
    }

    pub fn dead_letters(&self, limit: usize) -> Result<Vec<DuplicationJob>, StorageError> {
        self.jobs.list_jobs(Some(JobState::DeadLettered), limit)
    }

    /// Manually re-queue a dead-lettered job
    pub async fn revive(&self, job_id: &str) -> Result<DuplicationJob, StorageError> {
        let job = self.jobs.revive_dead_letter(job_id)?;
        self.queue
            .publish(JobMessage::new(&job.id), Duration::ZERO)
            .await?;
        info!(job_id = %job.id, "Dead-lettered job revived");
        self.events.emit(StorageEvent::JobQueued {
            job_id: job.id.clone(),
            source_root_id: job.source_root_id,
            actor_id: job.actor_id.clone(),
        });
        Ok(job)
    }

    /// Re-queue jobs abandoned mid-attempt and publish every queued job.
    ///
    /// Run once at startup, before the workers.
    pub async fn recover(&self) -> Result<usize, StorageError> {
        let stale = self.jobs.requeue_stale_running(None)?;
        if stale > 0 {
            warn!(count = stale, "Re-queued jobs left running by a previous process");
        }

        let published = self.publish_due().await?;
        info!(published, "Recovered duplication jobs");
        Ok(published)
    }

    /// How long a claim holds before the poller treats the job as abandoned.
    ///
    /// Covers the attempt itself plus the bookkeeping write after it.
    fn lease(&self) -> Duration {
        self.settings.attempt_timeout * 2
    }

    /// Re-queue running jobs whose lease ran out, e.g. because recording
    /// the attempt's result failed.
    fn requeue_expired_leases(&self) -> Result<usize, StorageError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let expired = self.jobs.requeue_stale_running(Some(now_ms))?;
        if expired > 0 {
            warn!(count = expired, "Re-queued running jobs whose lease expired");
        }
        Ok(expired)
    }

    async fn publish_due(&self) -> Result<usize, StorageError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let ids = self.jobs.due_job_ids(now_ms, POLL_BATCH)?;
        for id in &ids {
            self.queue.publish(JobMessage::new(id), Duration::ZERO).await?;
        }
        Ok(ids.len())
    }

    /// Handle one message if the queue has one ready.
    ///
    /// Returns the job's state after handling, or None when there was nothing
    /// to do.
    pub async fn process_next(&self) -> Result<Option<JobState>, StorageError> {
        match self.queue.try_receive().await {
            Some(message) => self.handle_message(message).await,
            None => Ok(None),
        }
    }

    /// Run one attempt of the job named by `message`.
    ///
    /// Messages for jobs that are not claimable (finished, cancelled, claimed
    /// elsewhere or not yet due) are dropped.
    pub async fn handle_message(&self, message: JobMessage) -> Result<Option<JobState>, StorageError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let lease_until_ms = now_ms + self.lease().as_millis() as i64;
        let Some(job) = self.jobs.claim_job(&message.job_id, now_ms, lease_until_ms)? else {
            debug!(job_id = %message.job_id, "Job not claimable, dropping message");
            return Ok(None);
        };

        debug!(
            job_id = %job.id,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "Running duplication attempt"
        );

        let request = DuplicationRequest::new(job.source_root_id, job.actor_id.clone());
        let executor = self.executor.clone();
        let timeout = self.settings.attempt_timeout;

        let attempt = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || executor.duplicate(&request)),
        )
        .await;

        let result = match attempt {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(StorageError::Internal(format!(
                "duplication attempt aborted: {}",
                join_error
            ))),
            Err(_) => Err(StorageError::Timeout(format!(
                "attempt {} exceeded {}s",
                job.attempts,
                timeout.as_secs_f64()
            ))),
        };

        match result {
            Ok(outcome) => {
                self.jobs.complete_job(&job.id, outcome.duplicate_root_id)?;
                info!(
                    job_id = %job.id,
                    duplicate_root_id = outcome.duplicate_root_id,
                    already_existed = outcome.already_existed,
                    attempt = job.attempts,
                    "Duplication job succeeded"
                );
                self.events.emit(StorageEvent::JobSucceeded {
                    job_id: job.id.clone(),
                    duplicate_root_id: outcome.duplicate_root_id,
                });
                if outcome.attachment_copies > 0 {
                    self.attachments_ready.notify_one();
                }
                Ok(Some(JobState::Succeeded))
            }
            Err(e) => self.handle_failure(&job, e).await.map(Some),
        }
    }

    async fn handle_failure(
        &self,
        job: &DuplicationJob,
        e: StorageError,
    ) -> Result<JobState, StorageError> {
        let class = e.class();
        let message = e.to_string();

        let retry = self
            .settings
            .retry
            .with_max_attempts(job.max_attempts)
            .next_retry(job.attempts, e.is_retryable());

        if let Some(delay) = retry {
            let next_attempt_at_ms = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;

            let state = self
                .jobs
                .requeue_job(&job.id, &message, class, next_attempt_at_ms)?;

            if state == JobState::Cancelled {
                info!(job_id = %job.id, attempt = job.attempts, "Duplication job cancelled before retry");
                self.events.emit(StorageEvent::JobCancelled {
                    job_id: job.id.clone(),
                });
                return Ok(state);
            }

            warn!(
                job_id = %job.id,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error_class = %class,
                error = %message,
                "Duplication attempt failed, retrying"
            );
            self.events.emit(StorageEvent::JobRetrying {
                job_id: job.id.clone(),
                attempt: job.attempts,
                error: message,
            });
            self.queue.publish(JobMessage::new(&job.id), delay).await?;
            return Ok(JobState::Queued);
        }

        self.jobs.dead_letter_job(&job.id, &message, class)?;
        error!(
            job_id = %job.id,
            source_root_id = job.source_root_id,
            actor_id = %job.actor_id,
            attempts = job.attempts,
            error_class = %class,
            error = %message,
            "Duplication job dead-lettered"
        );
        self.events.emit(StorageEvent::JobDeadLettered {
            job_id: job.id.clone(),
            source_root_id: job.source_root_id,
            actor_id: job.actor_id.clone(),
            attempts: job.attempts,
            error_class: class.to_string(),
            error: message,
        });
        Ok(JobState::DeadLettered)
    }

    /// Pull and handle messages until shutdown
    pub async fn run_worker(self: Arc<Self>, worker: usize, mut shutdown: broadcast::Receiver<()>) {
        debug!(worker, "Duplication worker started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(worker, "Duplication worker shutdown requested");
                    break;
                }
                message = self.queue.receive() => {
                    let Some(message) = message else {
                        debug!(worker, "Job queue closed");
                        break;
                    };
                    let job_id = message.job_id.clone();
                    if let Err(e) = self.handle_message(message).await {
                        error!(worker, job_id = %job_id, error = %e, "Failed to handle job message");
                    }
                }
            }
        }
    }

    /// Re-publish due queued jobs on an interval, picking up work submitted
    /// by other processes, retries whose in-process timer was lost and
    /// running jobs whose lease expired.
    pub async fn run_poller(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.requeue_expired_leases() {
                        warn!(error = %e, "Failed to re-queue expired leases");
                    }
                    match self.publish_due().await {
                        Ok(0) => {}
                        Ok(n) => debug!(published = n, "Published due jobs"),
                        Err(e) => warn!(error = %e, "Failed to poll job table"),
                    }
                }
            }
        }
    }

    /// Start the worker pool and the job table poller
    pub fn spawn_workers(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<JoinHandle<()>> = (0..self.settings.worker_count)
            .map(|worker| tokio::spawn(self.clone().run_worker(worker, shutdown.subscribe())))
            .collect();
        handles.push(tokio::spawn(self.clone().run_poller(shutdown.subscribe())));
        info!(workers = self.settings.worker_count, "Started duplication workers");
        handles
    }
}
