//! Attachment copier
//!
//! Drains the attachment outbox independently of the duplication workers.
//! Copies run concurrently up to a semaphore limit. A failed copy is retried
//! with backoff; once its attempts run out the task is marked failed and the
//! owning row is flagged broken. The row itself is never removed.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{AttachmentConfig, RetryPolicy};
use crate::error::{ErrorClass, StorageError};
use crate::services::events::{EventBus, StorageEvent};

use super::{AttachmentCopyTask, AttachmentStore, AttachmentTaskStore};

#[derive(Debug, Clone)]
pub struct CopierSettings {
    pub max_concurrent: usize,
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
}

impl CopierSettings {
    pub fn from_config(config: &AttachmentConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent_copies.max(1),
            batch_size: config.batch_size.max(1),
            retry: config.retry_policy(),
            poll_interval: config.poll_interval(),
        }
    }
}

impl Default for CopierSettings {
    fn default() -> Self {
        Self::from_config(&AttachmentConfig::default())
    }
}

/// Tally of one pass over the outbox
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CopyRound {
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
}

impl CopyRound {
    pub fn total(&self) -> usize {
        self.succeeded + self.retried + self.failed
    }
}

pub struct AttachmentCopier<T, A> {
    tasks: Arc<T>,
    store: Arc<A>,
    events: Arc<EventBus>,
    settings: CopierSettings,
    permits: Arc<Semaphore>,
    notify: Arc<Notify>,
}

impl<T, A> AttachmentCopier<T, A>
where
    T: AttachmentTaskStore + 'static,
    A: AttachmentStore + 'static,
{
    pub fn new(tasks: Arc<T>, store: Arc<A>, events: Arc<EventBus>, settings: CopierSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent));
        Self {
            tasks,
            store,
            events,
            settings,
            permits,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Signal that wakes the copier early; hand it to the job coordinator
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Copy every due pending task once
    pub async fn process_pending(&self) -> Result<CopyRound, StorageError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let pending = self.tasks.pending_attachments(now_ms, self.settings.batch_size)?;
        if pending.is_empty() {
            return Ok(CopyRound::default());
        }

        debug!(count = pending.len(), "Copying attachments");

        let mut copies = JoinSet::new();
        for task in pending {
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| StorageError::Internal(format!("copier semaphore closed: {}", e)))?;
            let store = self.store.clone();
            copies.spawn(async move {
                let result = store.copy(&task.source_location, &task.dest_location).await;
                drop(permit);
                (task, result)
            });
        }

        let mut round = CopyRound::default();
        while let Some(joined) = copies.join_next().await {
            let (task, result) = joined
                .map_err(|e| StorageError::Internal(format!("attachment copy aborted: {}", e)))?;
            match result {
                Ok(()) => {
                    self.tasks.complete_attachment(task.id)?;
                    self.events.emit(StorageEvent::AttachmentCopied {
                        task_id: task.id,
                        entity_id: task.entity_id,
                    });
                    round.succeeded += 1;
                }
                Err(e) => {
                    if self.record_failure(&task, &e)? {
                        round.retried += 1;
                    } else {
                        round.failed += 1;
                    }
                }
            }
        }

        if round.total() > 0 {
            info!(
                succeeded = round.succeeded,
                retried = round.retried,
                failed = round.failed,
                "Attachment copy round finished"
            );
        }
        Ok(round)
    }

    /// Schedule a retry or give up. Returns true when a retry was scheduled.
    fn record_failure(&self, task: &AttachmentCopyTask, e: &StorageError) -> Result<bool, StorageError> {
        let attempt = task.attempts + 1;
        let message = e.to_string();
        let retryable = e.class() != ErrorClass::Validation;

        if let Some(delay) = self.settings.retry.next_retry(attempt, retryable) {
            let next_attempt_at_ms = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;
            self.tasks
                .record_attachment_retry(task.id, &message, next_attempt_at_ms)?;
            debug!(
                task_id = task.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "Attachment copy failed, retrying"
            );
            return Ok(true);
        }

        self.tasks.fail_attachment(task.id, &message)?;
        warn!(
            task_id = task.id,
            root_id = task.root_id,
            entity_table = %task.entity_table,
            entity_id = task.entity_id,
            source = %task.source_location,
            attempts = attempt,
            error = %message,
            "Attachment copy failed, owning row flagged broken"
        );
        self.events.emit(StorageEvent::AttachmentBroken {
            task_id: task.id,
            root_id: task.root_id,
            entity_id: task.entity_id,
            error: message,
        });
        Ok(false)
    }

    /// Re-queue failed tasks, optionally for one duplicate root only
    pub fn repair(&self, root_id: Option<i64>) -> Result<usize, StorageError> {
        let requeued = self.tasks.retry_failed_attachments(root_id)?;
        if requeued > 0 {
            info!(requeued, root_id = ?root_id, "Re-queued failed attachment copies");
            self.notify.notify_one();
        }
        Ok(requeued)
    }

    /// Copy until shutdown, woken by the notifier or the poll interval
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            max_concurrent = self.settings.max_concurrent,
            "Attachment copier started"
        );
        loop {
            let full_batch = match self.process_pending().await {
                Ok(round) => round.total() >= self.settings.batch_size,
                Err(e) => {
                    error!(error = %e, "Attachment copy round failed");
                    false
                }
            };
            if full_batch {
                if shutdown.try_recv().is_ok() {
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Attachment copier shutdown requested");
                    break;
                }
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
    }
}
