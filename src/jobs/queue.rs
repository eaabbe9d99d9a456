//! Job queue seam
//!
//! Delivery is at-least-once: a message may arrive twice or after its job
//! already finished. The coordinator's claim step makes that harmless.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

use crate::error::StorageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMessage {
    pub job_id: String,
}

impl JobMessage {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self { job_id: job_id.into() }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Deliver `message` after `delay`
    async fn publish(&self, message: JobMessage, delay: Duration) -> Result<(), StorageError>;

    /// Wait for the next message; None once the queue is closed
    async fn receive(&self) -> Option<JobMessage>;

    /// Next message if one is ready now
    async fn try_receive(&self) -> Option<JobMessage>;
}

/// Process-local queue over an unbounded tokio channel
pub struct InMemoryQueue {
    sender: mpsc::UnboundedSender<JobMessage>,
    receiver: Mutex<mpsc::UnboundedReceiver<JobMessage>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn publish(&self, message: JobMessage, delay: Duration) -> Result<(), StorageError> {
        trace!(job_id = %message.job_id, delay_ms = delay.as_millis() as u64, "Publishing job message");

        if delay.is_zero() {
            return self
                .sender
                .send(message)
                .map_err(|_| StorageError::Internal("job queue closed".into()));
        }

        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // receiver gone means shutdown
            let _ = sender.send(message);
        });
        Ok(())
    }

    async fn receive(&self) -> Option<JobMessage> {
        self.receiver.lock().await.recv().await
    }

    async fn try_receive(&self) -> Option<JobMessage> {
        self.receiver.lock().await.try_recv().ok()
    }
}
