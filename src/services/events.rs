//! Event system for curriculum operations
//!
//! Provides an event bus for notifying listeners about storage operations.
//! Useful for:
//! - Audit logging
//! - Cache invalidation
//! - Operator alerts on dead-lettered jobs and broken attachments

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

/// Events emitted by services, the job coordinator and the attachment copier
#[derive(Debug, Clone)]
pub enum StorageEvent {
    // Path events
    PathCreated {
        id: i64,
        title: String,
    },
    PathDeleted {
        id: i64,
    },

    // Ordering events
    SiblingInserted {
        table: &'static str,
        container_id: i64,
        id: i64,
        position: i64,
        shifted: usize,
    },
    SiblingDeleted {
        table: &'static str,
        container_id: i64,
        id: i64,
        shifted: usize,
    },
    SiblingsReordered {
        table: &'static str,
        container_id: i64,
        updated: usize,
    },

    // Duplication job events
    JobQueued {
        job_id: String,
        source_root_id: i64,
        actor_id: String,
    },
    JobRetrying {
        job_id: String,
        attempt: u32,
        error: String,
    },
    JobSucceeded {
        job_id: String,
        duplicate_root_id: i64,
    },
    JobDeadLettered {
        job_id: String,
        source_root_id: i64,
        actor_id: String,
        attempts: u32,
        error_class: String,
        error: String,
    },
    JobCancelled {
        job_id: String,
    },

    // Attachment events
    AttachmentCopied {
        task_id: i64,
        entity_id: i64,
    },
    AttachmentBroken {
        task_id: i64,
        root_id: i64,
        entity_id: i64,
        error: String,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    /// Handle an event
    fn on_event(&self, event: &StorageEvent);
}

/// Event bus for broadcasting storage events
pub struct EventBus {
    sender: broadcast::Sender<StorageEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new event bus with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: StorageEvent) {
        trace!(event = ?event, "Emitting storage event");
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging event listener for audit trails
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &StorageEvent) {
        match event {
            StorageEvent::PathCreated { id, title } => {
                debug!(id = id, title = %title, "Path created");
            }
            StorageEvent::SiblingsReordered {
                table,
                container_id,
                updated,
            } => {
                debug!(table = table, container_id = container_id, updated = updated, "Siblings reordered");
            }
            StorageEvent::JobSucceeded {
                job_id,
                duplicate_root_id,
            } => {
                info!(job_id = %job_id, duplicate_root_id = duplicate_root_id, "Duplication job succeeded");
            }
            StorageEvent::JobDeadLettered {
                job_id,
                source_root_id,
                actor_id,
                attempts,
                error_class,
                error,
            } => {
                error!(
                    job_id = %job_id,
                    source_root_id = source_root_id,
                    actor_id = %actor_id,
                    attempts = attempts,
                    error_class = %error_class,
                    error = %error,
                    "Duplication job dead-lettered"
                );
            }
            StorageEvent::AttachmentBroken {
                task_id,
                root_id,
                entity_id,
                error,
            } => {
                warn!(
                    task_id = task_id,
                    root_id = root_id,
                    entity_id = entity_id,
                    error = %error,
                    "Attachment flagged broken"
                );
            }
            _ => {
                trace!(event = ?event, "Storage event");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}
