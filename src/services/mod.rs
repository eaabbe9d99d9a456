//! Service layer for elohim-curriculum
//!
//! Services sit between the operator surface and the repositories. Each
//! service wraps database operations with input validation and event
//! emission.
//!
//! ## Architecture
//!
//! ```text
//! CLI / job workers
//!     ↓
//! Service Layer (validation, events)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod events;
pub mod path_service;

// Re-exports
pub use events::{spawn_logging_listener, EventBus, EventListener, LoggingEventListener, StorageEvent};
pub use path_service::PathService;

use crate::db::CurriculumDb;
use crate::duplication::DEFAULT_MAX_DEPTH;
use crate::ordering::OrderingService;
use std::sync::Arc;

/// Service container for dependency injection
///
/// Holds all services with shared database connection.
pub struct Services {
    pub path: Arc<PathService>,
    pub ordering: Arc<OrderingService<CurriculumDb>>,
    pub events: Arc<EventBus>,
}

impl Services {
    /// Create all services with shared database
    pub fn new(db: Arc<CurriculumDb>) -> Self {
        Self::with_events(db, Arc::new(EventBus::new()))
    }

    /// Create all services on an existing event bus
    pub fn with_events(db: Arc<CurriculumDb>, events: Arc<EventBus>) -> Self {
        Self::with_max_depth(db, events, DEFAULT_MAX_DEPTH)
    }

    /// Create all services with the depth ceiling duplication runs under
    pub fn with_max_depth(db: Arc<CurriculumDb>, events: Arc<EventBus>, max_depth: u32) -> Self {
        Self {
            path: Arc::new(PathService::new(db.clone(), events.clone()).with_max_depth(max_depth)),
            ordering: Arc::new(OrderingService::new(db, events.clone())),
            events,
        }
    }
}
