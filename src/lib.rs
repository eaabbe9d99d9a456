//! Elohim Curriculum - ordered curriculum storage and path duplication
//!
//! Keeps learning paths (path → chapter → step → block → field / media) in
//! SQLite, with two guarantees:
//!
//! - **Dense sibling order**: every container's children hold positions
//!   `0..n-1` with no gaps or duplicates, across insert, delete, move and
//!   bulk reorder.
//! - **Safe deep copy**: a path can be duplicated for an actor as one
//!   all-or-nothing transaction, at most once per (source, actor), driven by
//!   a retrying job coordinator. Attachment blobs are copied afterwards; a
//!   failed copy flags its media row instead of undoing the duplicate.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/elohim-curriculum/
//! ├── curriculum.db          # Paths, jobs and attachment outbox
//! ├── blobs/                 # Location-keyed attachment blobs
//! │   ├── uploads/...
//! │   └── attachments/{uuid}/...
//! └── config.toml            # Configuration
//! ```
//!
//! ## Modules
//!
//! - [`ordering`] - position ledger and the ordering service
//! - [`duplication`] - hierarchy schema, planner and executor
//! - [`jobs`] - job store, queue and coordinator
//! - [`attachments`] - blob store and attachment copier
//! - [`db`] - SQLite implementations of every store seam

pub mod attachments;
pub mod config;
pub mod db;
pub mod duplication;
pub mod error;
pub mod field;
pub mod jobs;
pub mod ordering;
pub mod services;

// Re-exports
pub use attachments::{AttachmentCopier, BlobStore};
pub use config::Config;
pub use db::CurriculumDb;
pub use duplication::{DuplicationExecutor, DuplicationOutcome, DuplicationRequest, HierarchySchema};
pub use error::{ErrorClass, StorageError};
pub use field::FieldValue;
pub use jobs::{InMemoryQueue, JobCoordinator, JobOutcome, JobState};
pub use ordering::{OrderingService, SiblingScope};
pub use services::{EventBus, Services, StorageEvent};
