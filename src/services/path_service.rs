//! Path service - business logic for path operations
//!
//! Wraps the path repository with validation and event emission.

use std::sync::Arc;

use crate::db::{paths, CurriculumDb};
use crate::duplication::DEFAULT_MAX_DEPTH;
use crate::error::StorageError;

use super::events::{EventBus, StorageEvent};

const MAX_TITLE_LEN: usize = 500;

/// Path service for business logic
pub struct PathService {
    db: Arc<CurriculumDb>,
    events: Arc<EventBus>,
    max_depth: u32,
}

impl PathService {
    /// Create a new path service
    pub fn new(db: Arc<CurriculumDb>, events: Arc<EventBus>) -> Self {
        Self {
            db,
            events,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Use the duplication depth ceiling for imports and tree reads
    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Get path by ID
    pub fn get(&self, id: i64) -> Result<Option<paths::PathRow>, StorageError> {
        self.db.with_conn(|conn| paths::get_path(conn, id))
    }

    /// Get path with chapters, steps, blocks, fields and media
    pub fn get_tree(&self, id: i64) -> Result<Option<paths::PathTree>, StorageError> {
        self.db.with_conn(|conn| paths::get_path_tree(conn, id, self.max_depth))
    }

    /// List paths with pagination
    pub fn list(&self, limit: u32, offset: u32) -> Result<Vec<paths::PathRow>, StorageError> {
        self.db.with_conn(|conn| paths::list_paths(conn, limit, offset))
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Create a path with its whole tree
    pub fn create(&self, input: &paths::CreatePathInput) -> Result<i64, StorageError> {
        self.validate_path(input)?;

        let id = self.db.with_conn_mut(|conn| paths::create_path(conn, input, self.max_depth))?;

        self.events.emit(StorageEvent::PathCreated {
            id,
            title: input.title.clone(),
        });

        Ok(id)
    }

    /// Delete path by ID (cascades to the whole tree)
    pub fn delete(&self, id: i64) -> Result<bool, StorageError> {
        let deleted = self.db.with_conn(|conn| paths::delete_path(conn, id))?;

        if deleted {
            self.events.emit(StorageEvent::PathDeleted { id });
        }

        Ok(deleted)
    }

    // =========================================================================
    // Validation
    // =========================================================================

    fn validate_path(&self, input: &paths::CreatePathInput) -> Result<(), StorageError> {
        validate_title("title", &input.title)?;

        let valid_types = ["guided", "self-paced", "challenge", "assessment", "exploration"];
        if !valid_types.contains(&input.path_type.as_str()) {
            return Err(StorageError::InvalidInput(format!(
                "path_type '{}' is not valid. Valid types: {:?}",
                input.path_type, valid_types
            )));
        }

        let valid_visibility = ["public", "private", "unlisted", "draft"];
        if !valid_visibility.contains(&input.visibility.as_str()) {
            return Err(StorageError::InvalidInput(format!(
                "visibility '{}' is not valid. Valid values: {:?}",
                input.visibility, valid_visibility
            )));
        }

        validate_metadata("metadata_json", input.metadata_json.as_deref())?;

        for (i, chapter) in input.chapters.iter().enumerate() {
            validate_title("title", &chapter.title)
                .map_err(|e| StorageError::InvalidInput(format!("chapters[{}]: {}", i, e)))?;

            for (j, step) in chapter.steps.iter().enumerate() {
                self.validate_step(step).map_err(|e| {
                    StorageError::InvalidInput(format!("chapters[{}].steps[{}]: {}", i, j, e))
                })?;
            }
        }

        Ok(())
    }

    fn validate_step(&self, input: &paths::CreateStepInput) -> Result<(), StorageError> {
        validate_title("title", &input.title)?;

        let valid_types = [
            "learn", "practice", "quiz", "assessment", "discussion",
            "project", "resource", "video", "reading", "checkpoint",
        ];
        if !valid_types.contains(&input.step_type.as_str()) {
            return Err(StorageError::InvalidInput(format!(
                "step_type '{}' is not valid. Valid types: {:?}",
                input.step_type, valid_types
            )));
        }

        validate_metadata("metadata_json", input.metadata_json.as_deref())?;

        fn check_media(blocks: &[paths::CreateBlockInput]) -> Result<(), StorageError> {
            for block in blocks {
                if block.media.iter().any(|m| m.storage_location.trim().is_empty()) {
                    return Err(StorageError::InvalidInput(
                        "media storage_location is required".into(),
                    ));
                }
                check_media(&block.children)?;
            }
            Ok(())
        }
        check_media(&input.blocks)
    }
}

fn validate_title(name: &str, value: &str) -> Result<(), StorageError> {
    if value.trim().is_empty() {
        return Err(StorageError::InvalidInput(format!("{} is required", name)));
    }
    if value.len() > MAX_TITLE_LEN {
        return Err(StorageError::InvalidInput(format!(
            "{} must be <= {} characters",
            name, MAX_TITLE_LEN
        )));
    }
    Ok(())
}

fn validate_metadata(name: &str, value: Option<&str>) -> Result<(), StorageError> {
    if let Some(json_str) = value {
        if !json_str.is_empty() {
            serde_json::from_str::<serde_json::Value>(json_str).map_err(|e| {
                StorageError::InvalidInput(format!("{} is not valid JSON: {}", name, e))
            })?;
        }
    }
    Ok(())
}
