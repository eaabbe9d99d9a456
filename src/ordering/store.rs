//! Sibling store seam used by the ordering service

use crate::error::StorageError;
use crate::field::FieldValue;

use super::ledger::{PositionUpdate, Sibling};

/// Where siblings of one kind live: the table, the column naming their
/// container, and the column holding their position.
///
/// When one table holds siblings of several container kinds, the other
/// kinds' container columns are listed in `other_parent_columns`; a row
/// belongs to exactly one container, so those stay NULL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SiblingScope {
    pub table: &'static str,
    pub parent_column: &'static str,
    pub position_column: &'static str,
    pub other_parent_columns: &'static [&'static str],
}

impl SiblingScope {
    pub const fn new(
        table: &'static str,
        parent_column: &'static str,
        position_column: &'static str,
    ) -> Self {
        Self::shared(table, parent_column, position_column, &[])
    }

    /// Scope over a table whose rows may instead belong to containers named
    /// by `other_parent_columns`
    pub const fn shared(
        table: &'static str,
        parent_column: &'static str,
        position_column: &'static str,
        other_parent_columns: &'static [&'static str],
    ) -> Self {
        Self {
            table,
            parent_column,
            position_column,
            other_parent_columns,
        }
    }

    /// Columns a caller-supplied payload must not set
    pub fn is_managed_column(&self, column: &str) -> bool {
        column == "id"
            || column == self.parent_column
            || column == self.position_column
            || self.other_parent_columns.contains(&column)
    }
}

impl std::fmt::Display for SiblingScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.table, self.parent_column)
    }
}

/// Column values for a new sibling. The store adds the container and
/// position columns itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiblingPayload {
    pub fields: Vec<(String, FieldValue)>,
}

impl SiblingPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.push((column.into(), value.into()));
        self
    }
}

/// Store contract for ordered siblings.
///
/// `with_container` runs `f` inside one transaction that also serializes
/// against any other writer of the same container. If `f` fails, nothing it
/// wrote is kept.
pub trait SiblingStore: Send + Sync {
    fn with_container<T, F>(
        &self,
        scope: &SiblingScope,
        container_id: i64,
        f: F,
    ) -> Result<T, StorageError>
    where
        F: FnOnce(&mut dyn SiblingTx) -> Result<T, StorageError>;

    /// Container that currently owns sibling `id`, if it exists.
    fn container_of(&self, scope: &SiblingScope, id: i64) -> Result<Option<i64>, StorageError>;
}

/// Operations available inside a container transaction.
pub trait SiblingTx {
    /// Siblings of the container, ascending by position.
    fn current_positions(&mut self) -> Result<Vec<Sibling>, StorageError>;

    /// Write every update; any update that misses its row fails the batch.
    fn apply_updates(&mut self, updates: &[PositionUpdate]) -> Result<(), StorageError>;

    fn insert(&mut self, position: i64, payload: &SiblingPayload) -> Result<i64, StorageError>;

    fn remove(&mut self, id: i64) -> Result<(), StorageError>;
}
