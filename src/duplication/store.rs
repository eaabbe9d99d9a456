//! Hierarchy store seam used by the duplication executor

use crate::error::StorageError;
use crate::field::FieldValue;

/// Which source rows to load
#[derive(Debug, Clone, Copy)]
pub enum NodeSelector<'a> {
    Ids(&'a [i64]),
    Children {
        parent_column: &'a str,
        parent_ids: &'a [i64],
    },
}

/// A source row with only the columns requested for copying
#[derive(Debug, Clone, PartialEq)]
pub struct SourceNode {
    pub id: i64,
    /// Value of the selecting parent column (None when selected by id)
    pub parent_id: Option<i64>,
    pub values: Vec<FieldValue>,
}

/// Outbox entry for one blob copy, written with the duplicated rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttachmentCopy {
    pub root_id: i64,
    pub entity_table: String,
    pub entity_id: i64,
    pub broken_column: String,
    pub source_location: String,
    pub dest_location: String,
}

/// Store contract for deep copies.
///
/// `transaction` runs `f` in a single transaction and commits only when `f`
/// returns `Ok`. Nothing written inside a failed `f` may become visible.
pub trait HierarchyStore: Send + Sync {
    fn transaction<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut dyn HierarchyTx) -> Result<T, StorageError>;
}

pub trait HierarchyTx {
    /// Duplicate root already produced for `(source_root_id, actor_id)`
    fn find_duplicate(
        &mut self,
        source_root_id: i64,
        actor_id: &str,
    ) -> Result<Option<i64>, StorageError>;

    fn record_duplicate(
        &mut self,
        source_root_id: i64,
        actor_id: &str,
        duplicate_root_id: i64,
    ) -> Result<(), StorageError>;

    /// Column names of `table`, in declaration order
    fn table_columns(&mut self, table: &str) -> Result<Vec<String>, StorageError>;

    fn load_nodes(
        &mut self,
        table: &str,
        selector: NodeSelector<'_>,
        columns: &[String],
        order_by: Option<&str>,
    ) -> Result<Vec<SourceNode>, StorageError>;

    fn count_nodes(&mut self, table: &str, selector: NodeSelector<'_>) -> Result<u64, StorageError>;

    /// Insert rows and return their new ids in submission order
    fn insert_nodes(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[Vec<FieldValue>],
    ) -> Result<Vec<i64>, StorageError>;

    fn enqueue_attachment_copies(&mut self, tasks: &[NewAttachmentCopy]) -> Result<(), StorageError>;
}
