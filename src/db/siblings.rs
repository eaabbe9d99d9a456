//! Sibling store over SQLite
//!
//! Every container operation runs in a `BEGIN IMMEDIATE` transaction, so the
//! writer lock is held from the moment positions are read until commit.
//! Two writers of the same container can never interleave their shifts.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};

use crate::error::StorageError;
use crate::field::FieldValue;
use crate::ordering::{PositionUpdate, Sibling, SiblingPayload, SiblingScope, SiblingStore, SiblingTx};

use super::sql::{ensure_identifier, placeholders, table_columns};
use super::CurriculumDb;

pub const CHAPTERS: SiblingScope = SiblingScope::new("chapters", "path_id", "order_index");
pub const STEPS: SiblingScope = SiblingScope::new("steps", "chapter_id", "order_index");
/// Top-level blocks of a step
pub const BLOCKS: SiblingScope =
    SiblingScope::shared("step_blocks", "step_id", "order_index", &["parent_block_id"]);
/// Blocks nested inside another block
pub const NESTED_BLOCKS: SiblingScope =
    SiblingScope::shared("step_blocks", "parent_block_id", "order_index", &["step_id"]);

fn check_scope(scope: &SiblingScope) -> Result<(), StorageError> {
    ensure_identifier(scope.table)?;
    ensure_identifier(scope.parent_column)?;
    ensure_identifier(scope.position_column)?;
    scope
        .other_parent_columns
        .iter()
        .try_for_each(|column| ensure_identifier(column))
}

impl SiblingStore for CurriculumDb {
    fn with_container<T, F>(
        &self,
        scope: &SiblingScope,
        container_id: i64,
        f: F,
    ) -> Result<T, StorageError>
    where
        F: FnOnce(&mut dyn SiblingTx) -> Result<T, StorageError>,
    {
        check_scope(scope)?;
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = {
                let mut siblings = SqliteSiblingTx {
                    conn: &tx,
                    scope: *scope,
                    container_id,
                };
                f(&mut siblings)?
            };
            tx.commit()?;
            Ok(value)
        })
    }

    fn container_of(&self, scope: &SiblingScope, id: i64) -> Result<Option<i64>, StorageError> {
        check_scope(scope)?;
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM {} WHERE id = ?1",
                scope.parent_column, scope.table
            );
            let container: Option<Option<i64>> = conn
                .query_row(&sql, params![id], |row| row.get(0))
                .optional()?;
            Ok(container.flatten())
        })
    }
}

struct SqliteSiblingTx<'a> {
    conn: &'a Connection,
    scope: SiblingScope,
    container_id: i64,
}

impl SiblingTx for SqliteSiblingTx<'_> {
    fn current_positions(&mut self) -> Result<Vec<Sibling>, StorageError> {
        let sql = format!(
            "SELECT id, {pos} FROM {table} WHERE {parent} = ?1 ORDER BY {pos}, id",
            pos = self.scope.position_column,
            table = self.scope.table,
            parent = self.scope.parent_column,
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let siblings = stmt
            .query_map(params![self.container_id], |row| {
                Ok(Sibling::new(row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(siblings)
    }

    fn apply_updates(&mut self, updates: &[PositionUpdate]) -> Result<(), StorageError> {
        if updates.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE {table} SET {pos} = ?1 WHERE id = ?2 AND {parent} = ?3",
            pos = self.scope.position_column,
            table = self.scope.table,
            parent = self.scope.parent_column,
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        for update in updates {
            let changed = stmt.execute(params![update.position, update.id, self.container_id])?;
            if changed != 1 {
                return Err(StorageError::Conflict(format!(
                    "{} {} left container {} mid-update",
                    self.scope.table, update.id, self.container_id
                )));
            }
        }
        Ok(())
    }

    fn insert(&mut self, position: i64, payload: &SiblingPayload) -> Result<i64, StorageError> {
        let known = table_columns(self.conn, self.scope.table)?;
        let mut columns: Vec<&str> = Vec::with_capacity(payload.fields.len() + 2);
        let mut values: Vec<&FieldValue> = Vec::with_capacity(payload.fields.len() + 2);

        for (column, value) in &payload.fields {
            ensure_identifier(column)?;
            if self.scope.is_managed_column(column) {
                return Err(StorageError::InvalidInput(format!(
                    "column '{}' is set by the ordering service",
                    column
                )));
            }
            if !known.iter().any(|k| k == column) {
                return Err(StorageError::InvalidInput(format!(
                    "{} has no column '{}'",
                    self.scope.table, column
                )));
            }
            columns.push(column);
            values.push(value);
        }

        let container = FieldValue::Integer(self.container_id);
        let position = FieldValue::Integer(position);
        columns.push(self.scope.parent_column);
        values.push(&container);
        columns.push(self.scope.position_column);
        values.push(&position);

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.scope.table,
            columns.join(", "),
            placeholders(columns.len())
        );
        self.conn.execute(&sql, params_from_iter(values))?;
        Ok(self.conn.last_insert_rowid())
    }

    fn remove(&mut self, id: i64) -> Result<(), StorageError> {
        let sql = format!(
            "DELETE FROM {} WHERE id = ?1 AND {} = ?2",
            self.scope.table, self.scope.parent_column
        );
        let changed = self.conn.execute(&sql, params![id, self.container_id])?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("{} {}", self.scope.table, id)));
        }
        Ok(())
    }
}
