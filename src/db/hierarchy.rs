//! Hierarchy store over SQLite
//!
//! A whole duplication runs inside one `BEGIN IMMEDIATE` transaction. Batch
//! inserts execute one cached prepared statement per row and read
//! `last_insert_rowid()` after each, which keeps returned ids in exactly the
//! order the rows were submitted.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};

use crate::duplication::{HierarchyStore, HierarchyTx, NewAttachmentCopy, NodeSelector, SourceNode};
use crate::error::StorageError;
use crate::field::FieldValue;

use super::sql::{ensure_identifier, placeholders, table_columns};
use super::CurriculumDb;

impl HierarchyStore for CurriculumDb {
    fn transaction<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut dyn HierarchyTx) -> Result<T, StorageError>,
    {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = {
                let mut hierarchy = SqliteHierarchyTx { conn: &tx };
                f(&mut hierarchy)?
            };
            tx.commit()?;
            Ok(value)
        })
    }
}

struct SqliteHierarchyTx<'a> {
    conn: &'a Connection,
}

/// WHERE clause and bound ids for a selector
fn selector_filter(selector: &NodeSelector<'_>) -> Result<(String, String, Vec<i64>), StorageError> {
    match selector {
        NodeSelector::Ids(ids) => Ok((
            "NULL".to_string(),
            format!("id IN ({})", placeholders(ids.len())),
            ids.to_vec(),
        )),
        NodeSelector::Children {
            parent_column,
            parent_ids,
        } => {
            ensure_identifier(parent_column)?;
            Ok((
                parent_column.to_string(),
                format!("{} IN ({})", parent_column, placeholders(parent_ids.len())),
                parent_ids.to_vec(),
            ))
        }
    }
}

fn selector_is_empty(selector: &NodeSelector<'_>) -> bool {
    match selector {
        NodeSelector::Ids(ids) => ids.is_empty(),
        NodeSelector::Children { parent_ids, .. } => parent_ids.is_empty(),
    }
}

impl HierarchyTx for SqliteHierarchyTx<'_> {
    fn find_duplicate(
        &mut self,
        source_root_id: i64,
        actor_id: &str,
    ) -> Result<Option<i64>, StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT duplicate_root_id FROM duplication_records
             WHERE source_root_id = ?1 AND actor_id = ?2",
        )?;
        let existing = stmt
            .query_row(params![source_root_id, actor_id], |row| row.get(0))
            .optional()?;
        Ok(existing)
    }

    fn record_duplicate(
        &mut self,
        source_root_id: i64,
        actor_id: &str,
        duplicate_root_id: i64,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO duplication_records (source_root_id, actor_id, duplicate_root_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                source_root_id,
                actor_id,
                duplicate_root_id,
                chrono::Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn table_columns(&mut self, table: &str) -> Result<Vec<String>, StorageError> {
        table_columns(self.conn, table)
    }

    fn load_nodes(
        &mut self,
        table: &str,
        selector: NodeSelector<'_>,
        columns: &[String],
        order_by: Option<&str>,
    ) -> Result<Vec<SourceNode>, StorageError> {
        if selector_is_empty(&selector) {
            return Ok(Vec::new());
        }
        ensure_identifier(table)?;
        for column in columns {
            ensure_identifier(column)?;
        }

        let (parent_expr, filter, ids) = selector_filter(&selector)?;
        let mut order = Vec::new();
        if parent_expr != "NULL" {
            order.push(parent_expr.clone());
        }
        if let Some(position) = order_by {
            ensure_identifier(position)?;
            order.push(position.to_string());
        }
        order.push("id".to_string());

        let mut select = vec!["id".to_string(), parent_expr];
        select.extend(columns.iter().cloned());

        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {}",
            select.join(", "),
            table,
            filter,
            order.join(", ")
        );

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let nodes = stmt
            .query_map(params_from_iter(ids.iter()), |row| {
                let values = (0..columns.len())
                    .map(|i| row.get_ref(i + 2).map(FieldValue::from))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(SourceNode {
                    id: row.get(0)?,
                    parent_id: row.get(1)?,
                    values,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(nodes)
    }

    fn count_nodes(&mut self, table: &str, selector: NodeSelector<'_>) -> Result<u64, StorageError> {
        if selector_is_empty(&selector) {
            return Ok(0);
        }
        ensure_identifier(table)?;
        let (_, filter, ids) = selector_filter(&selector)?;
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", table, filter);
        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(ids.iter()), |row| row.get(0))?;
        Ok(count as u64)
    }

    fn insert_nodes(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[Vec<FieldValue>],
    ) -> Result<Vec<i64>, StorageError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        ensure_identifier(table)?;
        for column in columns {
            ensure_identifier(column)?;
        }

        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", table)
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                columns.join(", "),
                placeholders(columns.len())
            )
        };

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            if row.len() != columns.len() {
                return Err(StorageError::Internal(format!(
                    "{} row has {} values for {} columns",
                    table,
                    row.len(),
                    columns.len()
                )));
            }
            stmt.execute(params_from_iter(row.iter()))?;
            ids.push(self.conn.last_insert_rowid());
        }
        Ok(ids)
    }

    fn enqueue_attachment_copies(&mut self, tasks: &[NewAttachmentCopy]) -> Result<(), StorageError> {
        if tasks.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().to_rfc3339();
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO attachment_copy_tasks (
                root_id, entity_table, entity_id, broken_column,
                source_location, dest_location, state, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7)",
        )?;
        for task in tasks {
            ensure_identifier(&task.entity_table)?;
            ensure_identifier(&task.broken_column)?;
            stmt.execute(params![
                task.root_id,
                task.entity_table,
                task.entity_id,
                task.broken_column,
                task.source_location,
                task.dest_location,
                now,
            ])?;
        }
        Ok(())
    }
}
