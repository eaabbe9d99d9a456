//! Shared SQL helpers for the store adapters

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{Connection, ToSql};

use crate::error::StorageError;
use crate::field::{is_identifier, FieldValue};

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            FieldValue::Null => ToSqlOutput::Owned(Value::Null),
            FieldValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            FieldValue::Real(r) => ToSqlOutput::Owned(Value::Real(*r)),
            FieldValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            FieldValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl From<ValueRef<'_>> for FieldValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => FieldValue::Null,
            ValueRef::Integer(i) => FieldValue::Integer(i),
            ValueRef::Real(r) => FieldValue::Real(r),
            ValueRef::Text(t) => FieldValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => FieldValue::Blob(b.to_vec()),
        }
    }
}

/// Reject anything that is not a plain identifier before it is spliced into SQL
pub(crate) fn ensure_identifier(name: &str) -> Result<(), StorageError> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(StorageError::InvalidInput(format!("invalid identifier '{}'", name)))
    }
}

/// Column names of `table`, in declaration order
pub(crate) fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, StorageError> {
    ensure_identifier(table)?;
    let mut stmt = conn.prepare_cached(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>("name"))?
        .collect::<Result<Vec<_>, _>>()?;
    if columns.is_empty() {
        return Err(StorageError::Config(format!("unknown table '{}'", table)));
    }
    Ok(columns)
}

/// `?1, ?2, ..., ?n`
pub(crate) fn placeholders(n: usize) -> String {
    (1..=n)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}
