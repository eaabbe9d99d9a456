//! Error types for elohim-curriculum

use rusqlite::ffi;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Attachment copy failed: {0}")]
    Attachment(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure taxonomy used by the job coordinator and operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input or missing source; rejected immediately, never retried.
    Validation,
    /// Concurrent modification, lock contention, timeouts; retried with backoff.
    Conflict,
    /// Recursion ceiling exceeded or cyclic data; terminal, needs an operator.
    Integrity,
    /// Row duplication committed but an attachment could not be copied.
    PartialResource,
    /// Anything else; terminal.
    Internal,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Conflict => "conflict",
            ErrorClass::Integrity => "integrity",
            ErrorClass::PartialResource => "partial_resource",
            ErrorClass::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StorageError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StorageError::NotFound(_) | StorageError::InvalidInput(_) => ErrorClass::Validation,
            StorageError::Conflict(_) | StorageError::Timeout(_) | StorageError::Io(_) => {
                ErrorClass::Conflict
            }
            StorageError::Integrity(_) => ErrorClass::Integrity,
            StorageError::Attachment(_) => ErrorClass::PartialResource,
            StorageError::Json(_)
            | StorageError::Database(_)
            | StorageError::Config(_)
            | StorageError::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Whether running the same operation again may succeed.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Conflict
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref failure, _) = e {
            match failure.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    return StorageError::Conflict(e.to_string());
                }
                rusqlite::ErrorCode::ConstraintViolation
                    if failure.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                        || failure.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
                {
                    return StorageError::Conflict(e.to_string());
                }
                _ => {}
            }
        }
        StorageError::Database(e)
    }
}
