//! Error types for customer-orders operations.
//!
//! Defines error types for the external collaborators the pipeline talks to:
//! - Warehouse query execution (memory and SQLite engines)
//! - Object storage reads
//! - CSV decoding of staged files
//!
//! Every error maps onto an [`ErrorKind`] so run-level failures can be
//! reported to the scheduler with a stable classification.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of run-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A source file or table does not exist.
    SourceUnavailable,
    /// An expected column is absent or has an unusable type.
    SchemaMismatch,
    /// The merge target lacks the declared conflict key.
    ConflictKeyViolation,
    /// The warehouse or object store could not be reached.
    Connectivity,
    /// A staged file could not be decoded.
    Decode,
    /// The pipeline definition or run bookkeeping is inconsistent.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::SourceUnavailable => write!(f, "source_unavailable"),
            ErrorKind::SchemaMismatch => write!(f, "schema_mismatch"),
            ErrorKind::ConflictKeyViolation => write!(f, "conflict_key_violation"),
            ErrorKind::Connectivity => write!(f, "connectivity"),
            ErrorKind::Decode => write!(f, "decode"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Errors that can occur during warehouse operations.
#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("Table '{0}' does not exist")]
    TableNotFound(String),

    #[error("Column '{column}' not found in table '{table}'")]
    ColumnNotFound { table: String, column: String },

    #[error("Conflict column '{column}' is not part of target table '{table}'")]
    ConflictKeyMissing { table: String, column: String },

    #[error("Conflict column '{column}' is null in row {row} of '{table}'")]
    NullConflictKey {
        table: String,
        column: String,
        row: usize,
    },

    #[error("Column '{column}' in table '{table}' has an incompatible value: {reason}")]
    TypeMismatch {
        table: String,
        column: String,
        reason: String,
    },

    #[error("Connection '{actual}' is not served by warehouse connection '{expected}'")]
    UnknownConnection { expected: String, actual: String },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid table data for '{table}': {reason}")]
    InvalidTable { table: String, reason: String },

    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),
}

impl WarehouseError {
    /// Returns the failure classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WarehouseError::TableNotFound(_) => ErrorKind::SourceUnavailable,
            WarehouseError::ColumnNotFound { .. } | WarehouseError::TypeMismatch { .. } => {
                ErrorKind::SchemaMismatch
            }
            WarehouseError::ConflictKeyMissing { .. } | WarehouseError::NullConflictKey { .. } => {
                ErrorKind::ConflictKeyViolation
            }
            WarehouseError::UnknownConnection { .. } | WarehouseError::ConnectionFailed(_) => {
                ErrorKind::Connectivity
            }
            WarehouseError::InvalidTable { .. } => ErrorKind::SchemaMismatch,
            WarehouseError::Query(err) => match err {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed
                | sqlx::Error::Tls(_) => ErrorKind::Connectivity,
                _ => ErrorKind::Internal,
            },
        }
    }
}

/// Errors that can occur while reading from object storage.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("Object '{0}' not found")]
    NotFound(String),

    #[error("Connection '{actual}' is not served by object store connection '{expected}'")]
    UnknownConnection { expected: String, actual: String },

    #[error("Invalid object path '{0}'")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ObjectStoreError {
    /// Returns the failure classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ObjectStoreError::NotFound(_) | ObjectStoreError::InvalidPath(_) => {
                ErrorKind::SourceUnavailable
            }
            ObjectStoreError::UnknownConnection { .. } | ObjectStoreError::Io(_) => {
                ErrorKind::Connectivity
            }
        }
    }
}

/// Errors that can occur while decoding a staged CSV file.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("File '{0}' has no header row")]
    MissingHeader(String),

    #[error("File '{path}' declares column '{column}' more than once")]
    DuplicateColumn { path: String, column: String },

    #[error("Record {record} of '{path}' has {actual} fields, header has {expected}")]
    RowWidth {
        path: String,
        record: usize,
        expected: usize,
        actual: usize,
    },

    #[error("CSV error in '{path}': {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
}

impl DecodeError {
    /// Returns the failure classification of this error.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Decode
    }
}
