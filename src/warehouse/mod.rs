//! Warehouse query engines.
//!
//! The pipeline reaches the warehouse only through the [`Warehouse`] trait:
//!
//! - **load**: create a table from an in-memory [`Frame`]
//! - **execute**: compute a [`Query`] into a new table
//! - **merge**: upsert one table into another by a conflict key
//! - **materialize**: read a table back as a [`Frame`]
//! - **drop_table** / **table_exists**: lifecycle of run-owned tables
//!
//! Two engines are provided: [`MemoryWarehouse`] keeps tables in process
//! memory, [`SqliteWarehouse`] stores them in a SQLite database through sqlx.
//!
//! # Example
//!
//! ```rust,ignore
//! use customer_orders::warehouse::{MemoryWarehouse, Query, Predicate, TableRef, Warehouse};
//!
//! let warehouse = MemoryWarehouse::new("snowflake_default");
//! let orders = TableRef::named("orders", "snowflake_default");
//! warehouse.load(&frame, &orders).await?;
//!
//! let big = TableRef::named("big_orders", "snowflake_default");
//! let query = Query::Filter {
//!     input: orders,
//!     predicate: Predicate::greater_than("amount", 150i64),
//! };
//! warehouse.execute(&query, &big).await?;
//! ```

pub mod memory;
pub mod query;
pub mod sqlite;
pub mod types;

use async_trait::async_trait;

use crate::error::WarehouseError;

pub use memory::MemoryWarehouse;
pub use query::{
    quote_identifier, CompareOp, ConflictAction, JoinSide, JoinSpec, MergeReport, MergeSpec,
    Predicate, Projection, Query,
};
pub use sqlite::SqliteWarehouse;
pub use types::{ArityError, ConnectionId, FileRef, Frame, TableRef, Value};

/// A warehouse query engine bound to one connection.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Connection identity this engine serves.
    fn connection(&self) -> &ConnectionId;

    /// Creates `output` from `frame`, replacing an existing table of that name.
    async fn load(&self, frame: &Frame, output: &TableRef) -> Result<TableRef, WarehouseError>;

    /// Computes `query` into the new table `output`.
    async fn execute(&self, query: &Query, output: &TableRef) -> Result<TableRef, WarehouseError>;

    /// Upserts every row of `source` into `target` atomically.
    async fn merge(
        &self,
        source: &TableRef,
        target: &TableRef,
        spec: &MergeSpec,
    ) -> Result<MergeReport, WarehouseError>;

    /// Reads a table into memory, preserving row order.
    async fn materialize(&self, table: &TableRef) -> Result<Frame, WarehouseError>;

    /// Drops a table. Returns false if it did not exist.
    async fn drop_table(&self, table: &TableRef) -> Result<bool, WarehouseError>;

    async fn table_exists(&self, table: &TableRef) -> Result<bool, WarehouseError>;

    /// Rejects references to tables on other connections.
    fn check_connection(&self, table: &TableRef) -> Result<(), WarehouseError> {
        if table.connection() != self.connection() {
            return Err(WarehouseError::UnknownConnection {
                expected: self.connection().to_string(),
                actual: table.connection().to_string(),
            });
        }
        Ok(())
    }
}

/// Validates a merge against the source and target column sets.
///
/// Shared by both engines so they classify schema problems identically.
pub(crate) fn validate_merge(
    source_name: &str,
    source_columns: &[String],
    target_name: &str,
    target_columns: &[String],
    spec: &MergeSpec,
) -> Result<(), WarehouseError> {
    let has = |columns: &[String], name: &str| columns.iter().any(|c| c == name);

    if spec.conflict_columns.is_empty() {
        return Err(WarehouseError::InvalidTable {
            table: target_name.to_string(),
            reason: "merge requires at least one conflict column".to_string(),
        });
    }

    for column in &spec.conflict_columns {
        if !has(target_columns, column) {
            return Err(WarehouseError::ConflictKeyMissing {
                table: target_name.to_string(),
                column: column.clone(),
            });
        }
        if !has(source_columns, column) {
            return Err(WarehouseError::ColumnNotFound {
                table: source_name.to_string(),
                column: column.clone(),
            });
        }
    }

    for column in &spec.update_columns {
        if !has(source_columns, column) {
            return Err(WarehouseError::ColumnNotFound {
                table: source_name.to_string(),
                column: column.clone(),
            });
        }
    }

    for column in source_columns {
        if !has(target_columns, column) {
            return Err(WarehouseError::ColumnNotFound {
                table: target_name.to_string(),
                column: column.clone(),
            });
        }
    }

    Ok(())
}

/// Rejects source rows whose conflict key has a null component.
///
/// A null key never matches a target row, so such a row would be inserted
/// again by every merge.
pub(crate) fn check_conflict_keys(
    source_name: &str,
    source: &Frame,
    spec: &MergeSpec,
) -> Result<(), WarehouseError> {
    for column in &spec.conflict_columns {
        let Some(idx) = source.column_index(column) else {
            continue;
        };
        if let Some(row) = source.rows().iter().position(|r| r[idx].is_null()) {
            return Err(WarehouseError::NullConflictKey {
                table: source_name.to_string(),
                column: column.clone(),
                row,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_validate_merge_ok() {
        let spec = MergeSpec::new(["order_id"]).with_update_columns(["customer_name"]);
        let result = validate_merge(
            "joined",
            &cols(&["order_id", "customer_name"]),
            "reporting",
            &cols(&["order_id", "customer_name", "amount"]),
            &spec,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_validate_merge_conflict_key_missing_from_target() {
        let spec = MergeSpec::new(["order_id"]);
        let err = validate_merge(
            "joined",
            &cols(&["order_id"]),
            "reporting",
            &cols(&["customer_id"]),
            &spec,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConflictKeyViolation);
    }

    #[test]
    fn test_validate_merge_source_column_not_in_target() {
        let spec = MergeSpec::new(["order_id"]);
        let err = validate_merge(
            "joined",
            &cols(&["order_id", "extra"]),
            "reporting",
            &cols(&["order_id"]),
            &spec,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
        assert!(err.to_string().contains("extra"));
    }

    #[test]
    fn test_check_conflict_keys_rejects_null() {
        let spec = MergeSpec::new(["order_id"]);
        let source = Frame::from_rows(
            ["order_id", "customer_name"],
            vec![
                vec![Value::Int(1), Value::from("Alice")],
                vec![Value::Null, Value::from("Bob")],
            ],
        )
        .unwrap();
        let err = check_conflict_keys("joined", &source, &spec).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConflictKeyViolation);
        assert!(err.to_string().contains("row 1"));

        let clean = Frame::from_rows(["order_id"], vec![vec![Value::Int(1)]]).unwrap();
        assert!(check_conflict_keys("joined", &clean, &spec).is_ok());
    }

    #[test]
    fn test_validate_merge_requires_key() {
        let spec = MergeSpec::new(Vec::<String>::new());
        let err = validate_merge("a", &[], "b", &[], &spec).unwrap_err();
        assert!(err.to_string().contains("conflict column"));
    }
}
