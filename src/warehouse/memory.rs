//! In-process warehouse engine.
//!
//! Tables live in a map guarded by a tokio `RwLock`. Every write operation
//! holds the write lock for its whole duration, which makes a merge atomic
//! with respect to other readers and writers.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::WarehouseError;

use super::query::{ConflictAction, JoinSide, JoinSpec, MergeReport, MergeSpec, Predicate, Query};
use super::types::{ConnectionId, Frame, TableRef, Value};
use super::{check_conflict_keys, validate_merge, Warehouse};

/// Warehouse engine holding all tables in memory.
pub struct MemoryWarehouse {
    conn: ConnectionId,
    tables: RwLock<HashMap<String, Frame>>,
}

impl MemoryWarehouse {
    /// Creates an empty warehouse serving `conn`.
    pub fn new(conn: impl Into<ConnectionId>) -> Self {
        Self {
            conn: conn.into(),
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Names of all tables currently stored, sorted.
    pub async fn table_names(&self) -> Vec<String> {
        let tables = self.tables.read().await;
        let mut names: Vec<String> = tables.keys().cloned().collect();
        names.sort();
        names
    }

    fn lookup<'a>(
        tables: &'a HashMap<String, Frame>,
        table: &TableRef,
    ) -> Result<&'a Frame, WarehouseError> {
        let name = table.physical_name();
        tables
            .get(&name)
            .ok_or(WarehouseError::TableNotFound(name))
    }

    fn filter(input: &Frame, input_name: &str, predicate: &Predicate) -> Result<Frame, WarehouseError> {
        let idx = input
            .column_index(&predicate.column)
            .ok_or_else(|| WarehouseError::ColumnNotFound {
                table: input_name.to_string(),
                column: predicate.column.clone(),
            })?;

        let mut out = Frame::new(input.columns().iter().cloned());
        for row in input.rows() {
            let keep = predicate
                .matches(&row[idx])
                .map_err(|reason| WarehouseError::TypeMismatch {
                    table: input_name.to_string(),
                    column: predicate.column.clone(),
                    reason,
                })?;
            if keep {
                out.push_row(row.clone())
                    .map_err(|e| WarehouseError::InvalidTable {
                        table: input_name.to_string(),
                        reason: e.to_string(),
                    })?;
            }
        }
        Ok(out)
    }

    fn join(
        left: &Frame,
        left_name: &str,
        right: &Frame,
        right_name: &str,
        spec: &JoinSpec,
    ) -> Result<Frame, WarehouseError> {
        let missing = |table: &str, column: &str| WarehouseError::ColumnNotFound {
            table: table.to_string(),
            column: column.to_string(),
        };

        let left_key = left
            .column_index(&spec.left_key)
            .ok_or_else(|| missing(left_name, &spec.left_key))?;
        let right_key = right
            .column_index(&spec.right_key)
            .ok_or_else(|| missing(right_name, &spec.right_key))?;

        let mut picks = Vec::with_capacity(spec.projection.len());
        for proj in &spec.projection {
            let idx = match proj.side {
                JoinSide::Left => left
                    .column_index(&proj.column)
                    .ok_or_else(|| missing(left_name, &proj.column))?,
                JoinSide::Right => right
                    .column_index(&proj.column)
                    .ok_or_else(|| missing(right_name, &proj.column))?,
            };
            picks.push((proj.side, idx));
        }

        let mut out = Frame::new(spec.projection.iter().map(|p| p.column.clone()));
        for l in left.rows() {
            for r in right.rows() {
                if !l[left_key].sql_eq(&r[right_key]) {
                    continue;
                }
                let row = picks
                    .iter()
                    .map(|(side, idx)| match side {
                        JoinSide::Left => l[*idx].clone(),
                        JoinSide::Right => r[*idx].clone(),
                    })
                    .collect();
                out.push_row(row).map_err(|e| WarehouseError::InvalidTable {
                    table: left_name.to_string(),
                    reason: e.to_string(),
                })?;
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    fn connection(&self) -> &ConnectionId {
        &self.conn
    }

    async fn load(&self, frame: &Frame, output: &TableRef) -> Result<TableRef, WarehouseError> {
        self.check_connection(output)?;
        let mut tables = self.tables.write().await;
        tables.insert(output.physical_name(), frame.clone());
        debug!(table = %output, rows = frame.len(), "Loaded table");
        Ok(output.clone())
    }

    async fn execute(&self, query: &Query, output: &TableRef) -> Result<TableRef, WarehouseError> {
        self.check_connection(output)?;
        for input in query.inputs() {
            self.check_connection(input)?;
        }

        let mut tables = self.tables.write().await;
        let result = match query {
            Query::Filter { input, predicate } => {
                let frame = Self::lookup(&tables, input)?;
                Self::filter(frame, &input.physical_name(), predicate)?
            }
            Query::Join { left, right, spec } => {
                let l = Self::lookup(&tables, left)?;
                let r = Self::lookup(&tables, right)?;
                Self::join(l, &left.physical_name(), r, &right.physical_name(), spec)?
            }
        };

        debug!(table = %output, rows = result.len(), "Executed query");
        tables.insert(output.physical_name(), result);
        Ok(output.clone())
    }

    async fn merge(
        &self,
        source: &TableRef,
        target: &TableRef,
        spec: &MergeSpec,
    ) -> Result<MergeReport, WarehouseError> {
        self.check_connection(source)?;
        self.check_connection(target)?;

        let mut tables = self.tables.write().await;
        let source_frame = Self::lookup(&tables, source)?.clone();
        let target_name = target.physical_name();
        let mut target_frame = Self::lookup(&tables, target)?.clone();

        validate_merge(
            &source.physical_name(),
            source_frame.columns(),
            &target_name,
            target_frame.columns(),
            spec,
        )?;
        check_conflict_keys(&source.physical_name(), &source_frame, spec)?;

        // Column positions, resolved once. Validation guarantees they exist.
        let key_pos: Vec<(usize, usize)> = spec
            .conflict_columns
            .iter()
            .filter_map(|c| Some((source_frame.column_index(c)?, target_frame.column_index(c)?)))
            .collect();
        let update_pos: Vec<(usize, usize)> = spec
            .update_columns
            .iter()
            .filter_map(|c| Some((source_frame.column_index(c)?, target_frame.column_index(c)?)))
            .collect();
        let insert_pos: Vec<Option<usize>> = target_frame
            .columns()
            .iter()
            .map(|c| source_frame.column_index(c))
            .collect();

        let mut report = MergeReport::default();
        for src in source_frame.rows() {
            let mut matched = false;
            let mut changed = false;
            for tgt in target_frame.rows_mut() {
                if !key_pos.iter().all(|(s, t)| src[*s].sql_eq(&tgt[*t])) {
                    continue;
                }
                matched = true;
                if spec.on_conflict == ConflictAction::Ignore {
                    continue;
                }
                for (s, t) in &update_pos {
                    if tgt[*t] != src[*s] {
                        tgt[*t] = src[*s].clone();
                        changed = true;
                    }
                }
            }

            if !matched {
                let row: Vec<Value> = insert_pos
                    .iter()
                    .map(|pos| pos.map(|i| src[i].clone()).unwrap_or(Value::Null))
                    .collect();
                target_frame
                    .push_row(row)
                    .map_err(|e| WarehouseError::InvalidTable {
                        table: target_name.clone(),
                        reason: e.to_string(),
                    })?;
                report.inserted += 1;
            } else if changed {
                report.updated += 1;
            } else {
                report.unchanged += 1;
            }
        }

        tables.insert(target_name, target_frame);
        debug!(
            source = %source,
            target = %target,
            inserted = report.inserted,
            updated = report.updated,
            "Merged tables"
        );
        Ok(report)
    }

    async fn materialize(&self, table: &TableRef) -> Result<Frame, WarehouseError> {
        self.check_connection(table)?;
        let tables = self.tables.read().await;
        Self::lookup(&tables, table).cloned()
    }

    async fn drop_table(&self, table: &TableRef) -> Result<bool, WarehouseError> {
        self.check_connection(table)?;
        let mut tables = self.tables.write().await;
        Ok(tables.remove(&table.physical_name()).is_some())
    }

    async fn table_exists(&self, table: &TableRef) -> Result<bool, WarehouseError> {
        self.check_connection(table)?;
        let tables = self.tables.read().await;
        Ok(tables.contains_key(&table.physical_name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::warehouse::query::Projection;

    const CONN: &str = "snowflake_default";

    fn orders() -> Frame {
        Frame::from_rows(
            ["order_id", "customer_id", "purchase_date", "amount", "type"],
            vec![
                vec![1.into(), 9.into(), "2023-01-05".into(), 200.into(), "online".into()],
                vec![2.into(), 9.into(), "2023-01-06".into(), 100.into(), "store".into()],
                vec![3.into(), 7.into(), "2023-01-07".into(), 300.into(), "online".into()],
                vec![4.into(), 9.into(), "2023-01-08".into(), Value::Null, "store".into()],
            ],
        )
        .unwrap()
    }

    fn customers() -> Frame {
        Frame::from_rows(
            ["customer_id", "customer_name"],
            vec![
                vec![9.into(), "Alice".into()],
                vec![5.into(), "Bob".into()],
            ],
        )
        .unwrap()
    }

    fn join_spec() -> JoinSpec {
        JoinSpec::on("customer_id")
            .project(Projection::right("customer_id"))
            .project(Projection::right("customer_name"))
            .project(Projection::left("order_id"))
            .project(Projection::left("amount"))
    }

    #[tokio::test]
    async fn test_filter_drops_rows_at_or_below_threshold() {
        let wh = MemoryWarehouse::new(CONN);
        let input = TableRef::named("orders", CONN);
        let output = TableRef::named("filtered", CONN);
        wh.load(&orders(), &input).await.unwrap();

        let query = Query::Filter {
            input,
            predicate: Predicate::greater_than("amount", 150i64),
        };
        wh.execute(&query, &output).await.unwrap();

        let filtered = wh.materialize(&output).await.unwrap();
        assert_eq!(filtered.column("order_id"), Some(vec![Value::Int(1), Value::Int(3)]));
        for amount in filtered.column("amount").unwrap() {
            assert!(amount.as_f64().unwrap() > 150.0);
        }
    }

    #[tokio::test]
    async fn test_filter_missing_column_is_schema_mismatch() {
        let wh = MemoryWarehouse::new(CONN);
        let input = TableRef::named("customers", CONN);
        wh.load(&customers(), &input).await.unwrap();

        let query = Query::Filter {
            input,
            predicate: Predicate::greater_than("amount", 150i64),
        };
        let err = wh
            .execute(&query, &TableRef::named("out", CONN))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
    }

    #[tokio::test]
    async fn test_filter_missing_table_is_source_unavailable() {
        let wh = MemoryWarehouse::new(CONN);
        let query = Query::Filter {
            input: TableRef::named("nope", CONN),
            predicate: Predicate::greater_than("amount", 150i64),
        };
        let err = wh
            .execute(&query, &TableRef::named("out", CONN))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
    }

    #[tokio::test]
    async fn test_inner_join_drops_unmatched() {
        let wh = MemoryWarehouse::new(CONN);
        let left = TableRef::named("orders", CONN);
        let right = TableRef::named("customers", CONN);
        let out = TableRef::named("joined", CONN);
        wh.load(&orders(), &left).await.unwrap();
        wh.load(&customers(), &right).await.unwrap();

        let query = Query::Join {
            left,
            right,
            spec: join_spec(),
        };
        wh.execute(&query, &out).await.unwrap();

        let joined = wh.materialize(&out).await.unwrap();
        assert_eq!(
            joined.columns(),
            &["customer_id", "customer_name", "order_id", "amount"]
        );
        assert_eq!(joined.len(), 3);
        for id in joined.column("customer_id").unwrap() {
            assert_eq!(id, Value::Int(9));
        }
    }

    #[tokio::test]
    async fn test_join_missing_key_is_schema_mismatch() {
        let wh = MemoryWarehouse::new(CONN);
        let left = TableRef::named("orders", CONN);
        let right = TableRef::named("customers", CONN);
        wh.load(&orders(), &left).await.unwrap();
        wh.load(&customers(), &right).await.unwrap();

        let query = Query::Join {
            left,
            right,
            spec: JoinSpec::on("client_id"),
        };
        let err = wh
            .execute(&query, &TableRef::named("joined", CONN))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
    }

    #[tokio::test]
    async fn test_merge_upsert_and_idempotence() {
        let wh = MemoryWarehouse::new(CONN);
        let source = TableRef::named("joined", CONN);
        let target = TableRef::named("reporting", CONN);
        let src = Frame::from_rows(
            ["customer_id", "customer_name", "order_id", "amount"],
            vec![
                vec![9.into(), "Alice".into(), 1.into(), 200.into()],
                vec![9.into(), "Alice".into(), 3.into(), 300.into()],
            ],
        )
        .unwrap();
        let tgt = Frame::from_rows(
            ["customer_id", "customer_name", "order_id", "amount"],
            vec![vec![8.into(), "Old".into(), 1.into(), 999.into()]],
        )
        .unwrap();
        wh.load(&src, &source).await.unwrap();
        wh.load(&tgt, &target).await.unwrap();

        let spec = MergeSpec::new(["order_id"]).with_update_columns(["customer_id", "customer_name"]);
        let first = wh.merge(&source, &target, &spec).await.unwrap();
        assert_eq!(first.inserted, 1);
        assert_eq!(first.updated, 1);

        let after_first = wh.materialize(&target).await.unwrap();
        assert_eq!(after_first.get(0, "customer_name"), Some(&Value::from("Alice")));
        assert_eq!(after_first.get(0, "customer_id"), Some(&Value::Int(9)));
        // Not an update column: untouched.
        assert_eq!(after_first.get(0, "amount"), Some(&Value::Int(999)));

        let second = wh.merge(&source, &target, &spec).await.unwrap();
        assert!(second.is_noop());
        assert_eq!(second.unchanged, 2);
        assert_eq!(wh.materialize(&target).await.unwrap(), after_first);
    }

    #[tokio::test]
    async fn test_merge_ignore_keeps_existing_rows() {
        let wh = MemoryWarehouse::new(CONN);
        let source = TableRef::named("joined", CONN);
        let target = TableRef::named("reporting", CONN);
        let src = Frame::from_rows(
            ["customer_name", "order_id"],
            vec![vec!["Alice".into(), 1.into()]],
        )
        .unwrap();
        let tgt = Frame::from_rows(
            ["customer_name", "order_id"],
            vec![vec!["Old".into(), 1.into()]],
        )
        .unwrap();
        wh.load(&src, &source).await.unwrap();
        wh.load(&tgt, &target).await.unwrap();

        let spec = MergeSpec::new(["order_id"])
            .with_update_columns(["customer_name"])
            .with_conflict_action(ConflictAction::Ignore);
        let report = wh.merge(&source, &target, &spec).await.unwrap();
        assert_eq!(report.unchanged, 1);
        let out = wh.materialize(&target).await.unwrap();
        assert_eq!(out.get(0, "customer_name"), Some(&Value::from("Old")));
    }

    #[tokio::test]
    async fn test_merge_without_conflict_key_in_target() {
        let wh = MemoryWarehouse::new(CONN);
        let source = TableRef::named("joined", CONN);
        let target = TableRef::named("reporting", CONN);
        wh.load(&Frame::new(["order_id"]), &source).await.unwrap();
        wh.load(&Frame::new(["customer_id"]), &target).await.unwrap();

        let err = wh
            .merge(&source, &target, &MergeSpec::new(["order_id"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConflictKeyViolation);
    }

    #[tokio::test]
    async fn test_merge_rejects_null_conflict_key() {
        let wh = MemoryWarehouse::new(CONN);
        let source = TableRef::named("joined", CONN);
        let target = TableRef::named("reporting", CONN);
        let rows = vec![
            vec![1.into(), "Alice".into()],
            vec![Value::Null, "Bob".into()],
        ];
        wh.load(&Frame::from_rows(["order_id", "customer_name"], rows).unwrap(), &source)
            .await
            .unwrap();
        let existing = Frame::from_rows(
            ["order_id", "customer_name"],
            vec![vec![7.into(), "Carol".into()]],
        )
        .unwrap();
        wh.load(&existing, &target).await.unwrap();

        let spec = MergeSpec::new(["order_id"]).with_update_columns(["customer_name"]);
        for _ in 0..2 {
            let err = wh.merge(&source, &target, &spec).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ConflictKeyViolation);
        }
        assert_eq!(wh.materialize(&target).await.unwrap(), existing);
    }

    #[tokio::test]
    async fn test_drop_and_connection_checks() {
        let wh = MemoryWarehouse::new(CONN);
        let table = TableRef::named("orders", CONN);
        wh.load(&orders(), &table).await.unwrap();
        assert!(wh.table_exists(&table).await.unwrap());
        assert!(wh.drop_table(&table).await.unwrap());
        assert!(!wh.drop_table(&table).await.unwrap());
        assert!(wh.table_names().await.is_empty());

        let foreign = TableRef::named("orders", "postgres_default");
        let err = wh.table_exists(&foreign).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connectivity);
    }
}
