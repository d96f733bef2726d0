//! SQLite-backed warehouse engine.
//!
//! Tables are ordinary SQLite tables. Queries are rendered from [`Query`]
//! objects with quoted identifiers and bound values, never by splicing
//! values into SQL text. Every write runs inside one transaction.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::query::Query as SqlxQuery;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, TypeInfo, ValueRef};
use tracing::{debug, info};

use crate::error::WarehouseError;

use super::query::{
    quote_identifier, ConflictAction, JoinSide, MergeReport, MergeSpec, Predicate, Query,
};
use super::types::{ConnectionId, Frame, TableRef, Value};
use super::{check_conflict_keys, validate_merge, Warehouse};

type Statement<'q> = SqlxQuery<'q, Sqlite, SqliteArguments<'q>>;

/// Warehouse engine storing tables in a SQLite database.
#[derive(Clone)]
pub struct SqliteWarehouse {
    conn: ConnectionId,
    pool: SqlitePool,
}

impl SqliteWarehouse {
    /// Opens (creating if missing) the database at `url` and serves it as
    /// connection `conn`.
    ///
    /// `url` uses sqlx syntax, e.g. `sqlite://warehouse.db` or
    /// `sqlite::memory:`. In-memory databases use a single pooled connection
    /// so every query sees the same tables.
    pub async fn open(url: &str, conn: impl Into<ConnectionId>) -> Result<Self, WarehouseError> {
        let opts = SqliteConnectOptions::from_str(url)
            .map_err(|e| WarehouseError::ConnectionFailed(format!("{}: {}", url, e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let max_connections = if url.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await
            .map_err(|e| WarehouseError::ConnectionFailed(e.to_string()))?;

        let conn = conn.into();
        info!(url = url, conn = %conn, "Warehouse opened");
        Ok(Self { conn, pool })
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: SqlitePool, conn: impl Into<ConnectionId>) -> Self {
        Self {
            conn: conn.into(),
            pool,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Column names of `name` in declaration order; empty if it does not exist.
    async fn columns_of(
        executor: &mut SqliteConnection,
        name: &str,
    ) -> Result<Vec<String>, WarehouseError> {
        let rows = sqlx::query("SELECT name FROM pragma_table_info(?1) ORDER BY cid")
            .bind(name)
            .fetch_all(executor)
            .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("name")).collect())
    }

    /// Like [`Self::columns_of`] but a missing table is an error.
    async fn require_columns(
        executor: &mut SqliteConnection,
        name: &str,
    ) -> Result<Vec<String>, WarehouseError> {
        let columns = Self::columns_of(executor, name).await?;
        if columns.is_empty() {
            return Err(WarehouseError::TableNotFound(name.to_string()));
        }
        Ok(columns)
    }

    fn require_column(columns: &[String], table: &str, column: &str) -> Result<(), WarehouseError> {
        if columns.iter().any(|c| c == column) {
            Ok(())
        } else {
            Err(WarehouseError::ColumnNotFound {
                table: table.to_string(),
                column: column.to_string(),
            })
        }
    }

    /// Checks that every text cell of the predicate column reads as a number.
    ///
    /// A column declared TEXT would otherwise compare against a numeric
    /// operand as a string, so `'99' > '150'` would hold.
    async fn require_numeric(
        executor: &mut SqliteConnection,
        name: &str,
        predicate: &Predicate,
    ) -> Result<(), WarehouseError> {
        let column = quote_identifier(&predicate.column);
        let sql = format!(
            "SELECT {} FROM {} WHERE typeof({}) IN ('text', 'blob') ORDER BY rowid",
            column,
            quote_identifier(name),
            column
        );
        let rows = sqlx::query(&sql).fetch_all(&mut *executor).await?;
        for row in &rows {
            if let Some(cell) = decode_row(row)?.into_iter().next() {
                predicate
                    .matches(&cell)
                    .map_err(|reason| WarehouseError::TypeMismatch {
                        table: name.to_string(),
                        column: predicate.column.clone(),
                        reason,
                    })?;
            }
        }
        Ok(())
    }

    /// Renders `query` as the SELECT producing its rows, plus bound values.
    async fn render(
        executor: &mut SqliteConnection,
        query: &Query,
    ) -> Result<(String, Vec<Value>), WarehouseError> {
        match query {
            Query::Filter { input, predicate } => {
                let name = input.physical_name();
                let columns = Self::require_columns(executor, &name).await?;
                Self::require_column(&columns, &name, &predicate.column)?;

                let column = quote_identifier(&predicate.column);
                let operand = if matches!(predicate.value, Value::Int(_) | Value::Float(_)) {
                    Self::require_numeric(executor, &name, predicate).await?;
                    format!("CAST({} AS REAL)", column)
                } else {
                    column
                };
                let sql = format!(
                    "SELECT * FROM {} WHERE {} {} ? ORDER BY rowid",
                    quote_identifier(&name),
                    operand,
                    predicate.op.as_sql()
                );
                Ok((sql, vec![predicate.value.clone()]))
            }
            Query::Join { left, right, spec } => {
                let left_name = left.physical_name();
                let right_name = right.physical_name();
                let left_cols = Self::require_columns(executor, &left_name).await?;
                let right_cols = Self::require_columns(executor, &right_name).await?;
                Self::require_column(&left_cols, &left_name, &spec.left_key)?;
                Self::require_column(&right_cols, &right_name, &spec.right_key)?;

                let mut select = Vec::with_capacity(spec.projection.len());
                for proj in &spec.projection {
                    let (alias, table, cols) = match proj.side {
                        JoinSide::Left => ("l", &left_name, &left_cols),
                        JoinSide::Right => ("r", &right_name, &right_cols),
                    };
                    Self::require_column(cols, table, &proj.column)?;
                    select.push(format!(
                        "{}.{} AS {}",
                        alias,
                        quote_identifier(&proj.column),
                        quote_identifier(&proj.column)
                    ));
                }
                if select.is_empty() {
                    select.push("l.*".to_string());
                }

                let sql = format!(
                    "SELECT {} FROM {} AS l JOIN {} AS r ON l.{} = r.{} ORDER BY l.rowid, r.rowid",
                    select.join(", "),
                    quote_identifier(&left_name),
                    quote_identifier(&right_name),
                    quote_identifier(&spec.left_key),
                    quote_identifier(&spec.right_key)
                );
                Ok((sql, Vec::new()))
            }
        }
    }

    async fn fetch_frame(
        executor: &mut SqliteConnection,
        name: &str,
    ) -> Result<Frame, WarehouseError> {
        let columns = Self::require_columns(executor, name).await?;
        let select = columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM {} ORDER BY rowid",
            select,
            quote_identifier(name)
        );
        let rows = sqlx::query(&sql).fetch_all(&mut *executor).await?;

        let mut frame = Frame::new(columns);
        for row in &rows {
            frame
                .push_row(decode_row(row)?)
                .map_err(|e| WarehouseError::InvalidTable {
                    table: name.to_string(),
                    reason: e.to_string(),
                })?;
        }
        Ok(frame)
    }
}

/// Binds one value to a statement.
fn bind_value<'q>(statement: Statement<'q>, value: &Value) -> Statement<'q> {
    match value {
        Value::Null => statement.bind(Option::<String>::None),
        Value::Int(i) => statement.bind(*i),
        Value::Float(f) => statement.bind(*f),
        Value::Text(s) => statement.bind(s.clone()),
    }
}

/// Decodes a row by the storage class of each value.
fn decode_row(row: &SqliteRow) -> Result<Vec<Value>, WarehouseError> {
    let mut values = Vec::with_capacity(row.len());
    for idx in 0..row.len() {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            values.push(Value::Null);
            continue;
        }
        let storage = raw.type_info().name().to_string();
        let value = match storage.as_str() {
            "INTEGER" | "BOOLEAN" => Value::Int(row.try_get::<i64, _>(idx)?),
            "REAL" => Value::Float(row.try_get::<f64, _>(idx)?),
            "BLOB" => {
                let bytes: Vec<u8> = row.try_get(idx)?;
                Value::Text(String::from_utf8_lossy(&bytes).into_owned())
            }
            _ => Value::Text(row.try_get::<String, _>(idx)?),
        };
        values.push(value);
    }
    Ok(values)
}

/// `"a" = ? AND "b" = ?` over the given columns.
fn key_clause(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("{} = ?", quote_identifier(c)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    fn connection(&self) -> &ConnectionId {
        &self.conn
    }

    async fn load(&self, frame: &Frame, output: &TableRef) -> Result<TableRef, WarehouseError> {
        self.check_connection(output)?;
        let name = output.physical_name();
        if frame.columns().is_empty() {
            return Err(WarehouseError::InvalidTable {
                table: name,
                reason: "a table needs at least one column".to_string(),
            });
        }

        let definition = frame
            .columns()
            .iter()
            .zip(frame.column_types())
            .map(|(c, t)| format!("{} {}", quote_identifier(c), t).trim_end().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; frame.columns().len()].join(", ");
        let insert_sql = format!(
            "INSERT INTO {} VALUES ({})",
            quote_identifier(&name),
            placeholders
        );

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_identifier(&name)))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "CREATE TABLE {} ({})",
            quote_identifier(&name),
            definition
        ))
        .execute(&mut *tx)
        .await?;
        for row in frame.rows() {
            let mut statement = sqlx::query(&insert_sql);
            for value in row {
                statement = bind_value(statement, value);
            }
            statement.execute(&mut *tx).await?;
        }
        tx.commit().await?;

        debug!(table = %output, rows = frame.len(), "Loaded table");
        Ok(output.clone())
    }

    async fn execute(&self, query: &Query, output: &TableRef) -> Result<TableRef, WarehouseError> {
        self.check_connection(output)?;
        for input in query.inputs() {
            self.check_connection(input)?;
        }
        let name = output.physical_name();

        let mut tx = self.pool.begin().await?;
        let (select, binds) = Self::render(&mut tx, query).await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_identifier(&name)))
            .execute(&mut *tx)
            .await?;
        let create = format!("CREATE TABLE {} AS {}", quote_identifier(&name), select);
        let mut statement = sqlx::query(&create);
        for value in &binds {
            statement = bind_value(statement, value);
        }
        statement.execute(&mut *tx).await?;
        tx.commit().await?;

        debug!(table = %output, "Executed query");
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
        let source_name = source.physical_name();
        let target_name = target.physical_name();

        let mut tx = self.pool.begin().await?;
        let source_frame = Self::fetch_frame(&mut tx, &source_name).await?;
        let target_columns = Self::require_columns(&mut tx, &target_name).await?;
        validate_merge(
            &source_name,
            source_frame.columns(),
            &target_name,
            &target_columns,
            spec,
        )?;
        check_conflict_keys(&source_name, &source_frame, spec)?;

        let target_q = quote_identifier(&target_name);
        let keys = key_clause(&spec.conflict_columns);
        let count_sql = format!("SELECT COUNT(*) AS matched FROM {} WHERE {}", target_q, keys);
        let update_sql = if spec.update_columns.is_empty() {
            None
        } else {
            let set = spec
                .update_columns
                .iter()
                .map(|c| format!("{} = ?", quote_identifier(c)))
                .collect::<Vec<_>>()
                .join(", ");
            let unchanged = spec
                .update_columns
                .iter()
                .map(|c| format!("{} IS ?", quote_identifier(c)))
                .collect::<Vec<_>>()
                .join(" AND ");
            Some(format!(
                "UPDATE {} SET {} WHERE {} AND NOT ({})",
                target_q, set, keys, unchanged
            ))
        };
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            target_q,
            source_frame
                .columns()
                .iter()
                .map(|c| quote_identifier(c))
                .collect::<Vec<_>>()
                .join(", "),
            vec!["?"; source_frame.columns().len()].join(", ")
        );

        let pick = |row: &[Value], columns: &[String]| -> Vec<Value> {
            columns
                .iter()
                .filter_map(|c| source_frame.column_index(c).map(|i| row[i].clone()))
                .collect()
        };

        let mut report = MergeReport::default();
        for row in source_frame.rows() {
            let key_values = pick(row, &spec.conflict_columns);

            let mut count = sqlx::query(&count_sql);
            for value in &key_values {
                count = bind_value(count, value);
            }
            let matched: i64 = count.fetch_one(&mut *tx).await?.get("matched");

            if matched == 0 {
                let mut insert = sqlx::query(&insert_sql);
                for value in row {
                    insert = bind_value(insert, value);
                }
                insert.execute(&mut *tx).await?;
                report.inserted += 1;
                continue;
            }

            let update_sql = match (&update_sql, spec.on_conflict) {
                (Some(sql), ConflictAction::Update) => sql,
                _ => {
                    report.unchanged += 1;
                    continue;
                }
            };

            let update_values = pick(row, &spec.update_columns);
            let mut update = sqlx::query(update_sql);
            for value in update_values.iter().chain(&key_values).chain(&update_values) {
                update = bind_value(update, value);
            }
            let affected = update.execute(&mut *tx).await?.rows_affected();
            if affected > 0 {
                report.updated += 1;
            } else {
                report.unchanged += 1;
            }
        }
        tx.commit().await?;

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
        let mut conn = self.pool.acquire().await?;
        Self::fetch_frame(&mut conn, &table.physical_name()).await
    }

    async fn drop_table(&self, table: &TableRef) -> Result<bool, WarehouseError> {
        self.check_connection(table)?;
        let existed = self.table_exists(table).await?;
        if existed {
            sqlx::query(&format!(
                "DROP TABLE IF EXISTS {}",
                quote_identifier(&table.physical_name())
            ))
            .execute(&self.pool)
            .await?;
        }
        Ok(existed)
    }

    async fn table_exists(&self, table: &TableRef) -> Result<bool, WarehouseError> {
        self.check_connection(table)?;
        let row = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .bind(table.physical_name())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}
