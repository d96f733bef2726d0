//! Core warehouse types: connections, table and file references, values and
//! the in-memory tabular structure returned by `materialize`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::StageId;

/// Identity of a warehouse or object-store connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Creates a connection identity from its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the connection name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Reference to a relation in the warehouse.
///
/// Named tables are persistent and owned externally. Ephemeral tables are
/// created by a stage of one run and owned by that run; their physical name
/// is derived from the run id and the producing stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TableRef {
    Named {
        name: String,
        conn: ConnectionId,
    },
    Ephemeral {
        run_id: Uuid,
        stage: StageId,
        conn: ConnectionId,
    },
}

impl TableRef {
    /// Creates a reference to a persistent, externally owned table.
    pub fn named(name: impl Into<String>, conn: impl Into<ConnectionId>) -> Self {
        TableRef::Named {
            name: name.into(),
            conn: conn.into(),
        }
    }

    /// Creates a reference to a run-owned table produced by `stage`.
    pub fn ephemeral(run_id: Uuid, stage: StageId, conn: impl Into<ConnectionId>) -> Self {
        TableRef::Ephemeral {
            run_id,
            stage,
            conn: conn.into(),
        }
    }

    /// Returns the name the table has inside the warehouse.
    pub fn physical_name(&self) -> String {
        match self {
            TableRef::Named { name, .. } => name.clone(),
            TableRef::Ephemeral { run_id, stage, .. } => {
                format!("_tmp_{}_{}", run_id.simple(), stage.index())
            }
        }
    }

    /// Returns the connection this table lives on.
    pub fn connection(&self) -> &ConnectionId {
        match self {
            TableRef::Named { conn, .. } | TableRef::Ephemeral { conn, .. } => conn,
        }
    }

    /// Returns true if the table is owned by a pipeline run.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, TableRef::Ephemeral { .. })
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.connection(), self.physical_name())
    }
}

/// Reference to a source object in external storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRef {
    pub path: String,
    pub conn: ConnectionId,
}

impl FileRef {
    pub fn new(path: impl Into<String>, conn: impl Into<ConnectionId>) -> Self {
        Self {
            path: path.into(),
            conn: conn.into(),
        }
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.path, self.conn)
    }
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Infers a value from a raw CSV field.
    ///
    /// Empty fields are null; integers and finite floats are numeric and
    /// parsed from the trimmed field. Zero-padded integers such as `007` stay
    /// text so identifiers keep their padding. Text keeps the raw field,
    /// surrounding whitespace included.
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Value::Null;
        }
        let digits = trimmed.strip_prefix(['-', '+']).unwrap_or(trimmed);
        let zero_padded = digits.len() > 1
            && digits.starts_with('0')
            && digits.bytes().all(|b| b.is_ascii_digit());
        if zero_padded {
            return Value::Text(raw.to_string());
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Value::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            if f.is_finite() {
                return Value::Float(f);
            }
        }
        Value::Text(raw.to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of the value; text is parsed and must be finite, null
    /// has none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Null => None,
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse().ok().filter(|f: &f64| f.is_finite()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// SQL equality: null never equals anything, numbers compare across
    /// integer and float representations.
    pub fn sql_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => false,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                self.as_f64() == other.as_f64()
            }
            (Value::Text(a), Value::Text(b)) => a == b,
            _ => false,
        }
    }

    /// Storage type name used when declaring warehouse columns.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Int(_) => "INTEGER",
            Value::Float(_) => "REAL",
            Value::Text(_) => "TEXT",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

/// A row whose width does not match the frame it is added to.
#[derive(Debug, Error)]
#[error("row has {actual} values but the frame has {expected} columns")]
pub struct ArityError {
    pub expected: usize,
    pub actual: usize,
}

/// Tabular in-memory structure: ordered columns and rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Frame {
    /// Creates an empty frame with the given columns.
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Creates a frame and fills it with `rows`.
    pub fn from_rows<I, S>(columns: I, rows: Vec<Vec<Value>>) -> Result<Self, ArityError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut frame = Self::new(columns);
        for row in rows {
            frame.push_row(row)?;
        }
        Ok(frame)
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), ArityError> {
        if row.len() != self.columns.len() {
            return Err(ArityError {
                expected: self.columns.len(),
                actual: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [Vec<Value>] {
        &mut self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Returns the values of one column in row order.
    pub fn column(&self, name: &str) -> Option<Vec<Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|row| row[idx].clone()).collect())
    }

    /// Returns the value at `row` in column `name`.
    pub fn get(&self, row: usize, name: &str) -> Option<&Value> {
        let idx = self.column_index(name)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    /// Declared SQL type of each column, inferred from its non-null values.
    ///
    /// A column with no non-null values gets an empty declaration, so the
    /// warehouse stores whatever is later written to it unconverted.
    pub fn column_types(&self) -> Vec<&'static str> {
        (0..self.columns.len())
            .map(|idx| {
                let mut declared = "";
                let mut seen_int = false;
                for row in &self.rows {
                    match &row[idx] {
                        Value::Null => continue,
                        Value::Int(_) => seen_int = true,
                        Value::Float(_) => declared = "REAL",
                        Value::Text(_) => return "TEXT",
                    }
                }
                if declared == "REAL" {
                    "REAL"
                } else if seen_int {
                    "INTEGER"
                } else {
                    declared
                }
            })
            .collect()
    }
}
