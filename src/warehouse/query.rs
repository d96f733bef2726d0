//! Parameterized query objects.
//!
//! Stages never build SQL text by substitution. They describe the relation
//! they want as a [`Query`] carrying table references, column names and bound
//! values; each engine decides how to evaluate it.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::types::{TableRef, Value};

/// Comparison operator of a filter predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl CompareOp {
    /// SQL spelling of the operator.
    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
        }
    }

    fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Row predicate `column <op> value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub column: String,
    pub op: CompareOp,
    pub value: Value,
}

impl Predicate {
    pub fn new(column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// Shorthand for `column > value`.
    pub fn greater_than(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, CompareOp::Gt, value)
    }

    /// Evaluates the predicate against one cell.
    ///
    /// Nulls never match. Numeric operands compare numerically, text compares
    /// lexically. Returns `Err` with a reason when the cell cannot be compared
    /// with the bound value.
    pub fn matches(&self, cell: &Value) -> Result<bool, String> {
        if cell.is_null() || self.value.is_null() {
            return Ok(false);
        }

        let ordering = match (&self.value, cell) {
            (Value::Text(expected), Value::Text(actual)) => actual.as_str().cmp(expected.as_str()),
            (Value::Int(_) | Value::Float(_), _) => {
                let actual = cell
                    .as_f64()
                    .ok_or_else(|| format!("'{}' is not numeric", cell))?;
                let expected = self.value.as_f64().unwrap_or_default();
                actual
                    .partial_cmp(&expected)
                    .ok_or_else(|| format!("'{}' cannot be ordered", cell))?
            }
            (Value::Text(_), _) => {
                return Err(format!("'{}' cannot be compared with text", cell));
            }
            (Value::Null, _) => return Ok(false),
        };

        Ok(self.op.accepts(ordering))
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.column, self.op, self.value)
    }
}

/// Side of a join a projected column is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinSide {
    Left,
    Right,
}

/// One output column of a join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Projection {
    pub side: JoinSide,
    pub column: String,
}

impl Projection {
    pub fn left(column: impl Into<String>) -> Self {
        Self {
            side: JoinSide::Left,
            column: column.into(),
        }
    }

    pub fn right(column: impl Into<String>) -> Self {
        Self {
            side: JoinSide::Right,
            column: column.into(),
        }
    }
}

/// Inner equi-join description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub left_key: String,
    pub right_key: String,
    pub projection: Vec<Projection>,
}

impl JoinSpec {
    /// Joins on a column that has the same name on both sides.
    pub fn on(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            left_key: key.clone(),
            right_key: key,
            projection: Vec::new(),
        }
    }

    pub fn project(mut self, projection: Projection) -> Self {
        self.projection.push(projection);
        self
    }
}

/// A relation to compute from existing tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Query {
    /// `SELECT * FROM input WHERE predicate`
    Filter { input: TableRef, predicate: Predicate },
    /// `SELECT projection FROM left JOIN right ON left.key = right.key`
    Join {
        left: TableRef,
        right: TableRef,
        spec: JoinSpec,
    },
}

impl Query {
    /// Tables the query reads from.
    pub fn inputs(&self) -> Vec<&TableRef> {
        match self {
            Query::Filter { input, .. } => vec![input],
            Query::Join { left, right, .. } => vec![left, right],
        }
    }
}

/// What a merge does with a source row whose key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictAction {
    #[default]
    Update,
    Ignore,
}

/// Upsert description: conflict key, columns to update on conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSpec {
    pub conflict_columns: Vec<String>,
    pub update_columns: Vec<String>,
    pub on_conflict: ConflictAction,
}

impl MergeSpec {
    pub fn new<I, S>(conflict_columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            conflict_columns: conflict_columns.into_iter().map(Into::into).collect(),
            update_columns: Vec::new(),
            on_conflict: ConflictAction::Update,
        }
    }

    pub fn with_update_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.update_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_conflict_action(mut self, action: ConflictAction) -> Self {
        self.on_conflict = action;
        self
    }
}

/// Outcome of a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    /// Source rows inserted as new target rows.
    pub inserted: u64,
    /// Target rows whose update columns changed.
    pub updated: u64,
    /// Source rows that matched a target row without changing it.
    pub unchanged: u64,
}

impl MergeReport {
    /// True if the merge did not modify the target.
    pub fn is_noop(&self) -> bool {
        self.inserted == 0 && self.updated == 0
    }
}

/// Quotes an SQL identifier, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicate_numeric() {
        let p = Predicate::greater_than("amount", 150i64);
        assert!(p.matches(&Value::Int(200)).unwrap());
        assert!(!p.matches(&Value::Int(150)).unwrap());
        assert!(!p.matches(&Value::Int(100)).unwrap());
        assert!(p.matches(&Value::Float(150.01)).unwrap());
        assert!(p.matches(&Value::from("151")).unwrap());
        assert!(!p.matches(&Value::Null).unwrap());
        assert!(p.matches(&Value::from("lots")).is_err());
    }

    #[test]
    fn test_predicate_text() {
        let p = Predicate::new("type", CompareOp::Eq, "online");
        assert!(p.matches(&Value::from("online")).unwrap());
        assert!(!p.matches(&Value::from("store")).unwrap());
        assert!(p.matches(&Value::Int(3)).is_err());
    }

    #[test]
    fn test_compare_ops() {
        assert!(CompareOp::Ge.accepts(Ordering::Equal));
        assert!(CompareOp::Le.accepts(Ordering::Less));
        assert!(!CompareOp::Ne.accepts(Ordering::Equal));
        assert_eq!(CompareOp::Ne.as_sql(), "<>");
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("orders"), "\"orders\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_merge_spec_builder() {
        let spec = MergeSpec::new(["order_id"])
            .with_update_columns(["customer_id", "customer_name"])
            .with_conflict_action(ConflictAction::Ignore);
        assert_eq!(spec.conflict_columns, vec!["order_id"]);
        assert_eq!(spec.update_columns.len(), 2);
        assert_eq!(spec.on_conflict, ConflictAction::Ignore);
    }
}
