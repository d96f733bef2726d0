//! Stage definitions and stage outputs.

use serde::{Deserialize, Serialize};

use crate::warehouse::{FileRef, JoinSpec, MergeReport, MergeSpec, Predicate, TableRef, Value};

use super::graph::TableInput;
use super::state::RunState;

/// What a task node does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageKind {
    /// Stage a file from object storage into a table. Without an explicit
    /// `output` the table is ephemeral.
    Load {
        file: FileRef,
        output: Option<TableRef>,
    },
    /// Keep the rows of `input` matching `predicate`.
    Filter {
        input: TableInput,
        predicate: Predicate,
    },
    /// Inner join of two tables.
    Join {
        left: TableInput,
        right: TableInput,
        spec: JoinSpec,
    },
    /// Upsert `source` into the persistent `target`.
    Merge {
        source: TableInput,
        target: TableRef,
        spec: MergeSpec,
    },
    /// Materialize `input` and pull one column out of it.
    Extract { input: TableInput, column: String },
    /// Drop every ephemeral table created by the run.
    Cleanup,
}

impl StageKind {
    /// Load stage writing to an ephemeral table.
    pub fn load(file: FileRef) -> Self {
        StageKind::Load { file, output: None }
    }

    /// Tables this stage reads.
    pub fn inputs(&self) -> Vec<&TableInput> {
        match self {
            StageKind::Load { .. } | StageKind::Cleanup => Vec::new(),
            StageKind::Filter { input, .. } | StageKind::Extract { input, .. } => vec![input],
            StageKind::Join { left, right, .. } => vec![left, right],
            StageKind::Merge { source, .. } => vec![source],
        }
    }

    /// True if downstream stages can read this stage's output as a table.
    pub fn produces_table(&self) -> bool {
        !matches!(self, StageKind::Extract { .. } | StageKind::Cleanup)
    }

    /// Run state while this stage executes.
    pub fn running_state(&self) -> RunState {
        match self {
            StageKind::Load { .. } => RunState::Loading,
            StageKind::Filter { .. } => RunState::Filtering,
            StageKind::Join { .. } => RunState::Joining,
            StageKind::Merge { .. } => RunState::Merging,
            StageKind::Extract { .. } => RunState::Extracting,
            StageKind::Cleanup => RunState::CleaningUp,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StageKind::Load { .. } => "load",
            StageKind::Filter { .. } => "filter",
            StageKind::Join { .. } => "join",
            StageKind::Merge { .. } => "merge",
            StageKind::Extract { .. } => "extract",
            StageKind::Cleanup => "cleanup",
        }
    }
}

/// What a stage produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output", rename_all = "snake_case")]
pub enum StageOutput {
    /// A table, ephemeral or named.
    Table { table: TableRef, rows: Option<usize> },
    /// The merge target after the upsert.
    Merged { table: TableRef, report: MergeReport },
    /// Values extracted from one column.
    Values { column: String, values: Vec<Value> },
    /// Tables dropped by cleanup.
    Cleaned { dropped: Vec<TableRef> },
}

impl StageOutput {
    /// The table downstream stages read, if any.
    pub fn table(&self) -> Option<&TableRef> {
        match self {
            StageOutput::Table { table, .. } | StageOutput::Merged { table, .. } => Some(table),
            StageOutput::Values { .. } | StageOutput::Cleaned { .. } => None,
        }
    }

    pub fn values(&self) -> Option<&[Value]> {
        match self {
            StageOutput::Values { values, .. } => Some(values),
            _ => None,
        }
    }

    pub fn merge_report(&self) -> Option<&MergeReport> {
        match self {
            StageOutput::Merged { report, .. } => Some(report),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageId;

    #[test]
    fn test_inputs_and_states() {
        let join = StageKind::Join {
            left: TableInput::Stage(StageId::new(1)),
            right: TableInput::Table(TableRef::named("customers_table", "snowflake_default")),
            spec: JoinSpec::on("customer_id"),
        };
        assert_eq!(join.inputs().len(), 2);
        assert_eq!(join.running_state(), RunState::Joining);
        assert!(join.produces_table());

        assert!(StageKind::Cleanup.inputs().is_empty());
        assert!(!StageKind::Cleanup.produces_table());
        assert_eq!(StageKind::Cleanup.running_state(), RunState::CleaningUp);
    }

    #[test]
    fn test_output_accessors() {
        let table = TableRef::named("reporting_table", "snowflake_default");
        let merged = StageOutput::Merged {
            table: table.clone(),
            report: MergeReport::default(),
        };
        assert_eq!(merged.table(), Some(&table));
        assert!(merged.merge_report().is_some());
        assert!(merged.values().is_none());

        let values = StageOutput::Values {
            column: "purchase_date".into(),
            values: vec![Value::from("2023-01-05")],
        };
        assert!(values.table().is_none());
        assert_eq!(values.values().map(|v| v.len()), Some(1));
    }
}
