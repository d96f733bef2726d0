//! Pipeline runner: executes a [`Pipeline`] against a warehouse and an
//! object store.
//!
//! Stages run one at a time in pipeline order. Each stage resolves its inputs
//! through the run's [`TableArena`], writes its output to a table reserved
//! for it, and advances the run state machine. The first failing stage ends
//! the run in `Failed`; ephemeral tables created so far are left in place
//! and listed in [`RunReport::leaked_tables`] unless cleanup on failure is
//! enabled.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DecodeError, ErrorKind, ObjectStoreError, WarehouseError};
use crate::metrics::MetricsCollector;
use crate::storage::{decode_csv, ObjectStore};
use crate::warehouse::{MergeReport, Query, TableRef, Value, Warehouse};

use super::arena::TableArena;
use super::graph::{Pipeline, StageId, TableInput, TaskNode};
use super::stages::{StageKind, StageOutput};
use super::state::{InvalidTransition, RunState, StateMachine};

/// Errors raised by a single stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Stage '{stage}' has no table from upstream stage {input}")]
    MissingInput { stage: String, input: StageId },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Warehouse(e) => e.kind(),
            StageError::ObjectStore(e) => e.kind(),
            StageError::Decode(e) => e.kind(),
            StageError::MissingInput { .. } | StageError::InvalidTransition(_) => {
                ErrorKind::Internal
            }
        }
    }
}

/// Run-level options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Drop the run's ephemeral tables when a stage fails.
    pub cleanup_on_failure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
}

/// Outcome of one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub kind: String,
    pub status: StageStatus,
    pub duration_ms: u64,
    pub output: Option<StageOutput>,
    pub error: Option<String>,
}

/// Why a run failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub pipeline: String,
    /// Start of the schedule interval the run covers.
    pub logical_date: Option<NaiveDateTime>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunState,
    /// Every state the run passed through, starting with `Pending`.
    pub history: Vec<RunState>,
    pub stages: Vec<StageReport>,
    pub failure: Option<RunFailure>,
    /// Ephemeral tables that still exist after the run.
    pub leaked_tables: Vec<TableRef>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunState::Done
    }

    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Values produced by the extraction stage `name`.
    pub fn extracted(&self, name: &str) -> Option<&[Value]> {
        self.stage(name)
            .and_then(|s| s.output.as_ref())
            .and_then(StageOutput::values)
    }

    pub fn merge_report(&self, name: &str) -> Option<&MergeReport> {
        self.stage(name)
            .and_then(|s| s.output.as_ref())
            .and_then(StageOutput::merge_report)
    }

    /// Tables dropped by cleanup stages.
    pub fn dropped_tables(&self) -> Vec<TableRef> {
        self.stages
            .iter()
            .filter_map(|s| match &s.output {
                Some(StageOutput::Cleaned { dropped }) => Some(dropped.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// Executes pipelines.
///
/// # Example
///
/// ```rust,ignore
/// let runner = PipelineRunner::new(warehouse, store);
/// let report = runner.run(&pipeline).await;
/// if !report.is_success() {
///     eprintln!("leaked: {:?}", report.leaked_tables);
/// }
/// ```
#[derive(Clone)]
pub struct PipelineRunner {
    warehouse: Arc<dyn Warehouse>,
    store: Arc<dyn ObjectStore>,
    options: RunOptions,
    metrics: MetricsCollector,
}

impl PipelineRunner {
    pub fn new(warehouse: Arc<dyn Warehouse>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            warehouse,
            store,
            options: RunOptions::default(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    pub fn options(&self) -> RunOptions {
        self.options
    }

    /// Runs `pipeline` once with a fresh run id and no logical date.
    pub async fn run(&self, pipeline: &Pipeline) -> RunReport {
        self.run_with_id(pipeline, Uuid::new_v4(), None).await
    }

    /// Runs `pipeline` once for the given schedule interval.
    pub async fn run_for(&self, pipeline: &Pipeline, logical_date: NaiveDateTime) -> RunReport {
        self.run_with_id(pipeline, Uuid::new_v4(), Some(logical_date))
            .await
    }

    pub async fn run_with_id(
        &self,
        pipeline: &Pipeline,
        run_id: Uuid,
        logical_date: Option<NaiveDateTime>,
    ) -> RunReport {
        let started_at = Utc::now();
        let mut arena = TableArena::new(run_id, self.warehouse.connection().clone(), pipeline.len());
        let mut machine = StateMachine::new();
        let mut stages = Vec::with_capacity(pipeline.len());
        let mut failure = None;

        info!(
            run_id = %run_id,
            pipeline = pipeline.name(),
            logical_date = ?logical_date,
            stages = pipeline.len(),
            "Starting pipeline run"
        );

        for (id, node) in pipeline.stages() {
            let start = Instant::now();
            let result = match machine.transition(node.kind.running_state()) {
                Ok(()) => self.execute_stage(id, node, &mut arena).await,
                Err(e) => Err(StageError::from(e)),
            };
            let elapsed = start.elapsed();
            self.metrics
                .record_stage(node.kind.label(), elapsed.as_secs_f64());

            match result {
                Ok(output) => {
                    debug!(
                        run_id = %run_id,
                        stage = %node.name,
                        duration_ms = elapsed.as_millis() as u64,
                        "Stage completed"
                    );
                    if let Some(report) = output.merge_report() {
                        self.metrics.record_merge(report);
                    }
                    arena.record(id, output.clone());
                    stages.push(StageReport {
                        name: node.name.clone(),
                        kind: node.kind.label().to_string(),
                        status: StageStatus::Succeeded,
                        duration_ms: elapsed.as_millis() as u64,
                        output: Some(output),
                        error: None,
                    });
                }
                Err(err) => {
                    warn!(
                        run_id = %run_id,
                        stage = %node.name,
                        kind = %err.kind(),
                        error = %err,
                        "Stage failed"
                    );
                    stages.push(StageReport {
                        name: node.name.clone(),
                        kind: node.kind.label().to_string(),
                        status: StageStatus::Failed,
                        duration_ms: elapsed.as_millis() as u64,
                        output: None,
                        error: Some(err.to_string()),
                    });
                    failure = Some(RunFailure {
                        stage: node.name.clone(),
                        kind: err.kind(),
                        message: err.to_string(),
                    });
                    break;
                }
            }
        }

        if failure.is_some() {
            machine.fail();
            if self.options.cleanup_on_failure {
                self.drop_ephemeral_best_effort(&mut arena).await;
            }
        } else if let Err(e) = machine.transition(RunState::Done) {
            failure = Some(RunFailure {
                stage: pipeline.name().to_string(),
                kind: ErrorKind::Internal,
                message: e.to_string(),
            });
            machine.fail();
        }

        let leaked_tables = arena.ephemeral_tables();
        let status = machine.current();
        self.metrics.record_run(pipeline.name(), &status.to_string());
        self.metrics.record_leaked(leaked_tables.len());

        let report = RunReport {
            run_id,
            pipeline: pipeline.name().to_string(),
            logical_date,
            started_at,
            finished_at: Utc::now(),
            status,
            history: machine.history().to_vec(),
            stages,
            failure,
            leaked_tables,
        };

        info!(
            run_id = %run_id,
            pipeline = pipeline.name(),
            status = %report.status,
            duration_ms = report.duration_ms(),
            leaked = report.leaked_tables.len(),
            "Pipeline run finished"
        );

        report
    }

    async fn execute_stage(
        &self,
        id: StageId,
        node: &TaskNode,
        arena: &mut TableArena,
    ) -> Result<StageOutput, StageError> {
        let input = |input: &TableInput| -> Result<TableRef, StageError> {
            arena.resolve(input).ok_or_else(|| StageError::MissingInput {
                stage: node.name.clone(),
                input: input.stage().unwrap_or(id),
            })
        };

        match &node.kind {
            StageKind::Load { file, output } => {
                let target = output.clone().unwrap_or_else(|| arena.ephemeral_for(id));
                let bytes = self.store.read(file).await?;
                let frame = decode_csv(&file.path, &bytes)?;
                let rows = frame.len();
                let table = self.warehouse.load(&frame, &target).await?;
                info!(stage = %node.name, file = %file, table = %table, rows, "Loaded file");
                Ok(StageOutput::Table {
                    table,
                    rows: Some(rows),
                })
            }
            StageKind::Filter { input: source, predicate } => {
                let query = Query::Filter {
                    input: input(source)?,
                    predicate: predicate.clone(),
                };
                let table = self.warehouse.execute(&query, &arena.ephemeral_for(id)).await?;
                Ok(StageOutput::Table { table, rows: None })
            }
            StageKind::Join { left, right, spec } => {
                let query = Query::Join {
                    left: input(left)?,
                    right: input(right)?,
                    spec: spec.clone(),
                };
                let table = self.warehouse.execute(&query, &arena.ephemeral_for(id)).await?;
                Ok(StageOutput::Table { table, rows: None })
            }
            StageKind::Merge { source, target, spec } => {
                let source = input(source)?;
                let report = self.warehouse.merge(&source, target, spec).await?;
                info!(
                    stage = %node.name,
                    target = %target,
                    inserted = report.inserted,
                    updated = report.updated,
                    unchanged = report.unchanged,
                    "Merged into target"
                );
                Ok(StageOutput::Merged {
                    table: target.clone(),
                    report,
                })
            }
            StageKind::Extract { input: source, column } => {
                let table = input(source)?;
                let frame = self.warehouse.materialize(&table).await?;
                let values = frame
                    .column(column)
                    .ok_or_else(|| WarehouseError::ColumnNotFound {
                        table: table.physical_name(),
                        column: column.clone(),
                    })?;
                debug!(stage = %node.name, column = %column, values = values.len(), "Extracted column");
                Ok(StageOutput::Values {
                    column: column.clone(),
                    values,
                })
            }
            StageKind::Cleanup => {
                let mut dropped = Vec::new();
                for table in arena.ephemeral_tables() {
                    if self.warehouse.drop_table(&table).await? {
                        dropped.push(table.clone());
                    }
                    arena.mark_dropped(&table);
                }
                info!(
                    run_id = %arena.run_id(),
                    dropped = dropped.len(),
                    "Dropped ephemeral tables"
                );
                Ok(StageOutput::Cleaned { dropped })
            }
        }
    }

    /// Drops whatever ephemeral tables exist after a failure, logging
    /// instead of failing on errors.
    async fn drop_ephemeral_best_effort(&self, arena: &mut TableArena) {
        for table in arena.ephemeral_tables() {
            match self.warehouse.drop_table(&table).await {
                Ok(_) => arena.mark_dropped(&table),
                Err(e) => warn!(table = %table, error = %e, "Failed to drop ephemeral table"),
            }
        }
    }
}
