//! Task dependency graph.
//!
//! A [`Pipeline`] is built node by node with a [`PipelineBuilder`]. Each
//! node declares its inputs explicitly (the output of an earlier stage or a
//! named table) plus any ordering-only dependencies. Because a node may only
//! reference stages that were added before it, insertion order is always a
//! valid topological order and the graph cannot contain cycles.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;
use crate::warehouse::TableRef;

use super::stages::StageKind;

/// Index of a stage within its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(usize);

impl StageId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a stage reads a table from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableInput {
    /// The table produced by an earlier stage of the same run.
    Stage(StageId),
    /// A persistent table owned outside the pipeline.
    Table(TableRef),
}

impl TableInput {
    pub fn stage(&self) -> Option<StageId> {
        match self {
            TableInput::Stage(id) => Some(*id),
            TableInput::Table(_) => None,
        }
    }
}

impl From<StageId> for TableInput {
    fn from(id: StageId) -> Self {
        TableInput::Stage(id)
    }
}

impl From<TableRef> for TableInput {
    fn from(table: TableRef) -> Self {
        TableInput::Table(table)
    }
}

/// Errors raised while assembling a pipeline.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Stage name '{0}' is used twice")]
    DuplicateName(String),

    #[error("Stage '{stage}' depends on unknown stage {upstream}")]
    UnknownUpstream { stage: String, upstream: StageId },

    #[error("Stage '{stage}' reads a table from stage '{upstream}', which does not produce one")]
    NotATableProducer { stage: String, upstream: String },

    #[error("Cleanup stage '{0}' must be the last stage")]
    CleanupNotTerminal(String),

    #[error("Pipeline '{0}' has no stages")]
    Empty(String),
}

impl GraphError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}

/// A unit of work with explicit upstream dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    pub name: String,
    pub kind: StageKind,
    /// Ordering-only dependencies, in addition to data inputs.
    pub after: Vec<StageId>,
}

impl TaskNode {
    pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            after: Vec::new(),
        }
    }

    /// Adds an ordering dependency on `stage`.
    pub fn after(mut self, stage: StageId) -> Self {
        if !self.after.contains(&stage) {
            self.after.push(stage);
        }
        self
    }

    /// All stages this node waits for: data inputs first, then ordering
    /// dependencies, without duplicates.
    pub fn upstream(&self) -> Vec<StageId> {
        let mut ids: Vec<StageId> = self
            .kind
            .inputs()
            .into_iter()
            .filter_map(TableInput::stage)
            .collect();
        for id in &self.after {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        ids
    }
}

/// Assembles a [`Pipeline`].
///
/// # Example
///
/// ```rust,ignore
/// let mut builder = PipelineBuilder::new("customer_orders");
/// let load = builder.add(TaskNode::new("load_orders", StageKind::load(file)))?;
/// let filter = builder.add(TaskNode::new(
///     "filter_orders",
///     StageKind::Filter { input: load.into(), predicate },
/// ))?;
/// let pipeline = builder.build()?;
/// ```
#[derive(Debug)]
pub struct PipelineBuilder {
    name: String,
    nodes: Vec<TaskNode>,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
        }
    }

    /// Adds a node and returns its id.
    ///
    /// Every upstream reference must point at a node that was already added,
    /// and every table input must point at a stage that produces a table.
    pub fn add(&mut self, node: TaskNode) -> Result<StageId, GraphError> {
        if self.nodes.iter().any(|n| n.name == node.name) {
            return Err(GraphError::DuplicateName(node.name));
        }

        for upstream in node.upstream() {
            if upstream.index() >= self.nodes.len() {
                return Err(GraphError::UnknownUpstream {
                    stage: node.name,
                    upstream,
                });
            }
        }

        for input in node.kind.inputs() {
            if let TableInput::Stage(id) = input {
                let producer = &self.nodes[id.index()];
                if !producer.kind.produces_table() {
                    return Err(GraphError::NotATableProducer {
                        stage: node.name,
                        upstream: producer.name.clone(),
                    });
                }
            }
        }

        if let Some(last) = self.nodes.last() {
            if matches!(last.kind, StageKind::Cleanup) {
                return Err(GraphError::CleanupNotTerminal(last.name.clone()));
            }
        }

        let id = StageId::new(self.nodes.len());
        self.nodes.push(node);
        Ok(id)
    }

    pub fn build(self) -> Result<Pipeline, GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::Empty(self.name));
        }
        Ok(Pipeline {
            name: self.name,
            nodes: self.nodes,
        })
    }
}

/// A validated, immutable task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    name: String,
    nodes: Vec<TaskNode>,
}

impl Pipeline {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: StageId) -> Option<&TaskNode> {
        self.nodes.get(id.index())
    }

    /// Looks a stage up by name.
    pub fn stage_id(&self, name: &str) -> Option<StageId> {
        self.nodes
            .iter()
            .position(|n| n.name == name)
            .map(StageId::new)
    }

    /// Stages in execution order.
    pub fn stages(&self) -> impl Iterator<Item = (StageId, &TaskNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (StageId::new(i), n))
    }

    /// Stages that list `id` as an upstream dependency.
    pub fn dependents(&self, id: StageId) -> Vec<StageId> {
        self.stages()
            .filter(|(_, n)| n.upstream().contains(&id))
            .map(|(i, _)| i)
            .collect()
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pipeline {}", self.name)?;
        for (id, node) in self.stages() {
            let upstream: Vec<String> = node
                .upstream()
                .iter()
                .filter_map(|u| self.node(*u).map(|n| n.name.clone()))
                .collect();
            write!(f, "  {} {} [{}]", id, node.name, node.kind.label())?;
            if !upstream.is_empty() {
                write!(f, " <- {}", upstream.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::{FileRef, Predicate};

    fn load() -> TaskNode {
        TaskNode::new(
            "load",
            StageKind::load(FileRef::new("s3://bucket/orders.csv", "aws_default")),
        )
    }

    fn filter(input: StageId) -> TaskNode {
        TaskNode::new(
            "filter",
            StageKind::Filter {
                input: input.into(),
                predicate: Predicate::greater_than("amount", 150i64),
            },
        )
    }

    #[test]
    fn test_builder_assigns_ids_in_order() {
        let mut builder = PipelineBuilder::new("p");
        let a = builder.add(load()).unwrap();
        let b = builder.add(filter(a)).unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);

        let pipeline = builder.build().unwrap();
        assert_eq!(pipeline.len(), 2);
        assert_eq!(pipeline.stage_id("filter"), Some(b));
        assert_eq!(pipeline.node(b).unwrap().upstream(), vec![a]);
        assert_eq!(pipeline.dependents(a), vec![b]);
    }

    #[test]
    fn test_builder_rejects_unknown_upstream() {
        let mut builder = PipelineBuilder::new("p");
        let err = builder.add(filter(StageId::new(3))).unwrap_err();
        assert!(matches!(err, GraphError::UnknownUpstream { .. }));
    }

    #[test]
    fn test_builder_rejects_duplicate_names() {
        let mut builder = PipelineBuilder::new("p");
        builder.add(load()).unwrap();
        let err = builder.add(load()).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateName(name) if name == "load"));
    }

    #[test]
    fn test_builder_rejects_reading_from_non_table_stage() {
        let mut builder = PipelineBuilder::new("p");
        let a = builder.add(load()).unwrap();
        let extract = builder
            .add(TaskNode::new(
                "extract",
                StageKind::Extract {
                    input: a.into(),
                    column: "purchase_date".into(),
                },
            ))
            .unwrap();
        let err = builder.add(filter(extract)).unwrap_err();
        assert!(matches!(err, GraphError::NotATableProducer { .. }));
    }

    #[test]
    fn test_cleanup_must_be_last() {
        let mut builder = PipelineBuilder::new("p");
        let a = builder.add(load()).unwrap();
        builder
            .add(TaskNode::new("cleanup", StageKind::Cleanup).after(a))
            .unwrap();
        let err = builder.add(filter(a)).unwrap_err();
        assert!(matches!(err, GraphError::CleanupNotTerminal(_)));
    }

    #[test]
    fn test_empty_pipeline() {
        let err = PipelineBuilder::new("p").build().unwrap_err();
        assert!(matches!(err, GraphError::Empty(_)));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_after_deduplicates() {
        let node = TaskNode::new("cleanup", StageKind::Cleanup)
            .after(StageId::new(1))
            .after(StageId::new(1));
        assert_eq!(node.upstream(), vec![StageId::new(1)]);
    }

    #[test]
    fn test_display_lists_dependencies() {
        let mut builder = PipelineBuilder::new("p");
        let a = builder.add(load()).unwrap();
        builder.add(filter(a)).unwrap();
        let text = builder.build().unwrap().to_string();
        assert!(text.contains("pipeline p"));
        assert!(text.contains("#1 filter [filter] <- load"));
    }
}
