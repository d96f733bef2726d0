//! Pipeline definition and execution.
//!
//! # Architecture
//!
//! - **Graph**: [`PipelineBuilder`] assembles [`TaskNode`]s with explicit
//!   upstream dependencies into an immutable [`Pipeline`]
//! - **Stages**: [`StageKind`] describes what a node does, [`StageOutput`]
//!   what it produced
//! - **Arena**: [`TableArena`] holds each stage's output for one run,
//!   indexed by [`StageId`]
//! - **Runner**: [`PipelineRunner`] executes a pipeline against a
//!   [`Warehouse`](crate::warehouse::Warehouse) and an
//!   [`ObjectStore`](crate::storage::ObjectStore), driving the
//!   [`RunState`] machine and producing a [`RunReport`]
//! - **Config**: [`PipelineConfig`] for the customer orders pipeline
//!
//! # Run Flow
//!
//! 1. **Load**: the orders CSV is read from object storage into a table
//! 2. **Filter**: orders with `amount > 150` are kept
//! 3. **Join**: filtered orders are joined with customers on `customer_id`
//! 4. **Merge**: joined rows are upserted into the reporting table by `order_id`
//! 5. **Extract**: purchase dates are read back from the reporting table
//! 6. **Cleanup**: every ephemeral table of the run is dropped
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use customer_orders::pipeline::{build_pipeline, PipelineConfig, PipelineRunner};
//!
//! let config = PipelineConfig::from_env()?;
//! let pipeline = build_pipeline(&config)?;
//! let runner = PipelineRunner::new(warehouse, store).with_options(config.run_options());
//!
//! let report = runner.run(&pipeline).await;
//! println!("run {} finished: {}", report.run_id, report.status);
//! ```

pub mod arena;
pub mod config;
pub mod customer_orders;
pub mod graph;
pub mod runner;
pub mod stages;
pub mod state;

pub use arena::TableArena;
pub use config::{ConfigError, PipelineConfig};
pub use customer_orders::{build_pipeline, PurchaseDateError, PurchaseDates};
pub use graph::{GraphError, Pipeline, PipelineBuilder, StageId, TableInput, TaskNode};
pub use runner::{
    PipelineRunner, RunFailure, RunOptions, RunReport, StageError, StageReport, StageStatus,
};
pub use stages::{StageKind, StageOutput};
pub use state::{InvalidTransition, RunState, StateMachine};
