//! customer-orders: a daily pipeline that stages orders, filters them, joins
//! them with customers, merges the result into a reporting table and
//! extracts purchase dates.
//!
//! This library provides the task graph and runner, the warehouse engines
//! (in-memory and SQLite), object storage access, and the scheduler.

// Core modules
pub mod cli;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod storage;
pub mod warehouse;

// Re-export commonly used types
pub use error::{DecodeError, ErrorKind, ObjectStoreError, WarehouseError};
pub use pipeline::{
    build_pipeline, Pipeline, PipelineBuilder, PipelineConfig, PipelineRunner, RunReport,
    RunState,
};
pub use scheduler::{RetryPolicy, Schedule, Scheduler};
