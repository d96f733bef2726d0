//! Metrics module for Prometheus-based monitoring.
//!
//! Pipeline runs record run outcomes, stage durations and merge row counts.
//!
//! # Example
//!
//! ```ignore
//! use customer_orders::metrics::{init_metrics, export_metrics};
//!
//! init_metrics()?;
//! // ... run the pipeline ...
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{LEAKED_TABLES, MERGED_ROWS_TOTAL, REGISTRY, RUNS_TOTAL, STAGE_DURATION};
