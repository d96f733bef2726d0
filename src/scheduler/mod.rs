//! Scheduling of pipeline runs.
//!
//! - **Cadence / Schedule**: which logical dates are due (`@daily` from a
//!   start date, with or without catch-up)
//! - **RetryPolicy**: run-level retries of failed runs
//! - **Scheduler**: the service loop, serializing runs behind a run lock
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use customer_orders::scheduler::Scheduler;
//!
//! let scheduler = Arc::new(
//!     Scheduler::new(runner, Arc::new(pipeline), config.schedule()?)
//!         .with_retry_policy(config.retry_policy()),
//! );
//!
//! let looping = Arc::clone(&scheduler);
//! let handle = tokio::spawn(async move { looping.run_until_shutdown().await });
//!
//! tokio::signal::ctrl_c().await?;
//! scheduler.shutdown();
//! handle.await??;
//! ```

pub mod cadence;
pub mod retry;
pub mod service;

pub use cadence::{Cadence, CadenceError, Schedule};
pub use retry::RetryPolicy;
pub use service::{RunRecord, Scheduler, SchedulerError, SchedulerStats};
