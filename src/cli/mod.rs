//! Command-line interface for customer-orders.
//!
//! Provides commands to run the pipeline once, run it on its schedule,
//! print its task graph and seed warehouse tables.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
