//! Prometheus metrics registration and export.
//!
//! This module defines the Prometheus metrics recorded by pipeline runs and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{CounterVec, Encoder, HistogramVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all customer_orders metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of pipeline runs, labeled by pipeline and final status.
pub static RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage execution duration in seconds, labeled by stage kind.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Rows touched by merges, labeled by outcome (inserted/updated/unchanged).
pub static MERGED_ROWS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Ephemeral tables left behind by the most recent run.
pub static LEAKED_TABLES: OnceLock<IntGauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls register into a fresh registry that is
/// then discarded, so the first initialization wins.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let runs_total = CounterVec::new(
        Opts::new("customer_orders_runs_total", "Total number of pipeline runs"),
        &["pipeline", "status"],
    )?;

    let stage_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "customer_orders_stage_duration_seconds",
            "Stage execution duration in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
        &["stage"],
    )?;

    let merged_rows_total = CounterVec::new(
        Opts::new(
            "customer_orders_merged_rows_total",
            "Rows processed by merge stages",
        ),
        &["outcome"],
    )?;

    let leaked_tables = IntGauge::new(
        "customer_orders_leaked_tables",
        "Ephemeral tables left behind by the most recent run",
    )?;

    registry.register(Box::new(runs_total.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(merged_rows_total.clone()))?;
    registry.register(Box::new(leaked_tables.clone()))?;

    // Already set means a previous call initialized the metrics.
    let _ = REGISTRY.set(registry);
    let _ = RUNS_TOTAL.set(runs_total);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = MERGED_ROWS_TOTAL.set(merged_rows_total);
    let _ = LEAKED_TABLES.set(leaked_tables);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
