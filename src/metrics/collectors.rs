//! Recording helpers for pipeline metrics.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics with consistent
//! labels. Every method is a no-op until [`init_metrics`] has run, so library
//! users and tests that never initialize metrics pay nothing.
//!
//! [`init_metrics`]: super::init_metrics

use super::prometheus::{LEAKED_TABLES, MERGED_ROWS_TOTAL, RUNS_TOTAL, STAGE_DURATION};
use crate::warehouse::MergeReport;

/// Metrics collector for pipeline runs.
///
/// # Example
///
/// ```ignore
/// use customer_orders::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.record_stage("filter", 0.42);
/// collector.record_run("customer_orders", "done");
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a finished run with its terminal status ("done" or "failed").
    pub fn record_run(&self, pipeline: &str, status: &str) {
        if let Some(runs) = RUNS_TOTAL.get() {
            runs.with_label_values(&[pipeline, status]).inc();
        }

        tracing::trace!(pipeline = pipeline, status = status, "Recorded run metric");
    }

    /// Record how long a stage of the given kind took.
    pub fn record_stage(&self, stage: &str, duration_secs: f64) {
        if let Some(duration) = STAGE_DURATION.get() {
            duration.with_label_values(&[stage]).observe(duration_secs);
        }
    }

    pub fn record_merge(&self, report: &MergeReport) {
        if let Some(rows) = MERGED_ROWS_TOTAL.get() {
            rows.with_label_values(&["inserted"])
                .inc_by(report.inserted as f64);
            rows.with_label_values(&["updated"])
                .inc_by(report.updated as f64);
            rows.with_label_values(&["unchanged"])
                .inc_by(report.unchanged as f64);
        }

        tracing::trace!(
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            "Recorded merge metric"
        );
    }

    /// Record the number of ephemeral tables a run left behind.
    pub fn record_leaked(&self, count: usize) {
        if let Some(leaked) = LEAKED_TABLES.get() {
            leaked.set(count as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_collector_records_without_panicking() {
        let collector = MetricsCollector::new();
        // Works whether or not metrics were initialized by another test.
        collector.record_stage("load", 0.2);
        collector.record_run("customer_orders", "failed");
        collector.record_leaked(0);
    }

    #[test]
    fn test_merge_counts_exported() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();
        collector.record_merge(&MergeReport {
            inserted: 2,
            updated: 1,
            unchanged: 0,
        });

        let text = export_metrics();
        assert!(text.contains("customer_orders_merged_rows_total"));
        assert!(text.contains("outcome=\"inserted\""));
    }
}
