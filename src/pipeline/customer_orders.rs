//! The customer orders pipeline.
//!
//! ```text
//! load_orders -> filter_orders -> join_orders_customers -> merge_reporting
//!     -> extract_purchase_dates -> cleanup
//! ```
//!
//! Orders are staged from object storage, filtered on `amount`, joined with
//! the customers table, upserted into the reporting table by `order_id`, and
//! the reporting table's purchase dates are pulled back into memory.

use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;

use crate::warehouse::{JoinSpec, MergeSpec, Predicate, Projection, Value};

use super::config::PipelineConfig;
use super::graph::{GraphError, Pipeline, PipelineBuilder, TaskNode};
use super::stages::StageKind;

pub const PIPELINE_NAME: &str = "customer_orders";

pub const LOAD_ORDERS: &str = "load_orders";
pub const FILTER_ORDERS: &str = "filter_orders";
pub const JOIN_ORDERS_CUSTOMERS: &str = "join_orders_customers";
pub const MERGE_REPORTING: &str = "merge_reporting";
pub const EXTRACT_PURCHASE_DATES: &str = "extract_purchase_dates";
pub const CLEANUP: &str = "cleanup";

/// Builds the pipeline described by `config`.
pub fn build_pipeline(config: &PipelineConfig) -> Result<Pipeline, GraphError> {
    let mut builder = PipelineBuilder::new(PIPELINE_NAME);

    let load = builder.add(TaskNode::new(
        LOAD_ORDERS,
        StageKind::load(config.orders_file()),
    ))?;

    let filter = builder.add(TaskNode::new(
        FILTER_ORDERS,
        StageKind::Filter {
            input: load.into(),
            predicate: Predicate::greater_than("amount", threshold_value(config.amount_threshold)),
        },
    ))?;

    let join = builder.add(TaskNode::new(
        JOIN_ORDERS_CUSTOMERS,
        StageKind::Join {
            left: filter.into(),
            right: config.customers().into(),
            spec: JoinSpec::on("customer_id")
                .project(Projection::right("customer_id"))
                .project(Projection::right("customer_name"))
                .project(Projection::left("order_id"))
                .project(Projection::left("purchase_date"))
                .project(Projection::left("amount"))
                .project(Projection::left("type")),
        },
    ))?;

    let merge = builder.add(TaskNode::new(
        MERGE_REPORTING,
        StageKind::Merge {
            source: join.into(),
            target: config.reporting(),
            spec: MergeSpec::new(["order_id"])
                .with_update_columns(["customer_id", "customer_name"]),
        },
    ))?;

    let extract = builder.add(TaskNode::new(
        EXTRACT_PURCHASE_DATES,
        StageKind::Extract {
            input: merge.into(),
            column: "purchase_date".to_string(),
        },
    ))?;

    builder.add(TaskNode::new(CLEANUP, StageKind::Cleanup).after(extract))?;

    builder.build()
}

// Whole thresholds compare as integers so SQLite sees `amount > 150`.
fn threshold_value(threshold: f64) -> Value {
    if threshold.fract() == 0.0 && threshold.abs() < i64::MAX as f64 {
        Value::Int(threshold as i64)
    } else {
        Value::Float(threshold)
    }
}

#[derive(Debug, Error)]
#[error("Value '{value}' at position {index} is not a purchase date")]
pub struct PurchaseDateError {
    pub index: usize,
    pub value: String,
}

/// Purchase dates extracted from the reporting table, in row order.
///
/// Null cells stay in place as `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseDates {
    dates: Vec<Option<NaiveDate>>,
}

impl PurchaseDates {
    /// Parses extracted values. Accepts `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS`
    /// and `MM/DD/YYYY`.
    pub fn from_values(values: &[Value]) -> Result<Self, PurchaseDateError> {
        let dates = values
            .iter()
            .enumerate()
            .map(|(index, value)| match value {
                Value::Null => Ok(None),
                Value::Text(text) => parse_date(text).map(Some).ok_or_else(|| PurchaseDateError {
                    index,
                    value: text.clone(),
                }),
                other => Err(PurchaseDateError {
                    index,
                    value: other.to_string(),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { dates })
    }

    pub fn dates(&self) -> &[Option<NaiveDate>] {
        &self.dates
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn earliest(&self) -> Option<NaiveDate> {
        self.dates.iter().flatten().min().copied()
    }

    pub fn latest(&self) -> Option<NaiveDate> {
        self.dates.iter().flatten().max().copied()
    }
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").map(|dt| dt.date()))
        .or_else(|_| NaiveDate::parse_from_str(text, "%m/%d/%Y"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::TableInput;

    #[test]
    fn test_pipeline_shape() {
        let pipeline = build_pipeline(&PipelineConfig::default()).unwrap();
        let names: Vec<&str> = pipeline.stages().map(|(_, n)| n.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                LOAD_ORDERS,
                FILTER_ORDERS,
                JOIN_ORDERS_CUSTOMERS,
                MERGE_REPORTING,
                EXTRACT_PURCHASE_DATES,
                CLEANUP
            ]
        );

        // Strict chain: every stage waits for the one before it.
        for (id, node) in pipeline.stages().skip(1) {
            let previous = crate::pipeline::StageId::new(id.index() - 1);
            assert!(node.upstream().contains(&previous), "{}", node.name);
        }
    }

    #[test]
    fn test_join_reads_customers_table() {
        let config = PipelineConfig::default().with_customers_table("customers_v2");
        let pipeline = build_pipeline(&config).unwrap();
        let join = pipeline
            .node(pipeline.stage_id(JOIN_ORDERS_CUSTOMERS).unwrap())
            .unwrap();
        match &join.kind {
            StageKind::Join { right, spec, .. } => {
                assert_eq!(right, &TableInput::Table(config.customers()));
                assert_eq!(spec.projection.len(), 6);
            }
            other => panic!("unexpected stage {:?}", other),
        }
    }

    #[test]
    fn test_threshold_value() {
        assert_eq!(threshold_value(150.0), Value::Int(150));
        assert_eq!(threshold_value(99.5), Value::Float(99.5));
    }

    #[test]
    fn test_purchase_dates() {
        let dates = PurchaseDates::from_values(&[
            Value::from("2023-01-05"),
            Value::Null,
            Value::from("01/03/2023"),
            Value::from("2023-02-01 10:00:00"),
        ])
        .unwrap();
        assert_eq!(dates.len(), 4);
        assert_eq!(dates.dates()[1], None);
        assert_eq!(dates.earliest(), NaiveDate::from_ymd_opt(2023, 1, 3));
        assert_eq!(dates.latest(), NaiveDate::from_ymd_opt(2023, 2, 1));
    }

    #[test]
    fn test_purchase_dates_rejects_garbage() {
        let err = PurchaseDates::from_values(&[Value::from("yesterday")]).unwrap_err();
        assert_eq!(err.index, 0);
        assert!(PurchaseDates::from_values(&[Value::Int(20230105)]).is_err());
    }
}
