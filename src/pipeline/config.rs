//! Pipeline configuration.
//!
//! Covers the source file, warehouse connection, table names, the filter
//! threshold, schedule and retry settings. Values come from defaults,
//! environment variables or a YAML file, and are checked by
//! [`PipelineConfig::validate`] before use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;
use crate::scheduler::{Cadence, RetryPolicy, Schedule};
use crate::warehouse::{FileRef, TableRef};

use super::runner::RunOptions;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The configuration file is not valid YAML for this structure.
    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::Io(_) => ErrorKind::SourceUnavailable,
            _ => ErrorKind::Internal,
        }
    }
}

/// Configuration for the customer orders pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // Source settings
    /// Location of the orders CSV in object storage.
    pub orders_file_path: String,
    /// Object store connection serving the orders file.
    pub orders_file_conn: String,
    /// Local directory standing in for object storage buckets.
    pub object_store_root: PathBuf,

    // Warehouse settings
    /// Warehouse connection identity.
    pub warehouse_conn: String,
    /// sqlx connection URL of the SQLite warehouse.
    pub warehouse_url: String,
    pub customers_table: String,
    pub reporting_table: String,

    /// Orders with `amount` above this value pass the filter.
    pub amount_threshold: f64,

    // Schedule settings
    /// `@daily` or `@hourly`.
    pub schedule: String,
    pub start_date: NaiveDate,
    /// Run every missed interval instead of only the latest one.
    pub catchup: bool,

    // Failure handling
    /// Attempts per run, including the first.
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    /// Drop ephemeral tables when a run fails.
    pub cleanup_on_failure: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            orders_file_path: "s3://sanketh-astrosdk/orders_data_header.csv".to_string(),
            orders_file_conn: "aws_default".to_string(),
            object_store_root: PathBuf::from("./object-store"),

            warehouse_conn: "snowflake_default".to_string(),
            warehouse_url: "sqlite://customer_orders.db".to_string(),
            customers_table: "customers_table".to_string(),
            reporting_table: "reporting_table".to_string(),

            amount_threshold: 150.0,

            schedule: "@daily".to_string(),
            start_date: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap_or(NaiveDate::MIN),
            catchup: false,

            max_attempts: 1,
            retry_delay_secs: 300,
            cleanup_on_failure: false,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PIPELINE_ORDERS_FILE`: Orders CSV path (default: s3://sanketh-astrosdk/orders_data_header.csv)
    /// - `PIPELINE_ORDERS_CONN`: Object store connection (default: aws_default)
    /// - `PIPELINE_OBJECT_STORE_ROOT`: Local object store directory (default: ./object-store)
    /// - `PIPELINE_WAREHOUSE_CONN`: Warehouse connection (default: snowflake_default)
    /// - `WAREHOUSE_URL`: SQLite connection URL (default: sqlite://customer_orders.db)
    /// - `PIPELINE_CUSTOMERS_TABLE`: Customers table (default: customers_table)
    /// - `PIPELINE_REPORTING_TABLE`: Reporting table (default: reporting_table)
    /// - `PIPELINE_AMOUNT_THRESHOLD`: Filter threshold (default: 150)
    /// - `PIPELINE_SCHEDULE`: `@daily` or `@hourly` (default: @daily)
    /// - `PIPELINE_START_DATE`: First logical date, YYYY-MM-DD (default: 2023-01-01)
    /// - `PIPELINE_CATCHUP`: Run missed intervals (default: false)
    /// - `PIPELINE_MAX_ATTEMPTS`: Attempts per run (default: 1)
    /// - `PIPELINE_RETRY_DELAY_SECS`: Delay between attempts (default: 300)
    /// - `PIPELINE_CLEANUP_ON_FAILURE`: Drop ephemeral tables on failure (default: false)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a YAML file, then applies environment overrides.
    ///
    /// Keys missing from the file keep their default values.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&text)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses YAML without consulting the environment.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        // Source settings
        if let Ok(val) = std::env::var("PIPELINE_ORDERS_FILE") {
            self.orders_file_path = val;
        }

        if let Ok(val) = std::env::var("PIPELINE_ORDERS_CONN") {
            self.orders_file_conn = val;
        }

        if let Ok(val) = std::env::var("PIPELINE_OBJECT_STORE_ROOT") {
            self.object_store_root = PathBuf::from(val);
        }

        // Warehouse settings
        if let Ok(val) = std::env::var("PIPELINE_WAREHOUSE_CONN") {
            self.warehouse_conn = val;
        }

        if let Ok(val) = std::env::var("WAREHOUSE_URL") {
            self.warehouse_url = val;
        }

        if let Ok(val) = std::env::var("PIPELINE_CUSTOMERS_TABLE") {
            self.customers_table = val;
        }

        if let Ok(val) = std::env::var("PIPELINE_REPORTING_TABLE") {
            self.reporting_table = val;
        }

        if let Ok(val) = std::env::var("PIPELINE_AMOUNT_THRESHOLD") {
            self.amount_threshold = parse_env_value(&val, "PIPELINE_AMOUNT_THRESHOLD")?;
        }

        // Schedule settings
        if let Ok(val) = std::env::var("PIPELINE_SCHEDULE") {
            self.schedule = val;
        }

        if let Ok(val) = std::env::var("PIPELINE_START_DATE") {
            self.start_date = parse_env_value(&val, "PIPELINE_START_DATE")?;
        }

        if let Ok(val) = std::env::var("PIPELINE_CATCHUP") {
            self.catchup = parse_env_bool(&val, "PIPELINE_CATCHUP")?;
        }

        // Failure handling
        if let Ok(val) = std::env::var("PIPELINE_MAX_ATTEMPTS") {
            self.max_attempts = parse_env_value(&val, "PIPELINE_MAX_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("PIPELINE_RETRY_DELAY_SECS") {
            self.retry_delay_secs = parse_env_value(&val, "PIPELINE_RETRY_DELAY_SECS")?;
        }

        if let Ok(val) = std::env::var("PIPELINE_CLEANUP_ON_FAILURE") {
            self.cleanup_on_failure = parse_env_bool(&val, "PIPELINE_CLEANUP_ON_FAILURE")?;
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("orders_file_path", &self.orders_file_path),
            ("orders_file_conn", &self.orders_file_conn),
            ("warehouse_conn", &self.warehouse_conn),
            ("warehouse_url", &self.warehouse_url),
            ("customers_table", &self.customers_table),
            ("reporting_table", &self.reporting_table),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} cannot be empty",
                    name
                )));
            }
        }

        if self.customers_table == self.reporting_table {
            return Err(ConfigError::ValidationFailed(
                "customers_table and reporting_table must differ".to_string(),
            ));
        }

        if !self.amount_threshold.is_finite() {
            return Err(ConfigError::ValidationFailed(
                "amount_threshold must be a finite number".to_string(),
            ));
        }

        if let Err(e) = self.schedule.parse::<Cadence>() {
            return Err(ConfigError::ValidationFailed(format!("schedule: {}", e)));
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// The orders file as a [`FileRef`].
    pub fn orders_file(&self) -> FileRef {
        FileRef::new(self.orders_file_path.clone(), self.orders_file_conn.as_str())
    }

    pub fn customers(&self) -> TableRef {
        TableRef::named(self.customers_table.clone(), self.warehouse_conn.as_str())
    }

    pub fn reporting(&self) -> TableRef {
        TableRef::named(self.reporting_table.clone(), self.warehouse_conn.as_str())
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            cleanup_on_failure: self.cleanup_on_failure,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_secs(self.retry_delay_secs))
    }

    /// Builds the run schedule.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if `schedule` is not a known cadence.
    pub fn schedule(&self) -> Result<Schedule, ConfigError> {
        let cadence = self
            .schedule
            .parse::<Cadence>()
            .map_err(|e| ConfigError::InvalidValue {
                key: "schedule".to_string(),
                message: e.to_string(),
            })?;
        Ok(Schedule::new(cadence, self.start_date).with_catchup(self.catchup))
    }

    /// Builder method to set the orders file location.
    pub fn with_orders_file(mut self, path: impl Into<String>, conn: impl Into<String>) -> Self {
        self.orders_file_path = path.into();
        self.orders_file_conn = conn.into();
        self
    }

    /// Builder method to set the object store root directory.
    pub fn with_object_store_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.object_store_root = root.into();
        self
    }

    /// Builder method to set the warehouse connection name.
    pub fn with_warehouse_conn(mut self, conn: impl Into<String>) -> Self {
        self.warehouse_conn = conn.into();
        self
    }

    /// Builder method to set the warehouse URL.
    pub fn with_warehouse_url(mut self, url: impl Into<String>) -> Self {
        self.warehouse_url = url.into();
        self
    }

    pub fn with_customers_table(mut self, name: impl Into<String>) -> Self {
        self.customers_table = name.into();
        self
    }

    pub fn with_reporting_table(mut self, name: impl Into<String>) -> Self {
        self.reporting_table = name.into();
        self
    }

    /// Builder method to set the filter threshold.
    pub fn with_amount_threshold(mut self, threshold: f64) -> Self {
        self.amount_threshold = threshold;
        self
    }

    /// Builder method to set the schedule expression.
    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = schedule.into();
        self
    }

    pub fn with_start_date(mut self, date: NaiveDate) -> Self {
        self.start_date = date;
        self
    }

    pub fn with_catchup(mut self, catchup: bool) -> Self {
        self.catchup = catchup;
        self
    }

    /// Builder method to set attempts per run.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_secs = delay.as_secs();
        self
    }

    /// Builder method to enable cleanup after failed runs.
    pub fn with_cleanup_on_failure(mut self, enabled: bool) -> Self {
        self.cleanup_on_failure = enabled;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
