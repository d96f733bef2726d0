//! CLI command definitions for customer-orders.
//!
//! - `run`: execute the pipeline once now
//! - `schedule`: run the pipeline on its schedule until Ctrl-C
//! - `plan`: print the task graph
//! - `seed`: load a local CSV into a named warehouse table

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{NaiveDate, NaiveTime};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::metrics::{export_metrics, init_metrics};
use crate::pipeline::{
    build_pipeline, PipelineConfig, PipelineRunner, PurchaseDates, RunReport, StageStatus,
};
use crate::pipeline::customer_orders::{EXTRACT_PURCHASE_DATES, MERGE_REPORTING};
use crate::scheduler::Scheduler;
use crate::storage::{decode_csv, LocalObjectStore};
use crate::warehouse::{SqliteWarehouse, TableRef, Warehouse};

/// Customer orders pipeline: load, filter, join, merge and extract.
#[derive(Parser)]
#[command(name = "customer-orders")]
#[command(about = "Run the customer orders pipeline against a SQLite warehouse")]
#[command(version)]
#[command(
    long_about = "customer-orders loads the orders CSV from object storage, keeps orders above the amount threshold, joins them with customers, merges the result into the reporting table and extracts purchase dates.\n\nExample usage:\n  customer-orders seed --table customers_table ./customers.csv\n  customer-orders run --logical-date 2023-01-01\n  customer-orders schedule"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file. Environment variables override its values.
    #[arg(short, long, env = "PIPELINE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// SQLite warehouse URL, overriding the configuration.
    #[arg(long, global = true)]
    pub warehouse_url: Option<String>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    pub json: bool,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Execute the pipeline once.
    Run(RunArgs),

    /// Run the pipeline on its schedule until interrupted.
    Schedule(ScheduleArgs),

    /// Print the task graph without running it.
    Plan,

    /// Load a local CSV file into a named warehouse table.
    Seed(SeedArgs),
}

/// Arguments for `customer-orders run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Logical date of the run (YYYY-MM-DD).
    #[arg(long)]
    pub logical_date: Option<NaiveDate>,

    /// Drop ephemeral tables even if the run fails.
    #[arg(long)]
    pub cleanup_on_failure: bool,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `customer-orders schedule`.
#[derive(Parser, Debug)]
pub struct ScheduleArgs {
    /// Maximum seconds between schedule checks.
    #[arg(long, default_value = "60")]
    pub poll_interval: u64,
}

/// Arguments for `customer-orders seed`.
#[derive(Parser, Debug)]
pub struct SeedArgs {
    /// Target table name.
    #[arg(short, long)]
    pub table: String,

    /// Local CSV file with a header row.
    pub file: PathBuf,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(url) = &cli.warehouse_url {
        config.warehouse_url = url.clone();
    }

    match cli.command {
        Commands::Run(args) => run_pipeline_command(config, args, cli.json).await,
        Commands::Schedule(args) => run_schedule_command(config, args).await,
        Commands::Plan => run_plan_command(&config, cli.json),
        Commands::Seed(args) => run_seed_command(&config, args, cli.json).await,
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    let config = match path {
        Some(path) => PipelineConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => PipelineConfig::from_env().context("Invalid configuration in environment")?,
    };
    Ok(config)
}

async fn open_runner(config: &PipelineConfig) -> anyhow::Result<PipelineRunner> {
    let warehouse = SqliteWarehouse::open(&config.warehouse_url, config.warehouse_conn.as_str())
        .await
        .with_context(|| format!("Failed to open warehouse {}", config.warehouse_url))?;
    let store = LocalObjectStore::new(
        config.object_store_root.clone(),
        config.orders_file_conn.as_str(),
    );
    Ok(PipelineRunner::new(Arc::new(warehouse), Arc::new(store)).with_options(config.run_options()))
}

// ============================================================================
// Run
// ============================================================================

async fn run_pipeline_command(
    mut config: PipelineConfig,
    args: RunArgs,
    json: bool,
) -> anyhow::Result<()> {
    if args.cleanup_on_failure {
        config.cleanup_on_failure = true;
    }
    if args.metrics {
        init_metrics().context("Failed to initialize metrics")?;
    }

    let pipeline = build_pipeline(&config)?;
    let runner = open_runner(&config).await?;

    let report = match args.logical_date {
        Some(date) => runner.run_for(&pipeline, date.and_time(NaiveTime::MIN)).await,
        None => runner.run(&pipeline).await,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    if args.metrics {
        print!("{}", export_metrics());
    }

    if let Some(failure) = &report.failure {
        anyhow::bail!(
            "Run {} failed at stage '{}' ({}): {}",
            report.run_id,
            failure.stage,
            failure.kind,
            failure.message
        );
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("\n=== Run {} ===", report.run_id);
    println!("Pipeline:     {}", report.pipeline);
    if let Some(date) = report.logical_date {
        println!("Logical date: {}", date);
    }
    println!("Status:       {}", report.status);
    println!("Duration:     {}ms", report.duration_ms());
    println!();

    for stage in &report.stages {
        let marker = match stage.status {
            StageStatus::Succeeded => "✓",
            StageStatus::Failed => "✗",
        };
        println!(
            "  {} {:<24} {:>8}ms  [{}]",
            marker, stage.name, stage.duration_ms, stage.kind
        );
        if let Some(err) = &stage.error {
            println!("      error: {err}");
        }
    }

    if let Some(merge) = report.merge_report(MERGE_REPORTING) {
        println!(
            "\nMerge: {} inserted, {} updated, {} unchanged",
            merge.inserted, merge.updated, merge.unchanged
        );
    }

    if let Some(values) = report.extracted(EXTRACT_PURCHASE_DATES) {
        println!("Purchase dates: {}", values.len());
        match PurchaseDates::from_values(values) {
            Ok(dates) => {
                if let (Some(first), Some(last)) = (dates.earliest(), dates.latest()) {
                    println!("  range: {} .. {}", first, last);
                }
            }
            Err(e) => warn!(error = %e, "Purchase dates are not all parseable"),
        }
    }

    if !report.leaked_tables.is_empty() {
        println!("\nLeaked ephemeral tables:");
        for table in &report.leaked_tables {
            println!("  {}", table);
        }
    }
}

// ============================================================================
// Schedule
// ============================================================================

async fn run_schedule_command(config: PipelineConfig, args: ScheduleArgs) -> anyhow::Result<()> {
    let pipeline = build_pipeline(&config)?;
    let runner = open_runner(&config).await?;
    let scheduler = Arc::new(
        Scheduler::new(runner, Arc::new(pipeline), config.schedule()?)
            .with_retry_policy(config.retry_policy())
            .with_poll_interval(Duration::from_secs(args.poll_interval.max(1))),
    );

    let looping = Arc::clone(&scheduler);
    let handle = tokio::spawn(async move { looping.run_until_shutdown().await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");
    scheduler.shutdown();

    handle.await??;
    let stats = scheduler.stats();
    info!(
        succeeded = stats.runs_succeeded,
        failed = stats.runs_failed,
        attempts = stats.attempts,
        "Scheduler exited"
    );
    Ok(())
}

// ============================================================================
// Plan
// ============================================================================

#[derive(Debug, Serialize)]
struct PlanOutput<'a> {
    pipeline: &'a str,
    schedule: &'a str,
    start_date: NaiveDate,
    catchup: bool,
    stages: Vec<PlanStage<'a>>,
}

#[derive(Debug, Serialize)]
struct PlanStage<'a> {
    id: usize,
    name: &'a str,
    kind: &'static str,
    upstream: Vec<usize>,
}

fn run_plan_command(config: &PipelineConfig, json: bool) -> anyhow::Result<()> {
    let pipeline = build_pipeline(config)?;

    if json {
        let output = PlanOutput {
            pipeline: pipeline.name(),
            schedule: &config.schedule,
            start_date: config.start_date,
            catchup: config.catchup,
            stages: pipeline
                .stages()
                .map(|(id, node)| PlanStage {
                    id: id.index(),
                    name: &node.name,
                    kind: node.kind.label(),
                    upstream: node.upstream().iter().map(|u| u.index()).collect(),
                })
                .collect(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print!("{}", pipeline);
        println!(
            "schedule {} from {} (catchup: {})",
            config.schedule, config.start_date, config.catchup
        );
    }
    Ok(())
}

// ============================================================================
// Seed
// ============================================================================

#[derive(Debug, Serialize)]
struct SeedOutput {
    table: String,
    rows: usize,
    columns: Vec<String>,
}

async fn run_seed_command(config: &PipelineConfig, args: SeedArgs, json: bool) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let path = args.file.display().to_string();
    let frame = decode_csv(&path, &bytes)?;

    let warehouse = SqliteWarehouse::open(&config.warehouse_url, config.warehouse_conn.as_str())
        .await
        .with_context(|| format!("Failed to open warehouse {}", config.warehouse_url))?;
    let table = TableRef::named(args.table.clone(), config.warehouse_conn.as_str());
    warehouse.load(&frame, &table).await?;
    info!(table = %table, rows = frame.len(), "Seeded table");

    let output = SeedOutput {
        table: args.table,
        rows: frame.len(),
        columns: frame.columns().to_vec(),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("✓ Loaded {} rows into {}", output.rows, output.table);
        println!("  Columns: {}", output.columns.join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_arguments() {
        let cli = Cli::try_parse_from([
            "customer-orders",
            "run",
            "--logical-date",
            "2023-01-01",
            "--json",
            "--warehouse-url",
            "sqlite::memory:",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.warehouse_url.as_deref(), Some("sqlite::memory:"));
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.logical_date, NaiveDate::from_ymd_opt(2023, 1, 1));
                assert!(!args.cleanup_on_failure);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_seed_arguments() {
        let cli =
            Cli::try_parse_from(["customer-orders", "seed", "-t", "customers_table", "c.csv"])
                .unwrap();
        match cli.command {
            Commands::Seed(args) => {
                assert_eq!(args.table, "customers_table");
                assert_eq!(args.file, PathBuf::from("c.csv"));
            }
            _ => panic!("expected seed"),
        }
    }

    #[test]
    fn test_plan_json() {
        assert!(run_plan_command(&PipelineConfig::default(), true).is_ok());
    }

    #[tokio::test]
    async fn test_seed_then_run_against_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("warehouse.db").display());
        let store_root = dir.path().join("store");
        std::fs::create_dir_all(store_root.join("sanketh-astrosdk")).unwrap();
        std::fs::write(
            store_root.join("sanketh-astrosdk/orders_data_header.csv"),
            "order_id,customer_id,purchase_date,amount,type\n1,9,2023-01-05,200,online\n",
        )
        .unwrap();
        let customers = dir.path().join("customers.csv");
        std::fs::write(&customers, "customer_id,customer_name\n9,Alice\n").unwrap();
        let reporting = dir.path().join("reporting.csv");
        std::fs::write(
            &reporting,
            "customer_id,customer_name,order_id,purchase_date,amount,type\n",
        )
        .unwrap();

        let config = PipelineConfig::default()
            .with_warehouse_url(url)
            .with_object_store_root(store_root);

        for (table, file) in [("customers_table", customers), ("reporting_table", reporting)] {
            run_seed_command(
                &config,
                SeedArgs {
                    table: table.to_string(),
                    file,
                },
                true,
            )
            .await
            .unwrap();
        }

        let args = RunArgs {
            logical_date: NaiveDate::from_ymd_opt(2023, 1, 1),
            cleanup_on_failure: false,
            metrics: false,
        };
        run_pipeline_command(config, args, true).await.unwrap();
    }
}
