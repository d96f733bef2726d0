//! Scheduler service: fires pipeline runs on the schedule.
//!
//! # Features
//!
//! - Fixed cadence with optional catch-up (see [`Schedule`])
//! - Run-level retries (see [`RetryPolicy`])
//! - A run lock so at most one run executes at a time
//! - Graceful shutdown with a broadcast channel; a run in progress is never
//!   interrupted

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::pipeline::{Pipeline, PipelineRunner, RunReport};

use super::cadence::Schedule;
use super::retry::RetryPolicy;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}

/// One scheduled run, possibly after several attempts.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub logical_date: NaiveDateTime,
    pub attempts: u32,
    /// Report of the last attempt.
    pub report: RunReport,
}

impl RunRecord {
    pub fn is_success(&self) -> bool {
        self.report.is_success()
    }
}

/// Statistics about scheduled runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    /// Attempts across all runs, retries included.
    pub attempts: u64,
}

#[derive(Default)]
struct SharedStats {
    runs_succeeded: AtomicU64,
    runs_failed: AtomicU64,
    attempts: AtomicU64,
}

impl SharedStats {
    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            runs_succeeded: self.runs_succeeded.load(Ordering::SeqCst),
            runs_failed: self.runs_failed.load(Ordering::SeqCst),
            attempts: self.attempts.load(Ordering::SeqCst),
        }
    }
}

/// Runs a pipeline on a schedule.
pub struct Scheduler {
    runner: PipelineRunner,
    pipeline: Arc<Pipeline>,
    schedule: Schedule,
    retry: RetryPolicy,
    /// Held for the duration of a run; stores the last logical date run.
    run_lock: Mutex<Option<NaiveDateTime>>,
    poll_interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
    stop_requested: AtomicBool,
    is_running: AtomicBool,
    stats: SharedStats,
}

impl Scheduler {
    pub fn new(runner: PipelineRunner, pipeline: Arc<Pipeline>, schedule: Schedule) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            runner,
            pipeline,
            schedule,
            retry: RetryPolicy::none(),
            run_lock: Mutex::new(None),
            poll_interval: Duration::from_secs(60),
            shutdown_tx,
            stop_requested: AtomicBool::new(false),
            is_running: AtomicBool::new(false),
            stats: SharedStats::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Upper bound on how long the loop sleeps between schedule checks.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Marks `logical_date` as already run, so earlier intervals are not due.
    pub async fn with_last_run(self, logical_date: NaiveDateTime) -> Self {
        *self.run_lock.lock().await = Some(logical_date);
        self
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub async fn last_run(&self) -> Option<NaiveDateTime> {
        *self.run_lock.lock().await
    }

    /// Runs the pipeline for `logical_date`, retrying per the policy.
    ///
    /// Waits for any run already in progress to finish first.
    pub async fn run_once(&self, logical_date: NaiveDateTime) -> RunRecord {
        let mut last_run = self.run_lock.lock().await;
        let record = self.attempt(logical_date).await;
        if last_run.map_or(true, |last| logical_date > last) {
            *last_run = Some(logical_date);
        }
        record
    }

    async fn attempt(&self, logical_date: NaiveDateTime) -> RunRecord {
        let mut attempt = 1;
        loop {
            self.stats.attempts.fetch_add(1, Ordering::SeqCst);
            let report = self.runner.run_for(&self.pipeline, logical_date).await;

            if report.is_success() || !self.retry.should_retry(attempt) {
                let counter = if report.is_success() {
                    &self.stats.runs_succeeded
                } else {
                    &self.stats.runs_failed
                };
                counter.fetch_add(1, Ordering::SeqCst);
                return RunRecord {
                    logical_date,
                    attempts: attempt,
                    report,
                };
            }

            warn!(
                logical_date = %logical_date,
                attempt = attempt,
                max_attempts = self.retry.max_attempts(),
                error = report.failure.as_ref().map(|f| f.message.as_str()).unwrap_or(""),
                "Run failed, retrying"
            );
            tokio::time::sleep(self.retry.delay()).await;
            attempt += 1;
        }
    }

    /// Runs every interval due at `now`, oldest first.
    pub async fn tick(&self, now: NaiveDateTime) -> Vec<RunRecord> {
        let last_run = self.last_run().await;
        let due = self.schedule.due(last_run, now);
        if due.is_empty() {
            debug!(now = %now, "No runs due");
        }

        let mut records = Vec::with_capacity(due.len());
        for logical_date in due {
            info!(logical_date = %logical_date, "Scheduled run due");
            records.push(self.run_once(logical_date).await);
        }
        records
    }

    /// Runs the schedule until [`shutdown`](Self::shutdown) is called.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::AlreadyRunning` if the loop is already active.
    pub async fn run_until_shutdown(&self) -> Result<(), SchedulerError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(
            pipeline = self.pipeline.name(),
            cadence = %self.schedule.cadence(),
            catchup = self.schedule.catchup(),
            "Scheduler started"
        );

        while !self.stop_requested.load(Ordering::SeqCst) {
            let now = Utc::now().naive_utc();
            self.tick(now).await;

            let until_next = (self.schedule.next_fire(now) - Utc::now().naive_utc())
                .to_std()
                .unwrap_or(Duration::ZERO);
            let wait = until_next.min(self.poll_interval);
            debug!(wait_ms = wait.as_millis() as u64, "Scheduler sleeping");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!("Scheduler stopped");
        Ok(())
    }

    /// Asks the loop to stop after the current run, if any.
    pub fn shutdown(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        // No receiver just means the loop is not running.
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{build_pipeline, PipelineConfig};
    use crate::scheduler::Cadence;
    use crate::storage::MemoryObjectStore;
    use crate::warehouse::MemoryWarehouse;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn scheduler_without_source() -> Scheduler {
        let config = PipelineConfig::default();
        let runner = PipelineRunner::new(
            Arc::new(MemoryWarehouse::new("snowflake_default")),
            Arc::new(MemoryObjectStore::new("aws_default")),
        );
        let pipeline = Arc::new(build_pipeline(&config).unwrap());
        let schedule = Schedule::new(Cadence::Daily, config.start_date);
        Scheduler::new(runner, pipeline, schedule)
    }

    #[tokio::test]
    async fn test_run_once_retries_failed_runs() {
        let scheduler =
            scheduler_without_source().with_retry_policy(RetryPolicy::new(3, Duration::ZERO));
        let record = scheduler.run_once(at(2023, 1, 1)).await;

        assert!(!record.is_success());
        assert_eq!(record.attempts, 3);
        assert_eq!(
            scheduler.stats(),
            SchedulerStats {
                runs_succeeded: 0,
                runs_failed: 1,
                attempts: 3
            }
        );
        assert_eq!(scheduler.last_run().await, Some(at(2023, 1, 1)));
    }

    #[tokio::test]
    async fn test_tick_runs_latest_interval_once() {
        let scheduler = scheduler_without_source();
        let now = at(2023, 1, 10);

        let records = scheduler.tick(now).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].logical_date, at(2023, 1, 9));
        assert_eq!(records[0].report.logical_date, Some(at(2023, 1, 9)));

        assert!(scheduler.tick(now).await.is_empty());
    }

    #[tokio::test]
    async fn test_with_last_run() {
        let scheduler = scheduler_without_source().with_last_run(at(2023, 1, 9)).await;
        assert!(scheduler.tick(at(2023, 1, 10)).await.is_empty());
        assert_eq!(scheduler.tick(at(2023, 1, 11)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let scheduler = Arc::new(
            scheduler_without_source()
                .with_last_run(Utc::now().naive_utc())
                .await,
        );
        let handle = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run_until_shutdown().await })
        };

        scheduler.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
        assert!(result.is_ok());
        assert!(!scheduler.is_running());
    }
}
