//! Schedule cadence and interval arithmetic.
//!
//! A run covers one schedule interval and is identified by the interval's
//! start, its logical date. The run becomes due once the interval has
//! closed: the `@daily` run for 2023-01-01 fires at 2023-01-02 00:00.

use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unsupported schedule '{0}', expected @daily or @hourly")]
pub struct CadenceError(pub String);

/// How often the pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cadence {
    Hourly,
    Daily,
}

impl Cadence {
    pub fn interval(&self) -> Duration {
        match self {
            Cadence::Hourly => Duration::hours(1),
            Cadence::Daily => Duration::days(1),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Hourly => "@hourly",
            Cadence::Daily => "@daily",
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "@daily" | "daily" => Ok(Cadence::Daily),
            "@hourly" | "hourly" => Ok(Cadence::Hourly),
            _ => Err(CadenceError(s.to_string())),
        }
    }
}

/// A cadence anchored at a start date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    cadence: Cadence,
    start: NaiveDateTime,
    catchup: bool,
}

impl Schedule {
    /// Schedule whose first interval starts at midnight of `start_date`.
    /// Catch-up is off.
    pub fn new(cadence: Cadence, start_date: NaiveDate) -> Self {
        Self {
            cadence,
            start: start_date.and_time(chrono::NaiveTime::MIN),
            catchup: false,
        }
    }

    pub fn with_catchup(mut self, catchup: bool) -> Self {
        self.catchup = catchup;
        self
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    pub fn catchup(&self) -> bool {
        self.catchup
    }

    /// Start of the most recent interval that has fully closed by `now`.
    pub fn latest_closed(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        let interval = self.cadence.interval();
        let first_close = self.start + interval;
        if now < first_close {
            return None;
        }
        let elapsed = (now - self.start).num_seconds();
        let closed = elapsed / interval.num_seconds();
        Some(self.start + interval * (closed - 1) as i32)
    }

    /// Logical dates that are due at `now`, oldest first.
    ///
    /// Intervals at or before `last_run` are skipped. Without catch-up only
    /// the most recent closed interval is returned.
    pub fn due(&self, last_run: Option<NaiveDateTime>, now: NaiveDateTime) -> Vec<NaiveDateTime> {
        let Some(latest) = self.latest_closed(now) else {
            return Vec::new();
        };
        if last_run.is_some_and(|last| latest <= last) {
            return Vec::new();
        }
        if !self.catchup {
            return vec![latest];
        }

        let interval = self.cadence.interval();
        let mut next = match last_run {
            Some(last) if last >= self.start => last + interval,
            _ => self.start,
        };
        let mut due = Vec::new();
        while next <= latest {
            due.push(next);
            next += interval;
        }
        due
    }

    /// When the interval open at `now` closes.
    pub fn next_fire(&self, now: NaiveDateTime) -> NaiveDateTime {
        let interval = self.cadence.interval();
        match self.latest_closed(now) {
            Some(latest) => latest + interval + interval,
            None => self.start + interval,
        }
    }
}
