//! Structured outcome of a refresh run

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::context::RefreshMode;
use crate::model::TableType;

/// Stage of a subject's refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshState {
    Planning,
    Populating,
    Validating,
    Swapping,
    Done,
    Failed,
}

impl fmt::Display for RefreshState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Populating => "populating",
            Self::Validating => "validating",
            Self::Swapping => "swapping",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Nothing failed
    Succeeded,
    /// Some subjects failed, others succeeded
    CompletedWithFailures,
    /// Subjects failed and none was published
    Failed,
}

/// A subject whose table was published
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SucceededSubject {
    pub subject: String,
    pub table: String,
    pub table_type: TableType,
    /// Partition keys that were written
    pub partitions: Vec<String>,
    pub elapsed_ms: u64,
}

/// A subject left untouched
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedSubject {
    pub subject: String,
    pub table: String,
    pub reason: String,
}

/// A subject whose refresh failed; its published table is unchanged
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedSubject {
    pub subject: String,
    pub table: String,
    /// Stage the failure happened in
    pub state: RefreshState,
    pub reason: String,
}

/// Report handed back to the trigger
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub run_id: Uuid,
    pub mode: RefreshMode,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
    pub elapsed_ms: u64,
    pub succeeded: Vec<SucceededSubject>,
    pub skipped: Vec<SkippedSubject>,
    pub failed: Vec<FailedSubject>,
}

impl RefreshReport {
    pub(crate) fn new(run_id: Uuid, mode: RefreshMode, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            mode,
            started_at,
            status: RunStatus::Succeeded,
            elapsed_ms: 0,
            succeeded: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Derive the status and record the run duration
    pub(crate) fn finish(&mut self, elapsed: Duration) {
        self.elapsed_ms = millis(elapsed);
        self.status = if self.failed.is_empty() {
            RunStatus::Succeeded
        } else if self.succeeded.is_empty() {
            RunStatus::Failed
        } else {
            RunStatus::CompletedWithFailures
        };
        self.succeeded.sort_by(|a, b| a.table.cmp(&b.table));
        self.skipped.sort_by(|a, b| a.table.cmp(&b.table));
        self.failed.sort_by(|a, b| a.table.cmp(&b.table));
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Render as pretty JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

pub(crate) fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
