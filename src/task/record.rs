use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sources::RuleFilter;

/// Scan task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Executing,
    Paused,
    Done,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Executing => "executing",
            TaskStatus::Paused => "paused",
            TaskStatus::Done => "done",
            TaskStatus::Error => "error",
        }
    }

    /// Done and Error end a run; only Error can be resumed afterwards
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error)
    }

    pub fn is_resumable(&self) -> bool {
        matches!(self, TaskStatus::Paused | TaskStatus::Error)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "executing" => Ok(TaskStatus::Executing),
            "paused" => Ok(TaskStatus::Paused),
            "done" => Ok(TaskStatus::Done),
            "error" => Ok(TaskStatus::Error),
            _ => Err(format!("Invalid task status: {}. Valid options: executing, paused, done, error", s)),
        }
    }
}

/// Persisted task record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub status: TaskStatus,
    /// Original filter, kept verbatim so resume rebuilds the same rule order
    pub rule_filter: RuleFilter,
    pub programs: Vec<String>,
    pub rules_count: u64,
    pub total_units: u64,
    pub current_unit_index: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub skipped_count: u64,
    pub risk_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub ignore_language: bool,
    #[serde(default)]
    pub show_diff: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_risk_count: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Fresh record for a new task
    pub fn new(
        task_id: impl Into<String>,
        rule_filter: RuleFilter,
        programs: Vec<String>,
        rules_count: u64,
    ) -> Self {
        let now = Utc::now();
        let total_units = rules_count * programs.len() as u64;
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Executing,
            rule_filter,
            programs,
            rules_count,
            total_units,
            current_unit_index: 0,
            success_count: 0,
            failed_count: 0,
            skipped_count: 0,
            risk_count: 0,
            reason: None,
            ignore_language: false,
            show_diff: false,
            baseline_task_id: None,
            new_risk_count: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Units fully processed; the exact resume position
    pub fn current_task_index(&self) -> u64 {
        self.success_count + self.failed_count + self.skipped_count
    }

    pub fn progress(&self) -> f64 {
        progress_fraction(self.current_task_index(), self.total_units)
    }

    /// Copy live counters onto the record
    pub fn apply_counters(&mut self, counters: &CounterSnapshot) {
        self.current_unit_index = counters.current_unit_index;
        self.success_count = counters.success_count;
        self.failed_count = counters.failed_count;
        self.skipped_count = counters.skipped_count;
        self.risk_count = counters.risk_count;
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

pub(crate) fn progress_fraction(processed: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    processed as f64 / total as f64
}

/// Lock-free task counters.
///
/// The execution loop advances `current_unit_index` before recording the
/// unit's outcome and readers load the outcome counters before the index,
/// so every snapshot satisfies `processed <= current_unit_index`.
#[derive(Debug, Default)]
pub struct TaskCounters {
    current_unit_index: AtomicU64,
    success_count: AtomicU64,
    failed_count: AtomicU64,
    skipped_count: AtomicU64,
    risk_count: AtomicU64,
}

impl TaskCounters {
    pub fn from_record(record: &TaskRecord) -> Self {
        let processed = record.current_task_index();
        Self {
            current_unit_index: AtomicU64::new(processed),
            success_count: AtomicU64::new(record.success_count),
            failed_count: AtomicU64::new(record.failed_count),
            skipped_count: AtomicU64::new(record.skipped_count),
            risk_count: AtomicU64::new(record.risk_count),
        }
    }

    /// Claim the next work unit; returns its index
    pub fn begin_unit(&self) -> u64 {
        self.current_unit_index.fetch_add(1, Ordering::SeqCst)
    }

    pub fn record_success(&self, risks: u64) {
        self.risk_count.fetch_add(risks, Ordering::SeqCst);
        self.success_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failure(&self) {
        self.failed_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_skip(&self) {
        self.skipped_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let success_count = self.success_count.load(Ordering::SeqCst);
        let failed_count = self.failed_count.load(Ordering::SeqCst);
        let skipped_count = self.skipped_count.load(Ordering::SeqCst);
        let risk_count = self.risk_count.load(Ordering::SeqCst);
        let current_unit_index = self.current_unit_index.load(Ordering::SeqCst);
        CounterSnapshot {
            current_unit_index,
            success_count,
            failed_count,
            skipped_count,
            risk_count,
        }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub current_unit_index: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub skipped_count: u64,
    pub risk_count: u64,
}

impl CounterSnapshot {
    pub fn processed(&self) -> u64 {
        self.success_count + self.failed_count + self.skipped_count
    }

    pub fn progress(&self, total_units: u64) -> f64 {
        progress_fraction(self.processed(), total_units)
    }
}
