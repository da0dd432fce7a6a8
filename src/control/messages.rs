//! Control and response message shapes
//!
//! Messages are plain serde structs so any transport that can carry JSON
//! (the line codec, an RPC framework, a websocket) can carry them.

use serde::{Deserialize, Serialize};

use crate::error::{ScanError, ScanResult};
use crate::scan::manager::ScanRequest;
use crate::sources::{Risk, RuleFilter, UnitResult};
use crate::task::{TaskRecord, TaskStatus};

/// Operation selected by an inbound control message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    Start,
    Resume,
    Status,
    Pause,
}

/// Inbound control message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub mode: ControlMode,
    /// Required for resume; optional for status and pause on a stream
    /// that already owns a task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_filter: Option<RuleFilter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub programs: Vec<String>,
    /// Falls back to the orchestrator default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_language: Option<bool>,
    #[serde(default)]
    pub show_diff: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_task_id: Option<String>,
    /// Resume position; defaults to the persisted checkpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<u64>,
}

impl ControlMessage {
    fn with_mode(mode: ControlMode) -> Self {
        Self {
            mode,
            task_id: None,
            rule_filter: None,
            programs: Vec::new(),
            ignore_language: None,
            show_diff: false,
            baseline_task_id: None,
            resume_from: None,
        }
    }

    pub fn start<I, S>(rule_filter: RuleFilter, programs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rule_filter: Some(rule_filter),
            programs: programs.into_iter().map(Into::into).collect(),
            ..Self::with_mode(ControlMode::Start)
        }
    }

    pub fn resume(task_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..Self::with_mode(ControlMode::Resume)
        }
    }

    pub fn status(task_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..Self::with_mode(ControlMode::Status)
        }
    }

    /// Pause the task owned by this stream
    pub fn pause() -> Self {
        Self::with_mode(ControlMode::Pause)
    }

    pub fn from_index(mut self, index: u64) -> Self {
        self.resume_from = Some(index);
        self
    }

    pub fn ignoring_language(mut self, ignore: bool) -> Self {
        self.ignore_language = Some(ignore);
        self
    }

    pub fn with_diff(mut self, baseline_task_id: Option<String>) -> Self {
        self.show_diff = true;
        self.baseline_task_id = baseline_task_id;
        self
    }

    /// Build a start request; filter and programs are mandatory
    pub fn into_request(self) -> ScanResult<ScanRequest> {
        let rule_filter = self
            .rule_filter
            .ok_or_else(|| ScanError::configuration("start requires a rule filter"))?;
        if self.programs.is_empty() {
            return Err(ScanError::configuration("start requires at least one program"));
        }
        Ok(ScanRequest {
            rule_filter,
            programs: self.programs,
            ignore_language: self.ignore_language,
            show_diff: self.show_diff,
            baseline_task_id: self.baseline_task_id,
        })
    }
}

/// How one work unit ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Success,
    Failed,
    Skipped,
}

/// Progress and telemetry carried alongside responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExecResult {
    /// Execution accepted; units from `start_index` will follow
    Started {
        rules_count: u64,
        total_units: u64,
        start_index: u64,
    },
    /// One work unit finished
    Progress {
        progress: f64,
        unit_index: u64,
        rule_name: String,
        program_name: String,
        outcome: UnitStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Risk comparison against a baseline task
    Diff {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        baseline_task_id: Option<String>,
        added: usize,
        removed: usize,
        unchanged: usize,
    },
    /// Final counters when execution leaves `Executing`
    Finished {
        progress: f64,
        success_count: u64,
        failed_count: u64,
        skipped_count: u64,
        risk_count: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_risk_count: Option<u64>,
    },
}

/// Outbound response message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResponse {
    /// Empty when a request was rejected before a task existed
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<UnitResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risks: Vec<Risk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_result: Option<ExecResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<i64>,
    /// Full snapshot, sent in reply to status and pause
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanResponse {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: None,
            result: None,
            risks: Vec::new(),
            exec_result: None,
            protocol_version: None,
            task: None,
            reason: None,
            error: None,
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_exec(mut self, exec: ExecResult) -> Self {
        self.exec_result = Some(exec);
        self
    }

    pub fn with_protocol_version(mut self) -> Self {
        self.protocol_version = Some(crate::version::get_protocol_version());
        self
    }

    /// Status reply carrying the whole record
    pub fn snapshot(record: TaskRecord) -> Self {
        Self {
            status: Some(record.status),
            reason: record.reason.clone(),
            task: Some(record.clone()),
            ..Self::new(record.task_id)
        }
    }

    /// Rejected request
    pub fn rejected(task_id: Option<&str>, error: &ScanError) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(task_id.unwrap_or_default())
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Status messages that end a run on this stream
    pub fn is_final(&self) -> bool {
        self.result.is_none()
            && matches!(self.exec_result, Some(ExecResult::Finished { .. }))
    }
}
