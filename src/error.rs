//! Scan Orchestration Error Types
//!
//! Error types for the scan orchestrator, grouped the way callers need to
//! react to them: configuration errors are returned synchronously before any
//! execution begins, per-unit errors are counted and reported, loop errors
//! move a task to `Error`, and transport errors are logged.

use thiserror::Error;

/// Errors that can occur while orchestrating scans
#[derive(Debug, Error)]
pub enum ScanError {
    /// Invalid request or configuration (rejected before execution)
    #[error("Configuration problem: {0}")]
    Configuration(String),

    /// Resume position beyond the end of the work list
    #[error("Resume index {index} is out of range (total units: {total})")]
    OutOfRange { index: u64, total: u64 },

    /// The task already has a live manager
    #[error("Task {0} is already running")]
    AlreadyRunning(String),

    /// No persisted record for the task
    #[error("Task {0} not found")]
    TaskNotFound(String),

    /// Operation not permitted in the task's current status
    #[error("Task {task_id} cannot {operation} while {status}")]
    InvalidState {
        task_id: String,
        operation: String,
        status: String,
    },

    /// Rule store query failed
    #[error("Rule store error: {0}")]
    RuleStore(String),

    /// Program unit could not be loaded
    #[error("Failed to load program '{program}': {message}")]
    ProgramLoad { program: String, message: String },

    /// Applying a rule to a program failed
    #[error("Rule '{rule}' failed on program '{program}': {message}")]
    RuleExecution {
        rule: String,
        program: String,
        message: String,
    },

    /// Result persistence failed
    #[error("Result store error: {0}")]
    ResultStore(String),

    /// Task record persistence failed
    #[error("Task store error: {0}")]
    TaskStore(String),

    /// Sending to or receiving from the control stream failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Cancellation was requested
    #[error("Scan was cancelled")]
    Cancelled,

    /// Wrapped errors from other sources
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ScanError {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a rule store error
    pub fn rule_store(msg: impl Into<String>) -> Self {
        Self::RuleStore(msg.into())
    }

    /// Create a program load error
    pub fn program_load(program: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ProgramLoad {
            program: program.into(),
            message: msg.into(),
        }
    }

    /// Create a rule execution error
    pub fn rule_execution(
        rule: impl Into<String>,
        program: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::RuleExecution {
            rule: rule.into(),
            program: program.into(),
            message: msg.into(),
        }
    }

    /// Create a result store error
    pub fn result_store(msg: impl Into<String>) -> Self {
        Self::ResultStore(msg.into())
    }

    /// Create a task store error
    pub fn task_store(msg: impl Into<String>) -> Self {
        Self::TaskStore(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(
        task_id: impl Into<String>,
        operation: impl Into<String>,
        status: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidState {
            task_id: task_id.into(),
            operation: operation.into(),
            status: status.to_string(),
        }
    }

    /// Errors a caller gets back synchronously, before anything runs
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::OutOfRange { .. }
                | Self::AlreadyRunning(_)
                | Self::TaskNotFound(_)
                | Self::InvalidState { .. }
        )
    }
}

/// Result type for scan orchestration
pub type ScanResult<T> = Result<T, ScanError>;

impl From<std::io::Error> for ScanError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => {
                Self::TaskStore(format!("File or directory not found: {error}"))
            }
            std::io::ErrorKind::PermissionDenied => {
                Self::TaskStore(format!("Permission denied: {error}"))
            }
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => {
                Self::Transport(error.to_string())
            }
            _ => Self::Other(anyhow::anyhow!("I/O error: {error}")),
        }
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(error: serde_json::Error) -> Self {
        Self::Other(anyhow::anyhow!("Serialization error: {error}"))
    }
}

/// A panicked join is how a loop supervisor observes a programmer error
impl From<tokio::task::JoinError> for ScanError {
    fn from(error: tokio::task::JoinError) -> Self {
        if error.is_cancelled() {
            Self::Cancelled
        } else if error.is_panic() {
            let payload = error.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            Self::Other(anyhow::anyhow!("execution loop panicked: {message}"))
        } else {
            Self::Other(anyhow::anyhow!(error.to_string()))
        }
    }
}
