//! Scan Orchestration
//!
//! The checkpoint gate, the per-task manager that drives the rule×program
//! work list through it, and the registry that owns live managers.

pub mod config;
pub mod gate;
pub mod manager;
pub mod registry;

pub use config::{ConfigError, OrchestratorConfig, OrchestratorConfigBuilder};
pub use gate::{Checkpoint, CheckpointGate, GateState};
pub use manager::{ScanContext, ScanRequest, ScanTaskManager, STOPPED_REASON};
pub use registry::TaskRegistry;
