//! Result Diff Engine
//!
//! Classifies the relationship between two result sets by a caller-supplied
//! hash. `engine` is the generic hash join; `risk` applies it to the risks
//! of two scan tasks to report new versus pre-existing findings.

pub mod engine;
pub mod risk;

pub use engine::{DiffEngine, DiffResult, DiffStatus, DiffStream, DiffSummary, HashFn};
pub use risk::{compare_task_risks, RiskDiffReport};
