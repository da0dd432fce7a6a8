//! External Collaborators
//!
//! Narrow interfaces to the services the orchestrator drives but does not
//! own: the rule store, the program loader and the result store. The
//! in-memory implementations are complete enough for embedding and tests.

pub mod rules;
pub mod programs;
pub mod results;

pub use rules::{Rule, RuleFilter, RuleStore, RuleStream, MemoryRuleStore};
pub use programs::{ProgramLoader, ProgramUnit, RuleOutcome, UnitResult};
pub use results::{Risk, RiskStream, ResultStore, MemoryResultStore};
