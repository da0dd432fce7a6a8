//! Program units and the loader that produces them

use std::sync::Arc;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ScanResult;
use super::results::Risk;
use super::rules::Rule;

/// Result record of one rule applied to one program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    pub rule_name: String,
    pub program_name: String,
    /// Free-form output of the rule engine
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl UnitResult {
    pub fn new(rule_name: impl Into<String>, program_name: impl Into<String>) -> Self {
        Self {
            rule_name: rule_name.into(),
            program_name: program_name.into(),
            payload: serde_json::Value::Null,
        }
    }
}

/// Everything applying a rule produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub result: UnitResult,
    #[serde(default)]
    pub risks: Vec<Risk>,
}

/// A compiled, loadable analysis target
#[async_trait]
pub trait ProgramUnit: Send + Sync {
    fn name(&self) -> &str;

    /// Source language, when known
    fn language(&self) -> Option<&str>;

    async fn apply_rule(&self, rule: &Rule) -> ScanResult<RuleOutcome>;
}

/// Loads program units by name
#[async_trait]
pub trait ProgramLoader: Send + Sync {
    async fn load(&self, name: &str) -> ScanResult<Arc<dyn ProgramUnit>>;
}
