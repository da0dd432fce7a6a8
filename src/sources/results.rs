//! Findings and the result store interface

use std::sync::Arc;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ScanResult;
use super::programs::{RuleOutcome, UnitResult};

/// Lazily yielded risks of one task
pub type RiskStream = BoxStream<'static, Risk>;

/// A finding emitted by applying a rule to a program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Risk {
    pub rule_name: String,
    pub program_name: String,
    pub title: String,
    #[serde(default)]
    pub severity: String,
    /// Source location, e.g. `src/Main.java:42`
    #[serde(default)]
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Risk {
    pub fn new(
        rule_name: impl Into<String>,
        program_name: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            rule_name: rule_name.into(),
            program_name: program_name.into(),
            title: title.into(),
            severity: String::new(),
            location: String::new(),
            detail: None,
        }
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn with_severity(mut self, severity: impl Into<String>) -> Self {
        self.severity = severity.into();
        self
    }

    /// Identity used to match the same finding across two scans.
    ///
    /// Severity and detail are excluded: a rule update that re-grades a
    /// finding does not make it new.
    pub fn identity_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [&self.rule_name, &self.program_name, &self.title, &self.location] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Persistence for unit results and their risks
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn save(&self, task_id: &str, outcome: &RuleOutcome) -> ScanResult<()>;

    /// All risks saved for `task_id`, in save order
    async fn risks(&self, task_id: &str) -> ScanResult<RiskStream>;
}

/// Result store held in memory, keyed by task id
#[derive(Debug, Default, Clone)]
pub struct MemoryResultStore {
    results: Arc<DashMap<String, Vec<UnitResult>>>,
    risks: Arc<DashMap<String, Vec<Risk>>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results_for(&self, task_id: &str) -> Vec<UnitResult> {
        self.results
            .get(task_id)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    pub fn risk_count(&self, task_id: &str) -> usize {
        self.risks.get(task_id).map(|r| r.len()).unwrap_or(0)
    }

    /// Seed risks directly (baselines imported from elsewhere)
    pub fn insert_risks(&self, task_id: &str, risks: impl IntoIterator<Item = Risk>) {
        self.risks.entry(task_id.to_string()).or_default().extend(risks);
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn save(&self, task_id: &str, outcome: &RuleOutcome) -> ScanResult<()> {
        self.results
            .entry(task_id.to_string())
            .or_default()
            .push(outcome.result.clone());
        if !outcome.risks.is_empty() {
            self.insert_risks(task_id, outcome.risks.iter().cloned());
        }
        Ok(())
    }

    async fn risks(&self, task_id: &str) -> ScanResult<RiskStream> {
        let risks = self
            .risks
            .get(task_id)
            .map(|r| r.value().clone())
            .unwrap_or_default();
        Ok(stream::iter(risks).boxed())
    }
}
