//! Risk diff between two scan tasks

use std::sync::Arc;
use futures::StreamExt;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{ScanError, ScanResult};
use crate::sources::{ResultStore, Risk};
use super::engine::{DiffEngine, DiffResult, DiffSummary, HashFn};

/// Outcome of comparing a task's risks against a baseline task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskDiffReport {
    /// None when there was nothing to compare against
    pub baseline_task_id: Option<String>,
    pub compare_task_id: String,
    pub summary: DiffSummary,
    /// Risks present in the compare task only
    pub new_risks: Vec<Risk>,
}

impl RiskDiffReport {
    pub fn new_risk_count(&self) -> u64 {
        self.summary.added as u64
    }
}

/// Hash function matching the same finding across scans
pub fn risk_hash() -> HashFn<Risk> {
    Arc::new(|risk: &Risk| risk.identity_hash())
}

/// Compare the risks of `compare_task` against `baseline_task`.
///
/// With no baseline every risk of the compare task counts as new. A diff
/// cut short by `cancel` is `ScanError::Cancelled`, never a partial report.
pub async fn compare_task_risks(
    store: &dyn ResultStore,
    engine: &DiffEngine,
    baseline_task: Option<&str>,
    compare_task: &str,
    cancel: CancellationToken,
) -> ScanResult<RiskDiffReport> {
    let compare = store.risks(compare_task).await?;
    let base = match baseline_task {
        Some(id) => store.risks(id).await?,
        None => futures::stream::empty().boxed(),
    };

    let mut report = RiskDiffReport {
        baseline_task_id: baseline_task.map(str::to_string),
        compare_task_id: compare_task.to_string(),
        ..RiskDiffReport::default()
    };

    let mut results = engine.compare(base, compare, Some(risk_hash()), cancel.clone());
    while let Some(result) = results.next().await {
        report.summary.record(&result);
        if let DiffResult::Added { compare, .. } = result {
            report.new_risks.push(compare);
        }
    }
    if cancel.is_cancelled() {
        debug!("Risk diff for {} cancelled after {} results", compare_task, report.summary.total());
        return Err(ScanError::Cancelled);
    }

    match baseline_task {
        Some(base) => info!(
            "Risk diff {} -> {}: {} new, {} resolved, {} unchanged",
            base,
            compare_task,
            report.summary.added,
            report.summary.removed,
            report.summary.unchanged
        ),
        None => debug!("No baseline for {}; all {} risks are new", compare_task, report.summary.added),
    }
    Ok(report)
}
