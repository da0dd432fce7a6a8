//! Scan Task Manager
//!
//! Drives one task through its rule×program work list. Work units are
//! visited rule-major (every program for rule 1, then every program for
//! rule 2, ...) so a unit's index is a stable resume position.
//!
//! Each unit goes checkpoint, claim index, execute, persist, notify. The
//! loop only suspends at the checkpoint, so a pause request lands at the
//! next unit boundary while the unit in flight completes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use futures::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::control::messages::{ExecResult, ScanResponse, UnitStatus};
use crate::diff::{compare_task_risks, DiffEngine};
use crate::error::{ScanError, ScanResult};
use crate::sources::{ProgramLoader, ProgramUnit, ResultStore, Rule, RuleFilter, RuleOutcome, RuleStore, RuleStream};
use crate::task::{TaskCounters, TaskQuery, TaskRecord, TaskStatus, TaskStore};
use super::gate::{Checkpoint, CheckpointGate};

/// Reason recorded when a caller stops an executing task
pub const STOPPED_REASON: &str = "stopped before completion";

/// Collaborators shared by every task of a registry
#[derive(Clone)]
pub struct ScanContext {
    pub rules: Arc<dyn RuleStore>,
    pub programs: Arc<dyn ProgramLoader>,
    pub results: Arc<dyn ResultStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub diff: DiffEngine,
}

impl ScanContext {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        programs: Arc<dyn ProgramLoader>,
        results: Arc<dyn ResultStore>,
        tasks: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            rules,
            programs,
            results,
            tasks,
            diff: DiffEngine::default(),
        }
    }

    pub fn with_diff_engine(mut self, diff: DiffEngine) -> Self {
        self.diff = diff;
        self
    }
}

/// Parameters of a new scan
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub rule_filter: RuleFilter,
    pub programs: Vec<String>,
    pub ignore_language: Option<bool>,
    pub show_diff: bool,
    pub baseline_task_id: Option<String>,
}

impl ScanRequest {
    pub fn new<I, S>(rule_filter: RuleFilter, programs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rule_filter,
            programs: programs.into_iter().map(Into::into).collect(),
            ignore_language: None,
            show_diff: false,
            baseline_task_id: None,
        }
    }
}

/// How the execution loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopExit {
    /// Every unit processed
    Completed,
    /// The gate was stopped, by a pause or by the caller
    Interrupted,
}

/// Outcome of one work unit
enum UnitOutcome {
    Success(RuleOutcome),
    Failed(String),
    Skipped(String),
}

impl UnitOutcome {
    fn status(&self) -> UnitStatus {
        match self {
            UnitOutcome::Success(_) => UnitStatus::Success,
            UnitOutcome::Failed(_) => UnitStatus::Failed,
            UnitOutcome::Skipped(_) => UnitStatus::Skipped,
        }
    }
}

/// Program units loaded so far; a failed load is remembered per program
type ProgramCache = HashMap<String, Result<Arc<dyn ProgramUnit>, String>>;

/// In-memory owner of one task
pub struct ScanTaskManager {
    ctx: ScanContext,
    /// Status, reason and configuration; counters live in `counters`
    record: Mutex<TaskRecord>,
    counters: TaskCounters,
    gate: CheckpointGate,
    cancel: CancellationToken,
    /// Serializes saves so they land in order
    persist_lock: tokio::sync::Mutex<()>,
    outbound: mpsc::Sender<ScanResponse>,
    transport_failed: AtomicBool,
    finished: watch::Sender<bool>,
}

impl std::fmt::Debug for ScanTaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanTaskManager")
            .field("task_id", &self.task_id())
            .field("status", &self.status())
            .field("gate", &self.gate.state())
            .finish()
    }
}

impl ScanTaskManager {
    /// Wrap a record whose status is already `Executing`.
    ///
    /// `cancel` is the caller's stop signal; firing it ends the loop at the
    /// next unit boundary.
    pub(crate) fn new(
        ctx: ScanContext,
        record: TaskRecord,
        outbound: mpsc::Sender<ScanResponse>,
        cancel: CancellationToken,
    ) -> Self {
        let counters = TaskCounters::from_record(&record);
        let cancel = cancel.child_token();
        let (finished, _) = watch::channel(false);
        Self {
            ctx,
            record: Mutex::new(record),
            counters,
            gate: CheckpointGate::with_cancellation(cancel.clone()),
            cancel,
            persist_lock: tokio::sync::Mutex::new(()),
            outbound,
            transport_failed: AtomicBool::new(false),
            finished,
        }
    }

    pub fn task_id(&self) -> String {
        self.record.lock().task_id.clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.record.lock().status
    }

    /// Current record with live counters applied
    pub fn snapshot(&self) -> TaskRecord {
        let mut record = self.record.lock().clone();
        record.apply_counters(&self.counters.snapshot());
        record
    }

    pub fn progress(&self) -> f64 {
        let total = self.record.lock().total_units;
        self.counters.snapshot().progress(total)
    }

    pub fn is_pause_requested(&self) -> bool {
        self.gate.is_paused()
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Stop executing further units
    pub fn stop(&self) {
        info!("Stop requested for task {}", self.task_id());
        self.cancel.cancel();
    }

    /// Ask the loop to pause and wait until it has.
    ///
    /// Returns the record as persisted once the loop has let go of the task:
    /// `Paused` when the pause landed at a unit boundary, or whatever status
    /// the run ended with if it finished or was stopped first.
    pub async fn request_pause(&self) -> ScanResult<TaskRecord> {
        let status = self.status();
        if status != TaskStatus::Executing {
            return Err(ScanError::invalid_state(self.task_id(), "pause", status));
        }

        info!("Pause requested for task {}", self.task_id());
        self.gate.pause_and_wait_drain().await;

        let paused = {
            let mut record = self.record.lock();
            let parked = self.gate.waiting() >= 1 && !self.gate.is_stopped();
            if record.status == TaskStatus::Executing && parked {
                record.status = TaskStatus::Paused;
                record.reason = None;
                record.touch();
                true
            } else {
                false
            }
        };
        if paused {
            // Release the parked loop; it exits without touching the status
            self.gate.stop();
        }

        Ok(self.wait().await)
    }

    /// Wait until the loop has exited and its final state is persisted
    pub async fn wait(&self) -> TaskRecord {
        let mut rx = self.finished.subscribe();
        let _ = rx.wait_for(|done| *done).await;
        self.snapshot()
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.send_replace(true);
    }

    /// Announce, wait for an execution permit, run, then settle the status.
    ///
    /// The loop runs in its own task so a panic inside it surfaces here as
    /// a join error and still ends with a persisted `Error` record.
    pub(crate) async fn supervise(self: Arc<Self>, rules: RuleStream, start_index: u64, permits: Arc<Semaphore>) {
        self.announce(start_index).await;

        let permit = tokio::select! {
            permit = permits.acquire_owned() => permit.ok(),
            _ = self.gate.stopped() => None,
        };

        let outcome = match permit {
            Some(_permit) => {
                let runner = Arc::clone(&self);
                match tokio::spawn(async move { runner.run(rules, start_index).await }).await {
                    Ok(result) => result,
                    Err(join_error) => Err(ScanError::from(join_error)),
                }
            }
            None => Ok(LoopExit::Interrupted),
        };

        self.settle(outcome).await;
    }

    async fn announce(&self, start_index: u64) {
        let (task_id, rules_count, total_units) = {
            let record = self.record.lock();
            (record.task_id.clone(), record.rules_count, record.total_units)
        };
        let response = ScanResponse::new(task_id)
            .with_status(TaskStatus::Executing)
            .with_protocol_version()
            .with_exec(ExecResult::Started {
                rules_count,
                total_units,
                start_index,
            });
        self.send(response).await;
    }

    /// The execution loop
    async fn run(&self, mut rules: RuleStream, start_index: u64) -> ScanResult<LoopExit> {
        let (task_id, programs, ignore_language, total_units) = {
            let record = self.record.lock();
            (
                record.task_id.clone(),
                record.programs.clone(),
                record.ignore_language,
                record.total_units,
            )
        };
        if programs.is_empty() {
            return Err(ScanError::configuration("task has no programs"));
        }

        let program_count = programs.len() as u64;
        let skip_rules = start_index / program_count;
        let mut program_offset = (start_index % program_count) as usize;
        for skipped in 0..skip_rules {
            match rules.next().await {
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(ScanError::rule_store(format!(
                        "rule stream ended after {skipped} rules while seeking to unit {start_index}"
                    )))
                }
            }
        }
        debug!("Task {} starting at unit {} (rule offset {}, program offset {})",
               task_id, start_index, skip_rules, program_offset);

        let mut cache = ProgramCache::new();
        while let Some(rule) = rules.next().await {
            let rule = rule?;
            for program in &programs[program_offset..] {
                if self.gate.checkpoint().await == Checkpoint::Stopped {
                    debug!("Task {} interrupted at unit {}", task_id, self.counters.snapshot().current_unit_index);
                    return Ok(LoopExit::Interrupted);
                }

                let unit_index = self.counters.begin_unit();
                let outcome = self.query(&task_id, &rule, program, ignore_language, &mut cache).await;
                self.persist().await?;
                self.notify_unit(&task_id, unit_index, &rule, program, outcome).await;
            }
            program_offset = 0;
        }

        let processed = self.counters.snapshot().processed();
        if processed != total_units {
            return Err(ScanError::rule_store(format!(
                "rule stream ended after {processed} of {total_units} units"
            )));
        }

        match self.diff_against_baseline(&task_id).await {
            Err(ScanError::Cancelled) => {
                debug!("Task {} stopped during baseline diff", task_id);
                Ok(LoopExit::Interrupted)
            }
            diffed => diffed.map(|_| LoopExit::Completed),
        }
    }

    /// Execute one rule×program unit and count its outcome
    async fn query(
        &self,
        task_id: &str,
        rule: &Rule,
        program: &str,
        ignore_language: bool,
        cache: &mut ProgramCache,
    ) -> UnitOutcome {
        let unit = match cache.get(program) {
            Some(loaded) => loaded.clone(),
            None => {
                let loaded = self.ctx.programs.load(program).await.map_err(|e| {
                    warn!("Task {}: {}", task_id, e);
                    e.to_string()
                });
                cache.insert(program.to_string(), loaded.clone());
                loaded
            }
        };
        let unit = match unit {
            Ok(unit) => unit,
            Err(message) => {
                self.counters.record_failure();
                return UnitOutcome::Failed(message);
            }
        };

        if !ignore_language && !rule.applies_to_language(unit.language()) {
            self.counters.record_skip();
            return UnitOutcome::Skipped(format!(
                "rule language {} does not match program language {}",
                rule.language.as_deref().unwrap_or("any"),
                unit.language().unwrap_or("unknown")
            ));
        }

        let outcome = match unit.apply_rule(rule).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Task {}: rule {} failed on {}: {}", task_id, rule.name, program, e);
                self.counters.record_failure();
                return UnitOutcome::Failed(e.to_string());
            }
        };

        if let Err(e) = self.ctx.results.save(task_id, &outcome).await {
            error!("Task {}: failed to save result of {} on {}: {}", task_id, rule.name, program, e);
            self.counters.record_failure();
            return UnitOutcome::Failed(e.to_string());
        }

        self.counters.record_success(outcome.risks.len() as u64);
        UnitOutcome::Success(outcome)
    }

    async fn notify_unit(&self, task_id: &str, unit_index: u64, rule: &Rule, program: &str, outcome: UnitOutcome) {
        let total = self.record.lock().total_units;
        let outcome_status = outcome.status();
        let mut response = ScanResponse::new(task_id).with_status(TaskStatus::Executing);
        let message = match outcome {
            UnitOutcome::Success(RuleOutcome { result, risks }) => {
                response.result = Some(result);
                response.risks = risks;
                None
            }
            UnitOutcome::Failed(message) | UnitOutcome::Skipped(message) => Some(message),
        };
        let response = response.with_exec(ExecResult::Progress {
            progress: self.counters.snapshot().progress(total),
            unit_index,
            rule_name: rule.name.clone(),
            program_name: program.to_string(),
            outcome: outcome_status,
            message,
        });
        self.send(response).await;
    }

    /// Compare this task's risks with a baseline when diffing was requested
    async fn diff_against_baseline(&self, task_id: &str) -> ScanResult<()> {
        let (show_diff, explicit, programs) = {
            let record = self.record.lock();
            (record.show_diff, record.baseline_task_id.clone(), record.programs.clone())
        };
        if !show_diff {
            return Ok(());
        }

        let baseline = match explicit {
            Some(id) => Some(id),
            None => {
                let query = TaskQuery {
                    status: Some(TaskStatus::Done),
                    programs: Some(programs),
                    limit: None,
                };
                self.ctx
                    .tasks
                    .list_tasks(&query)
                    .await?
                    .into_iter()
                    .map(|r| r.task_id)
                    .find(|id| id != task_id)
            }
        };

        let report = compare_task_risks(
            self.ctx.results.as_ref(),
            &self.ctx.diff,
            baseline.as_deref(),
            task_id,
            self.cancel.child_token(),
        )
        .await?;

        {
            let mut record = self.record.lock();
            record.baseline_task_id = report.baseline_task_id.clone();
            record.new_risk_count = Some(report.new_risk_count());
        }
        let response = ScanResponse::new(task_id)
            .with_status(TaskStatus::Executing)
            .with_exec(ExecResult::Diff {
                baseline_task_id: report.baseline_task_id,
                added: report.summary.added,
                removed: report.summary.removed,
                unchanged: report.summary.unchanged,
            });
        self.send(response).await;
        Ok(())
    }

    /// Decide and persist the final status once the loop has exited
    async fn settle(&self, outcome: ScanResult<LoopExit>) {
        self.gate.stop();

        let status = {
            let mut record = self.record.lock();
            if record.status == TaskStatus::Executing {
                match &outcome {
                    Ok(LoopExit::Completed) => {
                        record.status = TaskStatus::Done;
                        record.reason = None;
                    }
                    Ok(LoopExit::Interrupted) => {
                        record.status = TaskStatus::Error;
                        record.reason = Some(STOPPED_REASON.to_string());
                    }
                    Err(e) => {
                        record.status = TaskStatus::Error;
                        record.reason = Some(e.to_string());
                    }
                }
                record.touch();
            }
            record.status
        };

        let record = self.snapshot();
        match status {
            TaskStatus::Done => info!("Task {} done: {} succeeded, {} failed, {} skipped, {} risks",
                                      record.task_id, record.success_count, record.failed_count,
                                      record.skipped_count, record.risk_count),
            TaskStatus::Paused => info!("Task {} paused at unit {}", record.task_id, record.current_task_index()),
            _ => warn!("Task {} ended with error: {}", record.task_id, record.reason.as_deref().unwrap_or("unknown")),
        }

        if let Err(e) = self.persist().await {
            error!("Task {}: failed to persist final status {}: {}", record.task_id, status, e);
        }

        let mut response = ScanResponse::new(record.task_id.clone())
            .with_status(status)
            .with_exec(ExecResult::Finished {
                progress: record.progress(),
                success_count: record.success_count,
                failed_count: record.failed_count,
                skipped_count: record.skipped_count,
                risk_count: record.risk_count,
                new_risk_count: record.new_risk_count,
            });
        response.reason = record.reason;
        self.send(response).await;
    }

    async fn persist(&self) -> ScanResult<()> {
        let _guard = self.persist_lock.lock().await;
        let mut record = self.snapshot();
        record.touch();
        self.ctx.tasks.save_task(&record).await
    }

    /// Deliver a response; a closed transport is logged once and ignored
    async fn send(&self, response: ScanResponse) {
        if self.outbound.send(response).await.is_err()
            && !self.transport_failed.swap(true, Ordering::SeqCst)
        {
            warn!("Task {}: response stream closed; continuing without notifications", self.task_id());
        }
    }
}
