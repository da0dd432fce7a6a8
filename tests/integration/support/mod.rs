//! Collaborators shared by the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};

use rulescan::control::{ExecResult, ScanResponse};
use rulescan::scan::{OrchestratorConfig, ScanContext, TaskRegistry};
use rulescan::sources::{
    MemoryResultStore, MemoryRuleStore, ProgramLoader, ProgramUnit, Risk, Rule, RuleOutcome, UnitResult,
};
use rulescan::task::{MemoryTaskStore, TaskRecord, TaskStore};
use rulescan::{ScanError, ScanResult};

/// Admits one unit of work per permit; starts closed
#[derive(Clone)]
pub struct Turnstile {
    permits: Arc<Semaphore>,
}

impl Turnstile {
    pub fn closed() -> Self {
        Self { permits: Arc::new(Semaphore::new(0)) }
    }

    pub fn open() -> Self {
        let turnstile = Self::closed();
        turnstile.release(Semaphore::MAX_PERMITS / 2);
        turnstile
    }

    pub fn release(&self, units: usize) {
        self.permits.add_permits(units);
    }

    async fn pass(&self) -> ScanResult<()> {
        self.permits
            .acquire()
            .await
            .map_err(|e| ScanError::rule_execution("turnstile", "closed", e.to_string()))?
            .forget();
        Ok(())
    }
}

/// Program that logs every applied unit and reports one risk per rule,
/// plus a second one when `extra_risk` is set
pub struct ScriptedProgram {
    name: String,
    language: Option<String>,
    turnstile: Turnstile,
    applied: Arc<Mutex<Vec<String>>>,
    entered: Arc<AtomicUsize>,
    extra_risk: Arc<AtomicBool>,
}

#[async_trait]
impl ProgramUnit for ScriptedProgram {
    fn name(&self) -> &str {
        &self.name
    }

    fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    async fn apply_rule(&self, rule: &Rule) -> ScanResult<RuleOutcome> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        self.turnstile.pass().await?;
        self.applied.lock().push(format!("{}@{}", rule.name, self.name));
        if rule.name.starts_with("broken") {
            return Err(ScanError::rule_execution(&rule.name, &self.name, "engine rejected rule"));
        }

        let mut risks = vec![Risk::new(&rule.name, &self.name, "finding").at("line 1")];
        if self.extra_risk.load(Ordering::SeqCst) {
            risks.push(Risk::new(&rule.name, &self.name, "finding").at("line 2"));
        }
        Ok(RuleOutcome {
            result: UnitResult::new(&rule.name, &self.name),
            risks,
        })
    }
}

#[derive(Clone)]
pub struct ScriptedLoader {
    pub turnstile: Turnstile,
    /// `rule@program` for every unit that got past the turnstile
    pub applied: Arc<Mutex<Vec<String>>>,
    /// Units that reached the turnstile
    pub entered: Arc<AtomicUsize>,
    pub extra_risk: Arc<AtomicBool>,
}

impl ScriptedLoader {
    pub fn new(turnstile: Turnstile) -> Self {
        Self {
            turnstile,
            applied: Arc::new(Mutex::new(Vec::new())),
            entered: Arc::new(AtomicUsize::new(0)),
            extra_risk: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().clone()
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProgramLoader for ScriptedLoader {
    async fn load(&self, name: &str) -> ScanResult<Arc<dyn ProgramUnit>> {
        if name.starts_with("missing") {
            return Err(ScanError::program_load(name, "no such program"));
        }
        let language = name.split_once('.').map(|(_, ext)| ext.to_string());
        Ok(Arc::new(ScriptedProgram {
            name: name.to_string(),
            language,
            turnstile: self.turnstile.clone(),
            applied: Arc::clone(&self.applied),
            entered: Arc::clone(&self.entered),
            extra_risk: Arc::clone(&self.extra_risk),
        }))
    }
}

/// A registry over in-memory stores plus handles to observe it
pub struct Harness {
    pub registry: Arc<TaskRegistry>,
    pub loader: ScriptedLoader,
    pub tasks: MemoryTaskStore,
    pub results: Arc<MemoryResultStore>,
}

impl Harness {
    pub fn new(rules: Vec<Rule>, turnstile: Turnstile) -> Self {
        Self::with_config(rules, turnstile, OrchestratorConfig::default())
    }

    pub fn with_config(rules: Vec<Rule>, turnstile: Turnstile, config: OrchestratorConfig) -> Self {
        let loader = ScriptedLoader::new(turnstile);
        let tasks = MemoryTaskStore::new();
        let results = Arc::new(MemoryResultStore::new());
        let ctx = ScanContext::new(
            Arc::new(MemoryRuleStore::with_rules(rules)),
            Arc::new(loader.clone()),
            results.clone(),
            Arc::new(tasks.clone()),
        );
        Self {
            registry: Arc::new(TaskRegistry::new(ctx, config)),
            loader,
            tasks,
            results,
        }
    }

    pub fn turnstile(&self) -> &Turnstile {
        &self.loader.turnstile
    }

    pub fn applied(&self) -> Vec<String> {
        self.loader.applied()
    }

    pub fn set_extra_risk(&self, extra: bool) {
        self.loader.extra_risk.store(extra, Ordering::SeqCst);
    }

    pub async fn persisted(&self, task_id: &str) -> TaskRecord {
        self.tasks
            .load_task(task_id)
            .await
            .expect("task store read")
            .expect("task persisted")
    }
}

pub fn rules(names: &[&str]) -> Vec<Rule> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| Rule::new(i as u64 + 1, *name))
        .collect()
}

/// Receive until a response satisfies `pred`, returning everything seen
pub async fn recv_until<F>(rx: &mut mpsc::Receiver<ScanResponse>, mut pred: F) -> Vec<ScanResponse>
where
    F: FnMut(&ScanResponse) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let response = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a response")
            .expect("response stream closed");
        let done = pred(&response);
        seen.push(response);
        if done {
            return seen;
        }
    }
}

pub fn is_progress_for(unit: u64) -> impl FnMut(&ScanResponse) -> bool {
    move |response| matches!(response.exec_result, Some(ExecResult::Progress { unit_index, .. }) if unit_index == unit)
}

pub fn progress_units(responses: &[ScanResponse]) -> Vec<u64> {
    responses
        .iter()
        .filter_map(|r| match r.exec_result {
            Some(ExecResult::Progress { unit_index, .. }) => Some(unit_index),
            _ => None,
        })
        .collect()
}

/// Poll until `cond` holds
pub async fn eventually<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition never became true");
}
