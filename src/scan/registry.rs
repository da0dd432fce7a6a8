//! Task Registry
//!
//! Maps task ids to their live managers. A registry is an ordinary value
//! injected where it is needed, so separate registries (one per test, one
//! per embedding service) never share state.

use std::sync::Arc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::control::messages::ScanResponse;
use crate::error::{ScanError, ScanResult};
use crate::sources::{ProgramLoader, ResultStore, RuleStore, RuleStream};
use crate::task::{mark_interrupted, FileTaskStore, MemoryTaskStore, TaskQuery, TaskRecord, TaskStatus, TaskStore};
use crate::diff::DiffEngine;
use super::config::OrchestratorConfig;
use super::manager::{ScanContext, ScanRequest, ScanTaskManager};

pub struct TaskRegistry {
    ctx: ScanContext,
    config: OrchestratorConfig,
    active: Arc<DashMap<String, Arc<ScanTaskManager>>>,
    /// Ids held by a resume between its checks and its claim
    reserved: DashMap<String, ()>,
    /// Bounds concurrently executing loops
    permits: Arc<Semaphore>,
}

/// Holds a task id in `reserved` until dropped
struct Reservation<'a> {
    reserved: &'a DashMap<String, ()>,
    task_id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.reserved.remove(&self.task_id);
    }
}

impl TaskRegistry {
    pub fn new(ctx: ScanContext, config: OrchestratorConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_active_tasks.max(1)));
        Self {
            ctx,
            config,
            active: Arc::new(DashMap::new()),
            reserved: DashMap::new(),
            permits,
        }
    }

    /// Build a registry whose task store follows `config.store_dir`
    pub async fn open(
        config: OrchestratorConfig,
        rules: Arc<dyn RuleStore>,
        programs: Arc<dyn ProgramLoader>,
        results: Arc<dyn ResultStore>,
    ) -> ScanResult<Self> {
        config
            .validate()
            .map_err(|e| ScanError::configuration(e.to_string()))?;
        let tasks: Arc<dyn TaskStore> = match &config.store_dir {
            Some(dir) => Arc::new(FileTaskStore::open(dir).await?),
            None => Arc::new(MemoryTaskStore::new()),
        };
        let ctx = ScanContext::new(rules, programs, results, tasks)
            .with_diff_engine(DiffEngine::new(config.diff_channel_capacity));
        Ok(Self::new(ctx, config))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn context(&self) -> &ScanContext {
        &self.ctx
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<ScanTaskManager>> {
        self.active.get(task_id).map(|m| Arc::clone(m.value()))
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.active.contains_key(task_id) || self.reserved.contains_key(task_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Create and launch a new task.
    ///
    /// Configuration problems are returned before anything is persisted.
    /// Responses for the task, starting with one that carries its id, go
    /// to `outbound`; firing `cancel` stops the task.
    pub async fn start(
        &self,
        request: ScanRequest,
        outbound: mpsc::Sender<ScanResponse>,
        cancel: CancellationToken,
    ) -> ScanResult<Arc<ScanTaskManager>> {
        if request.programs.is_empty() {
            return Err(ScanError::configuration("no programs to scan"));
        }
        let (count, rules) = self.ctx.rules.count_and_yield(&request.rule_filter).await?;
        if count == 0 {
            return Err(ScanError::configuration("rule filter matched no rules"));
        }

        let task_id = Uuid::now_v7().to_string();
        let mut record = TaskRecord::new(&task_id, request.rule_filter, request.programs, count as u64);
        record.ignore_language = request.ignore_language.unwrap_or(self.config.ignore_language);
        record.show_diff = request.show_diff;
        record.baseline_task_id = request.baseline_task_id;

        self.ctx.tasks.save_task(&record).await?;
        info!("Starting task {}: {} rules x {} programs = {} units",
              task_id, record.rules_count, record.programs.len(), record.total_units);

        let manager = Arc::new(ScanTaskManager::new(self.ctx.clone(), record, outbound, cancel));
        self.claim(&task_id, &manager)?;
        self.launch(task_id, Arc::clone(&manager), rules, 0);
        Ok(manager)
    }

    /// Reload a `Paused` or `Error` task and continue it.
    ///
    /// `from` defaults to the persisted checkpoint. A later index counts the
    /// units in between as skipped; an earlier one would repeat units and is
    /// rejected. The id stays reserved from the first check until the new
    /// manager is live, so a concurrent resume of the same task fails with
    /// `AlreadyRunning` instead of reading a record that is about to change.
    pub async fn resume(
        &self,
        task_id: &str,
        from: Option<u64>,
        outbound: mpsc::Sender<ScanResponse>,
        cancel: CancellationToken,
    ) -> ScanResult<Arc<ScanTaskManager>> {
        let _reservation = self.reserve(task_id)?;
        let mut record = self
            .ctx
            .tasks
            .load_task(task_id)
            .await?
            .ok_or_else(|| ScanError::TaskNotFound(task_id.to_string()))?;
        if !record.status.is_resumable() {
            return Err(ScanError::invalid_state(task_id, "resume", record.status));
        }

        let checkpoint = record.current_task_index();
        let from = from.unwrap_or(checkpoint);
        if from > record.total_units {
            return Err(ScanError::OutOfRange {
                index: from,
                total: record.total_units,
            });
        }
        if from < checkpoint {
            return Err(ScanError::configuration(format!(
                "resume index {from} is before checkpoint {checkpoint}; units would run twice"
            )));
        }

        let (count, rules) = self.ctx.rules.count_and_yield(&record.rule_filter).await?;
        if count as u64 != record.rules_count {
            return Err(ScanError::configuration(format!(
                "rule set changed since task {} started ({} rules, now {})",
                task_id, record.rules_count, count
            )));
        }

        record.skipped_count += from - checkpoint;
        record.current_unit_index = from;
        record.status = TaskStatus::Executing;
        record.reason = None;
        record.new_risk_count = None;
        record.touch();

        let manager = Arc::new(ScanTaskManager::new(self.ctx.clone(), record.clone(), outbound, cancel));
        self.claim(task_id, &manager)?;
        if let Err(e) = self.ctx.tasks.save_task(&record).await {
            self.active.remove(task_id);
            return Err(e);
        }
        info!("Resuming task {} at unit {} of {}", task_id, from, record.total_units);

        self.launch(task_id.to_string(), Arc::clone(&manager), rules, from);
        Ok(manager)
    }

    /// Live snapshot when the task is running, else the persisted record
    pub async fn status(&self, task_id: &str) -> ScanResult<TaskRecord> {
        if let Some(manager) = self.get(task_id) {
            return Ok(manager.snapshot());
        }
        self.ctx
            .tasks
            .load_task(task_id)
            .await?
            .ok_or_else(|| ScanError::TaskNotFound(task_id.to_string()))
    }

    /// Pause a running task and return its persisted record
    pub async fn pause(&self, task_id: &str) -> ScanResult<TaskRecord> {
        match self.get(task_id) {
            Some(manager) => manager.request_pause().await,
            None => {
                let record = self.status(task_id).await?;
                Err(ScanError::invalid_state(task_id, "pause", record.status))
            }
        }
    }

    pub async fn list(&self, query: &TaskQuery) -> ScanResult<Vec<TaskRecord>> {
        self.ctx.tasks.list_tasks(query).await
    }

    /// Mark persisted `Executing` tasks with no live manager in this
    /// registry as resumable `Error` tasks
    pub async fn recover_interrupted(&self) -> ScanResult<Vec<String>> {
        mark_interrupted(self.ctx.tasks.as_ref(), |id| self.is_running(id)).await
    }

    /// Stop every live task
    pub fn stop_all(&self) {
        for entry in self.active.iter() {
            entry.value().stop();
        }
    }

    fn reserve(&self, task_id: &str) -> ScanResult<Reservation<'_>> {
        match self.reserved.entry(task_id.to_string()) {
            Entry::Occupied(_) => Err(ScanError::AlreadyRunning(task_id.to_string())),
            Entry::Vacant(slot) => {
                if self.active.contains_key(task_id) {
                    return Err(ScanError::AlreadyRunning(task_id.to_string()));
                }
                slot.insert(());
                Ok(Reservation {
                    reserved: &self.reserved,
                    task_id: task_id.to_string(),
                })
            }
        }
    }

    fn claim(&self, task_id: &str, manager: &Arc<ScanTaskManager>) -> ScanResult<()> {
        match self.active.entry(task_id.to_string()) {
            Entry::Occupied(_) => Err(ScanError::AlreadyRunning(task_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(manager));
                Ok(())
            }
        }
    }

    fn launch(&self, task_id: String, manager: Arc<ScanTaskManager>, rules: RuleStream, start_index: u64) {
        let active = Arc::clone(&self.active);
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            Arc::clone(&manager).supervise(rules, start_index, permits).await;
            active.remove_if(&task_id, |_, live| Arc::ptr_eq(live, &manager));
            debug!("Task {} released", task_id);
            manager.mark_finished();
        });
    }
}
