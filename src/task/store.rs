//! Task record persistence
//!
//! Saves are idempotent upserts keyed by task id. Distinct task ids never
//! contend, so concurrent managers can save without coordination.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{ScanError, ScanResult};
use super::record::{TaskRecord, TaskStatus};

/// Listing filter; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskQuery {
    pub status: Option<TaskStatus>,
    /// Match tasks whose program list equals this one exactly
    pub programs: Option<Vec<String>>,
    pub limit: Option<usize>,
}

impl TaskQuery {
    pub fn matches(&self, record: &TaskRecord) -> bool {
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(programs) = &self.programs {
            if &record.programs != programs {
                return false;
            }
        }
        true
    }

    /// Filter, sort newest first, and truncate
    fn apply(&self, records: impl IntoIterator<Item = TaskRecord>) -> Vec<TaskRecord> {
        let mut matched: Vec<TaskRecord> = records.into_iter().filter(|r| self.matches(r)).collect();
        matched.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.task_id.cmp(&b.task_id)));
        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

/// Persistence layer for task records
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save_task(&self, record: &TaskRecord) -> ScanResult<()>;

    async fn load_task(&self, task_id: &str) -> ScanResult<Option<TaskRecord>>;

    /// Matching records, most recently updated first
    async fn list_tasks(&self, query: &TaskQuery) -> ScanResult<Vec<TaskRecord>>;
}

/// Reason recorded on tasks found `Executing` with no live manager
pub const INTERRUPTED_REASON: &str = "interrupted: process exited while task was executing";

/// Mark persisted `Executing` tasks that `is_live` does not claim as `Error`.
///
/// Such tasks lost their manager to a crash or restart; as `Error` they
/// become resumable from their last checkpoint. Returns the marked ids.
pub async fn mark_interrupted<F>(store: &dyn TaskStore, is_live: F) -> ScanResult<Vec<String>>
where
    F: Fn(&str) -> bool + Send,
{
    let query = TaskQuery {
        status: Some(TaskStatus::Executing),
        ..TaskQuery::default()
    };
    let mut recovered = Vec::new();
    for mut record in store.list_tasks(&query).await? {
        if is_live(&record.task_id) {
            continue;
        }
        record.status = TaskStatus::Error;
        record.reason = Some(INTERRUPTED_REASON.to_string());
        record.touch();
        store.save_task(&record).await?;
        warn!("Recovered interrupted task {} at unit {}", record.task_id, record.current_task_index());
        recovered.push(record.task_id);
    }
    Ok(recovered)
}

/// Task store held in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryTaskStore {
    records: Arc<DashMap<String, TaskRecord>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn save_task(&self, record: &TaskRecord) -> ScanResult<()> {
        self.records.insert(record.task_id.clone(), record.clone());
        Ok(())
    }

    async fn load_task(&self, task_id: &str) -> ScanResult<Option<TaskRecord>> {
        Ok(self.records.get(task_id).map(|r| r.value().clone()))
    }

    async fn list_tasks(&self, query: &TaskQuery) -> ScanResult<Vec<TaskRecord>> {
        let records: Vec<TaskRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        Ok(query.apply(records))
    }
}

/// One JSON file per task under a directory
#[derive(Debug, Clone)]
pub struct FileTaskStore {
    root: PathBuf,
}

impl FileTaskStore {
    /// Open a store, creating the directory if needed
    pub async fn open(root: impl Into<PathBuf>) -> ScanResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            ScanError::task_store(format!("Failed to create store directory {}: {}", root.display(), e))
        })?;
        debug!("Opened task store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, task_id: &str) -> ScanResult<PathBuf> {
        let valid = !task_id.is_empty()
            && task_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ScanError::configuration(format!("Invalid task id: {:?}", task_id)));
        }
        Ok(self.root.join(format!("{task_id}.json")))
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn save_task(&self, record: &TaskRecord) -> ScanResult<()> {
        let path = self.record_path(&record.task_id)?;
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(record)?;

        // Write-then-rename so a crash never leaves a torn record
        tokio::fs::write(&tmp, &content)
            .await
            .map_err(|e| ScanError::task_store(format!("Failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| ScanError::task_store(format!("Failed to replace {}: {}", path.display(), e)))?;
        Ok(())
    }

    async fn load_task(&self, task_id: &str) -> ScanResult<Option<TaskRecord>> {
        let path = self.record_path(task_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ScanError::task_store(format!("Failed to read {}: {}", path.display(), e))),
        }
    }

    async fn list_tasks(&self, query: &TaskQuery) -> ScanResult<Vec<TaskRecord>> {
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(|e| {
            ScanError::task_store(format!("Failed to list {}: {}", self.root.display(), e))
        })?;

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<TaskRecord>(&bytes) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!("Skipping unreadable task record {}: {}", path.display(), e),
                },
                Err(e) => warn!("Skipping task record {}: {}", path.display(), e),
            }
        }
        Ok(query.apply(records))
    }
}
