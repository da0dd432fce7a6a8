//! Subcommand handlers

use anyhow::{Context, Result};
use colored::Colorize;
use futures::StreamExt;
use log::info;
use prettytable::{format, Cell, Row, Table};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cli::Command;
use crate::diff::{DiffEngine, DiffResult, DiffStatus, DiffSummary, HashFn};
use crate::scan::OrchestratorConfig;
use crate::task::{mark_interrupted, FileTaskStore, TaskQuery, TaskRecord, TaskStatus, TaskStore};

pub async fn execute(command: Command, orchestrator: &OrchestratorConfig) -> Result<()> {
    match command {
        Command::Status { task_id } => {
            let store = open_store(orchestrator).await?;
            show_status(&store, &task_id).await
        }
        Command::List { status, programs, limit } => {
            let store = open_store(orchestrator).await?;
            let query = TaskQuery {
                status,
                programs: (!programs.is_empty()).then_some(programs),
                limit,
            };
            list_tasks(&store, &query).await
        }
        Command::Diff { base, compare, keys, summary } => {
            let engine = DiffEngine::new(orchestrator.diff_channel_capacity);
            diff_files(&engine, &base, &compare, &keys, summary).await
        }
        Command::Recover => {
            let store = open_store(orchestrator).await?;
            // No orchestrator runs inside this process, so nothing is live
            let recovered = mark_interrupted(&store, |_| false).await?;
            if recovered.is_empty() {
                println!("No interrupted tasks");
            }
            for task_id in recovered {
                println!("{} {}", "recovered".yellow(), task_id);
            }
            Ok(())
        }
    }
}

async fn open_store(orchestrator: &OrchestratorConfig) -> Result<FileTaskStore> {
    let dir = orchestrator
        .store_dir
        .as_ref()
        .context("No task store directory configured; use --store-dir")?;
    Ok(FileTaskStore::open(dir).await?)
}

async fn show_status(store: &dyn TaskStore, task_id: &str) -> Result<()> {
    let record = store
        .load_task(task_id)
        .await?
        .with_context(|| format!("Task {} not found", task_id))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn list_tasks(store: &dyn TaskStore, query: &TaskQuery) -> Result<()> {
    let records = store.list_tasks(query).await?;
    if records.is_empty() {
        println!("No tasks");
        return Ok(());
    }
    print!("{}", task_table(&records));
    Ok(())
}

fn coloured_status(status: TaskStatus) -> String {
    match status {
        TaskStatus::Executing => status.as_str().cyan().to_string(),
        TaskStatus::Paused => status.as_str().yellow().to_string(),
        TaskStatus::Done => status.as_str().green().to_string(),
        TaskStatus::Error => status.as_str().red().to_string(),
    }
}

pub fn task_table(records: &[TaskRecord]) -> String {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_CLEAN);
    table.add_row(Row::new(
        ["TASK", "STATUS", "PROGRESS", "OK", "FAILED", "SKIPPED", "RISKS", "UPDATED"]
            .iter()
            .map(|h| Cell::new(h))
            .collect(),
    ));
    for record in records {
        let cells = [
            record.task_id.clone(),
            coloured_status(record.status),
            format!("{}/{} ({:.0}%)", record.current_task_index(), record.total_units, record.progress() * 100.0),
            record.success_count.to_string(),
            record.failed_count.to_string(),
            record.skipped_count.to_string(),
            record.risk_count.to_string(),
            record.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ];
        table.add_row(Row::new(cells.iter().map(|c| Cell::new(c)).collect()));
    }
    table.to_string()
}

/// One line of `diff` output
#[derive(Debug, Serialize)]
struct DiffLine<'a> {
    status: DiffStatus,
    hash: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    base: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    compare: Option<&'a Value>,
}

async fn diff_files(engine: &DiffEngine, base: &Path, compare: &Path, keys: &[String], summary_only: bool) -> Result<()> {
    let base_values = read_json_lines(base).await?;
    let compare_values = read_json_lines(compare).await?;
    info!("Comparing {} base values with {} compare values", base_values.len(), compare_values.len());

    let mut results = engine.compare(
        futures::stream::iter(base_values),
        futures::stream::iter(compare_values),
        Some(value_hash(keys.to_vec())),
        CancellationToken::new(),
    );

    let mut summary = DiffSummary::default();
    while let Some(result) = results.next().await {
        summary.record(&result);
        if !summary_only {
            println!("{}", serde_json::to_string(&diff_line(&result))?);
        }
    }
    eprintln!(
        "{} added, {} removed, {} unchanged",
        summary.added.to_string().green(),
        summary.removed.to_string().red(),
        summary.unchanged
    );
    Ok(())
}

fn diff_line(result: &DiffResult<Value>) -> DiffLine<'_> {
    DiffLine {
        status: result.status(),
        hash: result.hash(),
        base: result.base(),
        compare: result.compare(),
    }
}

async fn read_json_lines(path: &Path) -> Result<Vec<Value>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("{}:{}: invalid JSON", path.display(), n + 1))
        })
        .collect()
}

/// SHA-256 over the listed fields, or over the whole value
pub fn value_hash(keys: Vec<String>) -> HashFn<Value> {
    Arc::new(move |value: &Value| {
        let mut hasher = Sha256::new();
        if keys.is_empty() {
            hasher.update(value.to_string().as_bytes());
        } else {
            for key in &keys {
                let field = value.get(key).map(Value::to_string).unwrap_or_default();
                hasher.update(field.as_bytes());
                hasher.update([0u8]);
            }
        }
        format!("{:x}", hasher.finalize())
    })
}
