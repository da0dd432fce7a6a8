//! End-to-end task lifecycle through the registry

mod support;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rulescan::control::{ExecResult, ScanResponse, UnitStatus};
use rulescan::scan::{OrchestratorConfig, ScanRequest, TaskRegistry, STOPPED_REASON};
use rulescan::sources::{MemoryResultStore, MemoryRuleStore, Rule, RuleFilter};
use rulescan::task::{FileTaskStore, TaskRecord, TaskStatus, TaskStore, INTERRUPTED_REASON};
use rulescan::ScanError;

use support::{eventually, is_progress_for, progress_units, recv_until, rules, Harness, ScriptedLoader, Turnstile};

fn request(programs: &[&str]) -> ScanRequest {
    ScanRequest::new(RuleFilter::default(), programs.iter().copied())
}

fn drain(rx: &mut mpsc::Receiver<ScanResponse>) -> Vec<ScanResponse> {
    let mut responses = Vec::new();
    while let Ok(response) = rx.try_recv() {
        responses.push(response);
    }
    responses
}

/// Start a 2x2 task and pause it with exactly two units processed
async fn start_and_pause_after_two(h: &Harness) -> (String, Vec<ScanResponse>) {
    let (tx, mut rx) = mpsc::channel(256);
    let manager = h
        .registry
        .start(request(&["p1", "p2"]), tx, CancellationToken::new())
        .await
        .unwrap();
    let task_id = manager.task_id();

    h.turnstile().release(1);
    let mut seen = recv_until(&mut rx, is_progress_for(0)).await;
    // Unit 1 is now blocked inside the program, past its checkpoint
    eventually(|| h.loader.entered() == 2).await;

    let registry = Arc::clone(&h.registry);
    let id = task_id.clone();
    let pause = tokio::spawn(async move { registry.pause(&id).await });
    eventually(|| manager.is_pause_requested()).await;
    h.turnstile().release(1);

    let record = pause.await.unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Paused);
    assert_eq!(record.current_task_index(), 2);

    seen.extend(recv_until(&mut rx, |r| r.is_final()).await);
    (task_id, seen)
}

#[tokio::test]
async fn test_start_streams_announcement_progress_and_final_status() {
    let h = Harness::new(rules(&["r1", "r2"]), Turnstile::open());
    let (tx, mut rx) = mpsc::channel(256);
    let manager = h
        .registry
        .start(request(&["p1", "p2"]), tx, CancellationToken::new())
        .await
        .unwrap();
    let task_id = manager.task_id();

    let responses = recv_until(&mut rx, |r| r.is_final()).await;
    let first = &responses[0];
    assert_eq!(first.task_id, task_id);
    assert!(first.protocol_version.is_some());
    assert!(matches!(
        first.exec_result,
        Some(ExecResult::Started { rules_count: 2, total_units: 4, start_index: 0 })
    ));
    assert_eq!(progress_units(&responses), vec![0, 1, 2, 3]);

    let last = responses.last().unwrap();
    assert_eq!(last.status, Some(TaskStatus::Done));
    match &last.exec_result {
        Some(ExecResult::Finished { progress, success_count, risk_count, .. }) => {
            assert_eq!(*progress, 1.0);
            assert_eq!(*success_count, 4);
            assert_eq!(*risk_count, 4);
        }
        other => panic!("unexpected final result {:?}", other),
    }

    let record = manager.wait().await;
    assert_eq!(record.status, TaskStatus::Done);
    assert_eq!(h.persisted(&task_id).await.status, TaskStatus::Done);
    assert_eq!(h.results.results_for(&task_id).len(), 4);
    assert_eq!(h.applied(), vec!["r1@p1", "r1@p2", "r2@p1", "r2@p2"]);
}

#[tokio::test]
async fn test_pause_then_resume_runs_each_unit_exactly_once() {
    let h = Harness::new(rules(&["r1", "r2"]), Turnstile::closed());
    let (task_id, paused) = start_and_pause_after_two(&h).await;

    let last = paused.last().unwrap();
    assert_eq!(last.status, Some(TaskStatus::Paused));
    assert_eq!(h.persisted(&task_id).await.status, TaskStatus::Paused);
    assert!(!h.registry.is_running(&task_id));
    assert_eq!(h.applied(), vec!["r1@p1", "r1@p2"]);

    h.turnstile().release(100);
    let (tx, mut rx) = mpsc::channel(256);
    let manager = h.registry.resume(&task_id, None, tx, CancellationToken::new()).await.unwrap();
    let record = manager.wait().await;

    assert_eq!(record.status, TaskStatus::Done);
    assert_eq!(record.success_count, 4);
    assert_eq!(record.current_task_index(), 4);
    assert_eq!(h.applied(), vec!["r1@p1", "r1@p2", "r2@p1", "r2@p2"]);

    let responses = drain(&mut rx);
    assert!(matches!(
        responses[0].exec_result,
        Some(ExecResult::Started { start_index: 2, .. })
    ));
    assert_eq!(progress_units(&responses), vec![2, 3]);
}

#[tokio::test]
async fn test_resume_from_later_index_counts_gap_as_skipped() {
    let h = Harness::new(rules(&["r1", "r2"]), Turnstile::closed());
    let (task_id, _) = start_and_pause_after_two(&h).await;

    h.turnstile().release(100);
    let (tx, _rx) = mpsc::channel(256);
    let manager = h.registry.resume(&task_id, Some(3), tx, CancellationToken::new()).await.unwrap();
    let record = manager.wait().await;

    assert_eq!(record.status, TaskStatus::Done);
    assert_eq!(record.success_count, 3);
    assert_eq!(record.skipped_count, 1);
    assert_eq!(h.applied(), vec!["r1@p1", "r1@p2", "r2@p2"]);
}

#[tokio::test]
async fn test_resume_index_outside_remaining_units_is_rejected() {
    let h = Harness::new(rules(&["r1", "r2"]), Turnstile::closed());
    let (task_id, _) = start_and_pause_after_two(&h).await;

    let (tx, _rx) = mpsc::channel(16);
    let err = h
        .registry
        .resume(&task_id, Some(5), tx.clone(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::OutOfRange { index: 5, total: 4 }));

    let err = h
        .registry
        .resume(&task_id, Some(1), tx, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_configuration());

    let record = h.persisted(&task_id).await;
    assert_eq!(record.status, TaskStatus::Paused);
    assert_eq!(record.current_task_index(), 2);
}

#[tokio::test]
async fn test_stopped_task_ends_in_error_and_can_be_resumed() {
    let h = Harness::new(rules(&["r1", "r2"]), Turnstile::closed());
    let (tx, _rx) = mpsc::channel(256);
    let manager = h
        .registry
        .start(request(&["p1", "p2"]), tx, CancellationToken::new())
        .await
        .unwrap();
    let task_id = manager.task_id();

    eventually(|| h.loader.entered() == 1).await;
    manager.stop();
    h.turnstile().release(1);

    let record = manager.wait().await;
    assert_eq!(record.status, TaskStatus::Error);
    assert_eq!(record.reason.as_deref(), Some(STOPPED_REASON));
    assert_eq!(record.current_task_index(), 1);

    h.turnstile().release(100);
    let (tx, _rx) = mpsc::channel(256);
    let resumed = h.registry.resume(&task_id, None, tx, CancellationToken::new()).await.unwrap();
    let record = resumed.wait().await;
    assert_eq!(record.status, TaskStatus::Done);
    assert_eq!(record.reason, None);
    assert_eq!(record.success_count, 4);
    assert_eq!(h.applied().len(), 4);
}

#[tokio::test]
async fn test_cancelling_the_caller_token_stops_the_task() {
    let h = Harness::new(rules(&["r1"]), Turnstile::closed());
    let cancel = CancellationToken::new();
    let (tx, _rx) = mpsc::channel(256);
    let manager = h.registry.start(request(&["p1", "p2"]), tx, cancel.clone()).await.unwrap();

    eventually(|| h.loader.entered() == 1).await;
    cancel.cancel();
    h.turnstile().release(1);

    let record = manager.wait().await;
    assert_eq!(record.status, TaskStatus::Error);
    assert_eq!(record.current_task_index(), 1);
}

#[tokio::test]
async fn test_resume_while_running_is_rejected() {
    let h = Harness::new(rules(&["r1"]), Turnstile::closed());
    let (tx, _rx) = mpsc::channel(256);
    let manager = h
        .registry
        .start(request(&["p1"]), tx.clone(), CancellationToken::new())
        .await
        .unwrap();
    let task_id = manager.task_id();
    eventually(|| h.loader.entered() == 1).await;

    let err = h
        .registry
        .resume(&task_id, None, tx, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::AlreadyRunning(ref id) if id == &task_id));

    h.turnstile().release(1);
    assert_eq!(manager.wait().await.status, TaskStatus::Done);
}

#[tokio::test]
async fn test_done_task_cannot_be_paused_or_resumed() {
    let h = Harness::new(rules(&["r1"]), Turnstile::open());
    let (tx, _rx) = mpsc::channel(256);
    let manager = h.registry.start(request(&["p1"]), tx.clone(), CancellationToken::new()).await.unwrap();
    let task_id = manager.task_id();
    manager.wait().await;

    let err = h.registry.pause(&task_id).await.unwrap_err();
    assert!(matches!(err, ScanError::InvalidState { .. }));
    let err = h.registry.resume(&task_id, None, tx, CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ScanError::InvalidState { .. }));
}

#[tokio::test]
async fn test_language_mismatch_and_failures_are_counted() {
    let rules = vec![
        Rule::new(1, "go-only").with_language("go"),
        Rule::new(2, "broken-rule"),
        Rule::new(3, "plain"),
    ];
    let h = Harness::new(rules, Turnstile::open());
    let (tx, mut rx) = mpsc::channel(256);
    let manager = h
        .registry
        .start(request(&["svc.java", "missing-lib"]), tx, CancellationToken::new())
        .await
        .unwrap();
    let record = manager.wait().await;

    assert_eq!(record.status, TaskStatus::Done);
    assert_eq!(record.total_units, 6);
    // svc.java: skip, fail, success; missing-lib: three load failures
    assert_eq!(record.skipped_count, 1);
    assert_eq!(record.failed_count, 4);
    assert_eq!(record.success_count, 1);
    assert_eq!(record.progress(), 1.0);

    let outcomes: Vec<UnitStatus> = drain(&mut rx)
        .into_iter()
        .filter_map(|r| match r.exec_result {
            Some(ExecResult::Progress { outcome, .. }) => Some(outcome),
            _ => None,
        })
        .collect();
    assert_eq!(outcomes[0], UnitStatus::Skipped);
    assert_eq!(outcomes.iter().filter(|o| **o == UnitStatus::Failed).count(), 4);
}

#[tokio::test]
async fn test_ignore_language_runs_every_rule() {
    let h = Harness::new(vec![Rule::new(1, "go-only").with_language("go")], Turnstile::open());
    let (tx, _rx) = mpsc::channel(256);
    let mut req = request(&["svc.java"]);
    req.ignore_language = Some(true);
    let manager = h.registry.start(req, tx, CancellationToken::new()).await.unwrap();
    let record = manager.wait().await;

    assert!(record.ignore_language);
    assert_eq!(record.success_count, 1);
    assert_eq!(record.skipped_count, 0);
}

#[tokio::test]
async fn test_show_diff_reports_new_risks_against_previous_run() {
    let h = Harness::new(rules(&["r1"]), Turnstile::open());

    let (tx, _rx) = mpsc::channel(256);
    let baseline = h.registry.start(request(&["p1"]), tx, CancellationToken::new()).await.unwrap();
    let baseline = baseline.wait().await;
    assert_eq!(baseline.risk_count, 1);

    h.set_extra_risk(true);
    let (tx, mut rx) = mpsc::channel(256);
    let mut req = request(&["p1"]);
    req.show_diff = true;
    let manager = h.registry.start(req, tx, CancellationToken::new()).await.unwrap();
    let record = manager.wait().await;

    assert_eq!(record.status, TaskStatus::Done);
    assert_eq!(record.risk_count, 2);
    assert_eq!(record.baseline_task_id.as_deref(), Some(baseline.task_id.as_str()));
    assert_eq!(record.new_risk_count, Some(1));

    let responses = drain(&mut rx);
    let diff = responses
        .iter()
        .find_map(|r| match &r.exec_result {
            Some(ExecResult::Diff { added, removed, unchanged, .. }) => Some((*added, *removed, *unchanged)),
            _ => None,
        })
        .expect("diff response");
    assert_eq!(diff, (1, 0, 1));
    match &responses.last().unwrap().exec_result {
        Some(ExecResult::Finished { new_risk_count, .. }) => assert_eq!(*new_risk_count, Some(1)),
        other => panic!("unexpected final result {:?}", other),
    }
}

#[tokio::test]
async fn test_start_rejects_empty_selection_without_persisting() {
    let h = Harness::new(rules(&["r1"]), Turnstile::open());
    let (tx, _rx) = mpsc::channel(16);

    let err = h.registry.start(request(&[]), tx.clone(), CancellationToken::new()).await.unwrap_err();
    assert!(err.is_configuration());

    let filter = RuleFilter::by_names(["nothing-matches"]);
    let err = h
        .registry
        .start(ScanRequest::new(filter, ["p1"]), tx, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_configuration());
    assert!(h.tasks.is_empty());
}

#[tokio::test]
async fn test_pause_waits_for_an_execution_slot() {
    let config = OrchestratorConfig::builder().with_max_active_tasks(1).build().unwrap();
    let h = Harness::with_config(rules(&["r1"]), Turnstile::closed(), config);

    let (tx, _rx) = mpsc::channel(256);
    let first = h.registry.start(request(&["p1"]), tx.clone(), CancellationToken::new()).await.unwrap();
    eventually(|| h.loader.entered() == 1).await;
    let second = h.registry.start(request(&["p2"]), tx, CancellationToken::new()).await.unwrap();
    assert_eq!(h.registry.active_count(), 2);

    let registry = Arc::clone(&h.registry);
    let id = second.task_id();
    let pause = tokio::spawn(async move { registry.pause(&id).await });
    eventually(|| second.is_pause_requested()).await;
    assert_eq!(h.loader.entered(), 1);

    h.turnstile().release(1);
    assert_eq!(first.wait().await.status, TaskStatus::Done);
    let paused = pause.await.unwrap().unwrap();
    assert_eq!(paused.status, TaskStatus::Paused);
    assert_eq!(paused.current_task_index(), 0);
    assert_eq!(h.applied(), vec!["r1@p1"]);
}

#[tokio::test]
async fn test_interrupted_tasks_recover_from_file_store() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = FileTaskStore::open(dir.path()).await.unwrap();

    let mut orphan = TaskRecord::new("orphan", RuleFilter::default(), vec!["p1".into()], 2);
    orphan.success_count = 1;
    orphan.current_unit_index = 1;
    store.save_task(&orphan).await.unwrap();
    let mut paused = TaskRecord::new("paused", RuleFilter::default(), vec!["p1".into()], 2);
    paused.status = TaskStatus::Paused;
    store.save_task(&paused).await.unwrap();

    let config = OrchestratorConfig::builder().with_store_dir(dir.path()).build().unwrap();
    let loader = ScriptedLoader::new(Turnstile::open());
    let registry = TaskRegistry::open(
        config,
        Arc::new(MemoryRuleStore::with_rules(rules(&["r1", "r2"]))),
        Arc::new(loader.clone()),
        Arc::new(MemoryResultStore::new()),
    )
    .await
    .unwrap();

    let recovered = registry.recover_interrupted().await.unwrap();
    assert_eq!(recovered, vec!["orphan".to_string()]);
    let record = registry.status("orphan").await.unwrap();
    assert_eq!(record.status, TaskStatus::Error);
    assert_eq!(record.reason.as_deref(), Some(INTERRUPTED_REASON));
    assert_eq!(registry.status("paused").await.unwrap().status, TaskStatus::Paused);

    let (tx, _rx) = mpsc::channel(256);
    let manager = registry.resume("orphan", None, tx, CancellationToken::new()).await.unwrap();
    assert_eq!(manager.wait().await.status, TaskStatus::Done);
    assert_eq!(loader.applied(), vec!["r2@p1"]);

    let reopened = FileTaskStore::open(dir.path()).await.unwrap();
    let persisted = reopened.load_task("orphan").await.unwrap().unwrap();
    assert_eq!(persisted.status, TaskStatus::Done);
    assert_eq!(persisted.success_count, 2);
}
