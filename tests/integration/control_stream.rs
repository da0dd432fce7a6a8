//! Control streams driving the registry

mod support;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use rulescan::control::{serve_lines, ControlChannel, ControlMessage, ExecResult, ScanResponse};
use rulescan::scan::OrchestratorConfig;
use rulescan::sources::RuleFilter;
use rulescan::task::TaskStatus;

use support::{eventually, is_progress_for, progress_units, recv_until, rules, Harness, Turnstile};

#[tokio::test]
async fn test_pause_status_and_resume_on_one_stream() {
    let h = Harness::new(rules(&["r1", "r2", "r3"]), Turnstile::closed());
    let channel = ControlChannel::new(h.registry.clone());

    let (control, inbound) = mpsc::channel(8);
    let (tx, mut rx) = mpsc::channel(256);
    let server = {
        let channel = channel.clone();
        tokio::spawn(async move {
            channel
                .serve(ReceiverStream::new(inbound), tx, CancellationToken::new())
                .await
        })
    };

    control
        .send(ControlMessage::start(RuleFilter::default(), ["p1"]))
        .await
        .unwrap();
    let started = recv_until(&mut rx, |r| matches!(r.exec_result, Some(ExecResult::Started { .. }))).await;
    let task_id = started[0].task_id.clone();
    assert!(!task_id.is_empty());
    assert!(started[0].protocol_version.is_some());

    h.turnstile().release(1);
    recv_until(&mut rx, is_progress_for(0)).await;
    eventually(|| h.loader.entered() == 2).await;

    control.send(ControlMessage::pause()).await.unwrap();
    let manager = h.registry.get(&task_id).unwrap();
    eventually(|| manager.is_pause_requested()).await;
    h.turnstile().release(1);

    let paused = recv_until(&mut rx, |r| r.is_final()).await;
    let last = paused.last().unwrap();
    assert_eq!(last.status, Some(TaskStatus::Paused));
    assert_eq!(progress_units(&paused), vec![1]);

    control.send(ControlMessage::status(&task_id)).await.unwrap();
    let status = recv_until(&mut rx, |r| r.task.is_some()).await;
    let record = status.last().unwrap().task.clone().unwrap();
    assert_eq!(record.status, TaskStatus::Paused);
    assert_eq!(record.current_task_index(), 2);

    h.turnstile().release(100);
    control.send(ControlMessage::resume(&task_id)).await.unwrap();

    let finished = server.await.unwrap().unwrap().unwrap();
    assert_eq!(finished.task_id, task_id);
    assert_eq!(finished.status, TaskStatus::Done);
    assert_eq!(finished.success_count, 3);
    assert_eq!(h.applied(), vec!["r1@p1", "r2@p1", "r3@p1"]);

    let resumed = recv_until(&mut rx, |r| r.is_final()).await;
    assert!(matches!(
        resumed[0].exec_result,
        Some(ExecResult::Started { start_index: 2, .. })
    ));
    assert_eq!(progress_units(&resumed), vec![2]);
}

#[tokio::test]
async fn test_rejected_message_keeps_stream_open() {
    let h = Harness::new(rules(&["r1"]), Turnstile::closed());
    let channel = ControlChannel::new(h.registry.clone());

    let (control, inbound) = mpsc::channel(8);
    let (tx, mut rx) = mpsc::channel(256);
    let server = {
        let channel = channel.clone();
        tokio::spawn(async move {
            channel
                .serve(ReceiverStream::new(inbound), tx, CancellationToken::new())
                .await
        })
    };

    control
        .send(ControlMessage::start(RuleFilter::default(), ["p1"]))
        .await
        .unwrap();
    let started = recv_until(&mut rx, |r| r.protocol_version.is_some()).await;
    let task_id = started[0].task_id.clone();

    // A second start on a busy stream is refused without disturbing the task
    control
        .send(ControlMessage::start(RuleFilter::default(), ["p2"]))
        .await
        .unwrap();
    let rejected = recv_until(&mut rx, ScanResponse::is_error).await;
    assert_eq!(rejected.last().unwrap().task_id, task_id);

    h.turnstile().release(1);
    let finished = server.await.unwrap().unwrap().unwrap();
    assert_eq!(finished.status, TaskStatus::Done);
    assert_eq!(h.registry.list(&Default::default()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_closing_inbound_leaves_task_running() {
    let h = Harness::new(rules(&["r1"]), Turnstile::closed());
    let channel = ControlChannel::new(h.registry.clone());

    let (control, inbound) = mpsc::channel(8);
    let (tx, mut rx) = mpsc::channel(256);
    control
        .send(ControlMessage::start(RuleFilter::default(), ["p1"]))
        .await
        .unwrap();
    drop(control);

    let outcome = channel
        .serve(ReceiverStream::new(inbound), tx, CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.is_none());

    let started = recv_until(&mut rx, |r| r.protocol_version.is_some()).await;
    let manager = h.registry.get(&started[0].task_id).unwrap();
    assert_eq!(manager.status(), TaskStatus::Executing);

    h.turnstile().release(1);
    assert_eq!(manager.wait().await.status, TaskStatus::Done);
}

#[tokio::test]
async fn test_json_lines_over_duplex_transport() {
    // A one-slot response buffer still delivers every line in order
    let config = OrchestratorConfig::builder().with_channel_capacity(1).build().unwrap();
    let h = Harness::with_config(rules(&["r1", "r2"]), Turnstile::open(), config);
    assert_eq!(h.registry.config().channel_capacity, 1);
    let channel = ControlChannel::new(h.registry.clone());

    let (client, server) = tokio::io::duplex(4096);
    let (server_read, server_write) = tokio::io::split(server);
    let serving = tokio::spawn(async move {
        serve_lines(
            &channel,
            BufReader::new(server_read),
            server_write,
            CancellationToken::new(),
        )
        .await
    });

    let (client_read, mut client_write) = tokio::io::split(client);
    client_write.write_all(b"not json\n\n").await.unwrap();
    client_write
        .write_all(b"{\"mode\":\"start\",\"rule_filter\":{},\"programs\":[\"p1\"]}\n")
        .await
        .unwrap();

    let record = serving.await.unwrap().unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Done);
    drop(client_write);

    let mut lines = BufReader::new(client_read).lines();
    let mut responses = Vec::new();
    while let Some(line) = lines.next_line().await.unwrap() {
        responses.push(serde_json::from_str::<ScanResponse>(&line).unwrap());
    }

    assert!(responses[0].is_error());
    assert!(responses[0].task_id.is_empty());
    assert_eq!(responses[1].task_id, record.task_id);
    assert!(responses[1].protocol_version.is_some());
    assert_eq!(progress_units(&responses), vec![0, 1]);
    let last = responses.last().unwrap();
    assert!(last.is_final());
    assert_eq!(last.status, Some(TaskStatus::Done));
}
