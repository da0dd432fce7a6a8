//! Duplex control stream
//!
//! One stream drives at most one task at a time. The first inbound message
//! picks the mode; afterwards the reader keeps listening so a pause can
//! arrive while the execution loop is busy with a unit. The execution loop
//! writes its own responses to the same outbound channel.

use std::sync::Arc;
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{ScanError, ScanResult};
use crate::scan::{ScanTaskManager, TaskRegistry};
use crate::task::TaskRecord;
use super::messages::{ControlMessage, ControlMode, ScanResponse};

/// Serves control streams against a shared registry
#[derive(Clone)]
pub struct ControlChannel {
    registry: Arc<TaskRegistry>,
}

/// Per-stream state
#[derive(Default)]
struct Session {
    task_id: Option<String>,
    running: Option<Arc<ScanTaskManager>>,
}

impl ControlChannel {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Serve one stream until it is done.
    ///
    /// Returns when the stream's task reaches `Done` or `Error` (with its
    /// final record), when `inbound` ends, or when the outbound side is gone.
    /// Ending the stream does not stop a running task; firing `cancel` does.
    /// A rejected first message is also returned as the call's error.
    pub async fn serve<S>(
        &self,
        inbound: S,
        outbound: mpsc::Sender<ScanResponse>,
        cancel: CancellationToken,
    ) -> ScanResult<Option<TaskRecord>>
    where
        S: Stream<Item = ControlMessage> + Send + Unpin,
    {
        let mut inbound = inbound;
        let mut session = Session::default();

        let Some(first) = inbound.next().await else {
            debug!("Control stream closed before the first message");
            return Ok(None);
        };
        if let Err(e) = self.handle(first, &mut session, &outbound, &cancel, true).await {
            if outbound.send(ScanResponse::rejected(session.task_id.as_deref(), &e)).await.is_err() {
                warn!("Control stream closed before rejection could be sent");
            }
            return Err(e);
        }

        loop {
            let watched = session.running.clone();
            let finished = async move {
                match watched {
                    Some(manager) => manager.wait().await,
                    None => std::future::pending().await,
                }
            };
            let idle = session.running.is_none();

            tokio::select! {
                message = inbound.next() => match message {
                    Some(message) => {
                        if let Err(e) = self.handle(message, &mut session, &outbound, &cancel, false).await {
                            if matches!(e, ScanError::Transport(_)) {
                                warn!("Control stream outbound closed; no longer accepting control messages");
                                return Ok(None);
                            }
                        }
                    }
                    None => {
                        debug!("Control stream inbound closed");
                        return Ok(None);
                    }
                },
                record = finished => {
                    session.running = None;
                    if record.status.is_terminal() {
                        info!("Task {} finished as {}; closing control stream", record.task_id, record.status);
                        return Ok(Some(record));
                    }
                    debug!("Task {} is {}; control stream stays open", record.task_id, record.status);
                }
                _ = cancel.cancelled(), if idle => {
                    debug!("Control stream cancelled while idle");
                    return Ok(None);
                }
            }
        }
    }

    /// Apply one control message. Rejections are reported on `outbound`;
    /// the first message's rejection is also returned.
    async fn handle(
        &self,
        message: ControlMessage,
        session: &mut Session,
        outbound: &mpsc::Sender<ScanResponse>,
        cancel: &CancellationToken,
        first: bool,
    ) -> ScanResult<()> {
        let task_id = message.task_id.clone().or_else(|| session.task_id.clone());
        debug!("Control message {:?} for {:?}", message.mode, task_id);

        let outcome = match message.mode {
            ControlMode::Start => self.start(message, session, outbound, cancel).await,
            ControlMode::Resume => self.resume(message, task_id, session, outbound, cancel).await,
            ControlMode::Status => match task_id {
                Some(id) => {
                    let record = self.registry.status(&id).await;
                    match record {
                        Ok(record) => {
                            session.task_id.get_or_insert(id);
                            send(outbound, ScanResponse::snapshot(record)).await
                        }
                        Err(e) => Err(e),
                    }
                }
                None => Err(ScanError::configuration("status requires a task id")),
            },
            ControlMode::Pause if first => {
                Err(ScanError::configuration("pause requires a task running on this stream"))
            }
            ControlMode::Pause => match task_id {
                // The loop announces the paused state itself
                Some(id) => self.registry.pause(&id).await.map(|_| ()),
                None => Err(ScanError::configuration("pause requires a task running on this stream")),
            },
        };

        match outcome {
            Err(e) if !first && !matches!(e, ScanError::Transport(_)) => {
                warn!("Rejected control message: {}", e);
                send(outbound, ScanResponse::rejected(session.task_id.as_deref(), &e)).await?;
                Err(e)
            }
            other => other,
        }
    }

    async fn start(
        &self,
        message: ControlMessage,
        session: &mut Session,
        outbound: &mpsc::Sender<ScanResponse>,
        cancel: &CancellationToken,
    ) -> ScanResult<()> {
        if let Some(running) = &session.running {
            return Err(ScanError::configuration(format!(
                "stream already drives task {}",
                running.task_id()
            )));
        }
        let request = message.into_request()?;
        let manager = self.registry.start(request, outbound.clone(), cancel.clone()).await?;
        session.task_id = Some(manager.task_id());
        session.running = Some(manager);
        Ok(())
    }

    async fn resume(
        &self,
        message: ControlMessage,
        task_id: Option<String>,
        session: &mut Session,
        outbound: &mpsc::Sender<ScanResponse>,
        cancel: &CancellationToken,
    ) -> ScanResult<()> {
        let id = task_id.ok_or_else(|| ScanError::configuration("resume requires a task id"))?;
        let manager = self
            .registry
            .resume(&id, message.resume_from, outbound.clone(), cancel.clone())
            .await?;
        session.task_id = Some(id);
        session.running = Some(manager);
        Ok(())
    }
}

async fn send(outbound: &mpsc::Sender<ScanResponse>, response: ScanResponse) -> ScanResult<()> {
    outbound
        .send(response)
        .await
        .map_err(|_| ScanError::transport("response stream closed"))
}
