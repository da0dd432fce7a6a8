//! JSON-lines framing for control streams
//!
//! One `ControlMessage` per inbound line, one `ScanResponse` per outbound
//! line. Blank lines are ignored; malformed lines are answered with a
//! rejection and otherwise skipped.

use futures::StreamExt;
use log::{debug, error, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;

use crate::error::{ScanError, ScanResult};
use crate::task::TaskRecord;
use super::channel::ControlChannel;
use super::messages::{ControlMessage, ScanResponse};

pub fn decode_line(line: &str) -> ScanResult<ControlMessage> {
    serde_json::from_str(line.trim())
        .map_err(|e| ScanError::configuration(format!("malformed control message: {e}")))
}

pub fn encode_line(response: &ScanResponse) -> ScanResult<String> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    Ok(line)
}

/// Serve a control stream read from `reader` and written to `writer`.
///
/// Responses queue in a buffer of the registry's `channel_capacity`. When
/// the stream's task finishes, this also waits for every queued response
/// to be written before returning.
pub async fn serve_lines<R, W>(
    channel: &ControlChannel,
    reader: R,
    writer: W,
    cancel: CancellationToken,
) -> ScanResult<Option<TaskRecord>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let capacity = channel.registry().config().channel_capacity;
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let writer_task = tokio::spawn(write_responses(rx, writer));

    let rejections = tx.clone();
    let inbound = LinesStream::new(reader.lines())
        .filter_map(move |line| {
            let rejections = rejections.clone();
            async move {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Failed to read control line: {}", e);
                        return None;
                    }
                };
                if line.trim().is_empty() {
                    return None;
                }
                match decode_line(&line) {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!("{}", e);
                        let _ = rejections.send(ScanResponse::rejected(None, &e)).await;
                        None
                    }
                }
            }
        })
        .boxed();

    let result = channel.serve(inbound, tx, cancel).await;
    if matches!(result, Ok(Some(_))) {
        // Terminal: the task has released its sender, so the writer drains
        if let Err(e) = writer_task.await {
            error!("Response writer failed: {}", e);
        }
    }
    result
}

async fn write_responses<W>(mut rx: mpsc::Receiver<ScanResponse>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let line = match encode_line(&response) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode response: {}", e);
                continue;
            }
        };
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!("Response stream write failed: {}", e);
            return;
        }
        if let Err(e) = writer.flush().await {
            warn!("Response stream flush failed: {}", e);
            return;
        }
    }
    debug!("Response writer finished");
}
