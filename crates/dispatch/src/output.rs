//! The output channel: one JSON line per terminal report.

use kaleido_core::report::{ProtocolVersion, Report};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Ordered destination for terminal reports.
pub trait OutputSink: Send + Sync {
    fn emit(&self, report: Report);
}

enum LineMsg {
    Report(Report),
    Flush(oneshot::Sender<()>),
}

/// Writes reports to an async writer from a dedicated task, so emitting
/// never blocks the caller and lines are never interleaved.
#[derive(Clone)]
pub struct LineWriter {
    tx: mpsc::UnboundedSender<LineMsg>,
}

impl LineWriter {
    /// Spawn the writer task. It ends once every `LineWriter` clone has
    /// been dropped or the writer fails.
    pub fn spawn<W>(writer: W, protocol: ProtocolVersion, version: String) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(write_lines(writer, rx, protocol, version));
        (Self { tx }, handle)
    }

    /// Wait until every report emitted so far has been written.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(LineMsg::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

impl OutputSink for LineWriter {
    fn emit(&self, report: Report) {
        if self.tx.send(LineMsg::Report(report)).is_err() {
            tracing::warn!("Output channel closed; report dropped");
        }
    }
}

async fn write_lines<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<LineMsg>,
    protocol: ProtocolVersion,
    version: String,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        match msg {
            LineMsg::Report(report) => {
                let mut line = report.encode(protocol, &version);
                line.push('\n');
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    tracing::error!(error = %e, "Failed to write report");
                    return;
                }
                if let Err(e) = writer.flush().await {
                    tracing::error!(error = %e, "Failed to flush output");
                    return;
                }
            }
            LineMsg::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn reports_are_written_in_order() {
        let (write_half, read_half) = tokio::io::duplex(4096);
        let (sink, handle) = LineWriter::spawn(write_half, ProtocolVersion::Modern, "0.1.0".into());

        sink.emit(Report::success(Some(1), json!({"result": "a"})));
        sink.emit(Report::failure(Some(2), "boom"));
        sink.flush().await;
        drop(sink);
        handle.await.unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let first: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        let second: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first["id"], 1);
        assert_eq!(first["success"], true);
        assert_eq!(second["id"], 2);
        assert_eq!(second["msg"], "boom");
        assert!(lines.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn legacy_lines_carry_version() {
        let (write_half, read_half) = tokio::io::duplex(4096);
        let (sink, handle) = LineWriter::spawn(write_half, ProtocolVersion::Legacy, "9.9.9".into());
        sink.emit(Report::success(None, json!("<svg/>")));
        drop(sink);
        handle.await.unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let line: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(line["code"], 0);
        assert_eq!(line["version"], "9.9.9");
    }
}
