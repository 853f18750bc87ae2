//! The request session: one request per input line, one report each.

use std::ops::ControlFlow;
use std::sync::Arc;

use kaleido_core::report::Report;
use kaleido_core::request::{Request, RequestKind, RequestSession};
use kaleido_core::types::RequestId;
use kaleido_devtools::link::ContextFactory;
use kaleido_dispatch::{JobOrigin, OutputSink, Scheduler};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Why a session stopped reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// A `shutdown` request was processed.
    ShutdownRequested,
    /// The input stream ended; queued exports finished and the
    /// scheduler was shut down.
    EndOfInput,
}

/// Turns request lines into scheduler calls.
///
/// Exports finish asynchronously and report through the scheduler's
/// output sink. Every other operation is acknowledged here through the
/// same sink.
pub struct Session {
    scheduler: Arc<Scheduler>,
    factory: Arc<dyn ContextFactory>,
    output: Arc<dyn OutputSink>,
    requests: RequestSession,
}

impl Session {
    pub fn new(
        scheduler: Arc<Scheduler>,
        factory: Arc<dyn ContextFactory>,
        output: Arc<dyn OutputSink>,
        requests: RequestSession,
    ) -> Self {
        Self {
            scheduler,
            factory,
            output,
            requests,
        }
    }

    /// Read lines until `shutdown` or end of input.
    ///
    /// At end of input every export already posted still runs to
    /// completion before the scheduler shuts down.
    pub async fn run<R>(&mut self, reader: R) -> std::io::Result<SessionEnd>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if self.handle_line(line).await.is_break() {
                return Ok(SessionEnd::ShutdownRequested);
            }
        }

        tracing::info!("Request stream closed, finishing queued exports");
        if let Err(e) = self.scheduler.wait_settled().await {
            tracing::debug!(error = %e, "Scheduler stopped before settling");
        }
        self.scheduler.shutdown().await;
        Ok(SessionEnd::EndOfInput)
    }

    /// Process one non-empty line.
    pub async fn handle_line(&mut self, line: &str) -> ControlFlow<()> {
        let Request { id, kind } = match self.requests.accept(line) {
            Ok(request) => request,
            Err(rejection) => {
                tracing::warn!(request_id = rejection.id, error = %rejection.error, "Request rejected");
                self.output.emit(rejection.into_report());
                return ControlFlow::Continue(());
            }
        };
        tracing::debug!(request_id = id, operation = %kind.operation(), "Request accepted");

        match kind {
            RequestKind::Export(export) => {
                let origin = id.map_or(JobOrigin::Legacy, JobOrigin::Request);
                // Rejections are reported by the scheduler itself.
                if let Err(e) = self.scheduler.post_job(origin, export) {
                    tracing::debug!(request_id = id, error = %e, "Export not queued");
                }
            }
            RequestKind::CreateTab => self.create_tab(id),
            RequestKind::Reload => {
                let report = match self.scheduler.reload_all().await {
                    Ok(count) => Report::success(id, json!({ "reloaded": count })),
                    Err(e) => Report::failure(id, e.to_string()),
                };
                self.output.emit(report);
            }
            RequestKind::Shutdown => {
                tracing::info!(request_id = id, "Shutdown requested");
                self.scheduler.shutdown().await;
                self.output.emit(Report::success(id, Value::Null));
                return ControlFlow::Break(());
            }
            RequestKind::Noop => self.output.emit(Report::success(id, Value::Null)),
        }
        ControlFlow::Continue(())
    }

    /// Open a tab without blocking the request loop; the request is
    /// answered once the tab exists or creation fails.
    fn create_tab(&self, id: Option<RequestId>) {
        let scheduler = Arc::clone(&self.scheduler);
        let factory = Arc::clone(&self.factory);
        let output = Arc::clone(&self.output);
        tokio::spawn(async move {
            let report = match scheduler.create_context(factory.as_ref()).await {
                Ok(context_id) => {
                    tracing::info!(request_id = id, context_id, "Tab created");
                    Report::success(id, json!({ "context_id": context_id }))
                }
                Err(e) => {
                    tracing::warn!(request_id = id, error = %e, "Tab creation failed");
                    Report::failure(id, e.to_string())
                }
            };
            output.emit(report);
        });
    }
}
