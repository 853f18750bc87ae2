//! The public handle to the dispatch core.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kaleido_core::format::ConverterAvailability;
use kaleido_core::report::{Report, CODE_MISSING_CONVERTER};
use kaleido_core::request::ExportRequest;
use kaleido_core::scope::Scope;
use kaleido_core::types::{ContextId, JobId};
use kaleido_devtools::link::{ContextFactory, ProtocolLink, DETACHED_EVENT};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::context::Context;
use crate::control::{ControlMsg, ControlSurface};
use crate::error::DispatchError;
use crate::job::{Job, JobOrigin};
use crate::lane::{run_lane, LaneMsg};
use crate::output::OutputSink;
use crate::pool::PoolSnapshot;

/// Settings for one scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Deadline for one job once paired; `None` disables it.
    pub job_timeout: Option<Duration>,
    /// External converters found at startup.
    pub converters: ConverterAvailability,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            job_timeout: Some(Duration::from_secs(90)),
            converters: ConverterAvailability::detect(),
        }
    }
}

/// Handle to the pairing lane and control surface.
///
/// Cheap operations (`post_job`, `submit_context`) only enqueue a
/// message; nothing here touches the pools directly.
pub struct Scheduler {
    lane: mpsc::UnboundedSender<LaneMsg>,
    control: mpsc::UnboundedSender<ControlMsg>,
    output: Arc<dyn OutputSink>,
    converters: ConverterAvailability,
    next_job_id: AtomicU64,
    next_context_id: AtomicU64,
}

impl Scheduler {
    /// Spawn the pairing lane and the control surface.
    pub fn start(config: SchedulerConfig, output: Arc<dyn OutputSink>) -> Self {
        let (lane_tx, lane_rx) = mpsc::unbounded_channel();
        let surface = ControlSurface::new(lane_tx.clone(), Arc::clone(&output), config.job_timeout);
        let control_tx = surface.sender();

        tokio::spawn(surface.run());
        tokio::spawn(run_lane(lane_rx, control_tx.clone()));

        tracing::info!(
            job_timeout_secs = config.job_timeout.map(|t| t.as_secs()),
            pdftops = config.converters.pdftops,
            inkscape = config.converters.inkscape,
            "Scheduler started",
        );

        Self {
            lane: lane_tx,
            control: control_tx,
            output,
            converters: config.converters,
            next_job_id: AtomicU64::new(1),
            next_context_id: AtomicU64::new(1),
        }
    }

    /// Validate converter availability and queue an export.
    ///
    /// Every rejection is reported to the output channel before this
    /// returns `Err`, so callers must not report it again.
    pub fn post_job(&self, origin: JobOrigin, export: ExportRequest) -> Result<JobId, DispatchError> {
        if let Some(converter) = self.converters.missing_for(export.format) {
            let err = DispatchError::MissingConverter(converter);
            tracing::warn!(format = %export.format, error = %err, "Export rejected");
            self.reject(origin, Report::failure_with_code(
                origin.request_id(),
                CODE_MISSING_CONVERTER,
                err.to_string(),
            ));
            return Err(err);
        }

        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let job = Job::new(job_id, origin, export);
        if self.lane.send(LaneMsg::SubmitJob(job)).is_err() {
            let err = DispatchError::ShutDown;
            self.reject(origin, Report::failure(origin.request_id(), err.to_string()));
            return Err(err);
        }
        tracing::debug!(job_id, request_id = origin.request_id(), "Job posted");
        Ok(job_id)
    }

    /// Queue an internal job that warms a tab up with `scope`'s scripts.
    pub fn warm_up(&self, scope: Arc<Scope>, payload: Value) -> Result<JobId, DispatchError> {
        let export = ExportRequest {
            format: kaleido_core::format::ExportFormat::Png,
            scope,
            payload,
        };
        self.post_job(JobOrigin::Internal, export)
    }

    /// Hand an attached tab to the pairing lane.
    ///
    /// If the tab later detaches while idle, the lane drops it from the
    /// idle pool and closes it.
    pub fn submit_context(&self, link: Arc<dyn ProtocolLink>) -> Result<ContextId, DispatchError> {
        let context_id = self.next_context_id.fetch_add(1, Ordering::Relaxed);
        let context = Context::new(context_id, Arc::clone(&link));
        if let Err(mpsc::error::SendError(msg)) = self.lane.send(LaneMsg::SubmitContext(context)) {
            if let LaneMsg::SubmitContext(context) = msg {
                tokio::spawn(context.close());
            }
            return Err(DispatchError::ShutDown);
        }

        let lane = self.lane.clone();
        link.add_event_handler(
            DETACHED_EVENT,
            Box::new(move |_: Value| {
                let _ = lane.send(LaneMsg::ContextLost(context_id));
            }),
        );
        tracing::debug!(context_id, "Context submitted");
        Ok(context_id)
    }

    /// Open a new tab through `factory` and submit it.
    pub async fn create_context(&self, factory: &dyn ContextFactory) -> Result<ContextId, DispatchError> {
        if self.lane.is_closed() {
            return Err(DispatchError::ShutDown);
        }
        let link = factory.create_link().await?;
        self.submit_context(link)
    }

    /// Reload every in-flight tab. Returns how many were reloaded.
    pub async fn reload_all(&self) -> Result<usize, DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(ControlMsg::ReloadAll(tx))
            .map_err(|_| DispatchError::ShutDown)?;
        rx.await.map_err(|_| DispatchError::ShutDown)
    }

    /// Pool contents as the pairing lane sees them, or `None` once the
    /// lane has retired.
    pub async fn snapshot(&self) -> Option<PoolSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.lane.send(LaneMsg::Snapshot(tx)).ok()?;
        rx.await.ok()
    }

    /// Wait until every posted job has finished and nothing is pending.
    ///
    /// Jobs posted while waiting are waited for too. Fails if the
    /// scheduler shuts down first.
    pub async fn wait_settled(&self) -> Result<(), DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.lane
            .send(LaneMsg::WhenSettled(tx))
            .map_err(|_| DispatchError::ShutDown)?;
        rx.await.map_err(|_| DispatchError::ShutDown)
    }

    pub fn is_shut_down(&self) -> bool {
        self.lane.is_closed()
    }

    /// Retire the pairing lane, then drain the control surface.
    ///
    /// Pending and in-flight jobs each get one cancellation report, and
    /// every tab is closed. Calling this again is a no-op.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.lane.send(LaneMsg::Drain(tx)).is_err() {
            tracing::debug!("Scheduler already shut down");
            return;
        }
        // Only the first drain gets an answer.
        let Ok(drained) = rx.await else {
            return;
        };

        let (tx, rx) = oneshot::channel();
        if self
            .control
            .send(ControlMsg::Shutdown { drained, reply: tx })
            .is_err()
        {
            tracing::warn!("Control surface already stopped");
            return;
        }
        let _ = rx.await;
        tracing::info!("Scheduler shut down");
    }

    fn reject(&self, origin: JobOrigin, report: Report) {
        if origin.is_visible() {
            self.output.emit(report);
        }
    }
}
