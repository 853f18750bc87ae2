//! The control surface.
//!
//! A single task that owns every in-flight (job, context) pair, issues
//! all protocol commands and receives all completions and events. Each
//! command runs in its own task, and its result comes back here as a
//! message carrying the job id. Every such continuation is checked
//! against the arena first, so a job that has already finished, timed
//! out or been drained by shutdown is never touched again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kaleido_core::report::Report;
use kaleido_core::types::{ExecutionContextId, JobId};
use kaleido_devtools::link::{HandlerToken, LinkError, DETACHED_EVENT};
use kaleido_devtools::messages::ExecutionContextCreated;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::context::Context;
use crate::job::{Job, JobOrigin, Stage};
use crate::lane::LaneMsg;
use crate::machine::{advance, Effect, Event, Finish};
use crate::output::OutputSink;
use crate::pool::{Drained, Pairing};

const EXECUTION_CONTEXT_CREATED: &str = "Runtime.executionContextCreated";

/// How long shutdown waits for tabs to close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure reported for every visible job discarded by shutdown.
pub const CANCELLED_MESSAGE: &str = "cancelled: shutting down";

/// Messages accepted by the control surface.
pub enum ControlMsg {
    Dispatch(Pairing),
    Completion {
        job_id: JobId,
        stage: Stage,
        result: Result<Value, LinkError>,
    },
    ExecutionContextCreated {
        job_id: JobId,
        id: ExecutionContextId,
    },
    Detached {
        job_id: JobId,
    },
    ScriptRead {
        job_id: JobId,
        result: Result<String, String>,
    },
    TimedOut {
        job_id: JobId,
    },
    /// Reload every in-flight tab; replies with how many were reloaded.
    ReloadAll(oneshot::Sender<usize>),
    /// Discard everything and stop. `drained` is what the pairing lane
    /// held when it retired.
    Shutdown {
        drained: Drained,
        reply: oneshot::Sender<()>,
    },
}

struct Active {
    job: Job,
    context: Context,
    context_handler: Option<HandlerToken>,
    detach_handler: Option<HandlerToken>,
    deadline: Option<JoinHandle<()>>,
}

impl Active {
    fn release_handlers(&mut self) {
        let link = self.context.link();
        if let Some(token) = self.context_handler.take() {
            link.remove_event_handler(token);
        }
        if let Some(token) = self.detach_handler.take() {
            link.remove_event_handler(token);
        }
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
    }
}

pub struct ControlSurface {
    rx: mpsc::UnboundedReceiver<ControlMsg>,
    tx: mpsc::UnboundedSender<ControlMsg>,
    lane: mpsc::UnboundedSender<LaneMsg>,
    output: Arc<dyn OutputSink>,
    job_timeout: Option<Duration>,
    arena: HashMap<JobId, Active>,
}

impl ControlSurface {
    pub fn new(
        lane: mpsc::UnboundedSender<LaneMsg>,
        output: Arc<dyn OutputSink>,
        job_timeout: Option<Duration>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            rx,
            tx,
            lane,
            output,
            job_timeout,
            arena: HashMap::new(),
        }
    }

    /// Sender for this surface's mailbox.
    pub fn sender(&self) -> mpsc::UnboundedSender<ControlMsg> {
        self.tx.clone()
    }

    /// Process messages until shutdown.
    pub async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            if !self.handle(msg).await {
                break;
            }
        }
        tracing::debug!("Control surface stopped");
    }

    /// Handle one message. Returns `false` once the surface has shut down.
    pub async fn handle(&mut self, msg: ControlMsg) -> bool {
        match msg {
            ControlMsg::Dispatch(pairing) => self.start(pairing),
            ControlMsg::Completion {
                job_id,
                stage,
                result,
            } => self.step(job_id, Event::CommandDone { stage, result }),
            ControlMsg::ExecutionContextCreated { job_id, id } => {
                self.step(job_id, Event::ExecutionContextCreated(id))
            }
            ControlMsg::Detached { job_id } => self.step(job_id, Event::Detached),
            ControlMsg::ScriptRead { job_id, result } => {
                self.step(job_id, Event::ScriptLoaded(result))
            }
            ControlMsg::TimedOut { job_id } => {
                if let Some(after) = self.job_timeout {
                    self.step(job_id, Event::TimedOut(after));
                }
            }
            ControlMsg::ReloadAll(reply) => {
                let _ = reply.send(self.reload_all());
            }
            ControlMsg::Shutdown { drained, reply } => {
                self.shutdown(drained).await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    pub fn in_flight(&self) -> usize {
        self.arena.len()
    }

    fn start(&mut self, pairing: Pairing) {
        let Pairing { job, context } = pairing;
        let job_id = job.id();

        let detach_handler = {
            let tx = self.tx.clone();
            context.link().add_event_handler(
                DETACHED_EVENT,
                Box::new(move |_: Value| {
                    let _ = tx.send(ControlMsg::Detached { job_id });
                }),
            )
        };
        let deadline = self.job_timeout.map(|after| {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = tx.send(ControlMsg::TimedOut { job_id });
            })
        });

        tracing::info!(
            job_id,
            context_id = context.id(),
            format = %job.format(),
            scope = %job.scope().name(),
            "Job started",
        );
        self.arena.insert(
            job_id,
            Active {
                job,
                context,
                context_handler: None,
                detach_handler: Some(detach_handler),
                deadline,
            },
        );
        self.step(job_id, Event::Started);
    }

    fn step(&mut self, job_id: JobId, event: Event) {
        let Some(active) = self.arena.get_mut(&job_id) else {
            tracing::debug!(job_id, "Ignoring continuation for a job no longer in flight");
            return;
        };
        let effects = advance(&mut active.job, event);
        for effect in effects {
            self.apply(job_id, effect);
        }
    }

    fn apply(&mut self, job_id: JobId, effect: Effect) {
        if let Effect::Finish(finish) = effect {
            self.finish(job_id, finish);
            return;
        }
        let Some(active) = self.arena.get_mut(&job_id) else {
            return;
        };
        match effect {
            Effect::Send { method, params } => {
                let link = Arc::clone(active.context.link());
                let stage = active.job.stage();
                let tx = self.tx.clone();
                tracing::debug!(job_id, context_id = active.context.id(), method, "Sending command");
                tokio::spawn(async move {
                    let result = link.send_command(method, params).await;
                    let _ = tx.send(ControlMsg::Completion {
                        job_id,
                        stage,
                        result,
                    });
                });
            }
            Effect::SubscribeExecutionContext => {
                let tx = self.tx.clone();
                let fired = AtomicBool::new(false);
                let token = active.context.link().add_event_handler(
                    EXECUTION_CONTEXT_CREATED,
                    Box::new(move |params: Value| {
                        let Ok(created) = serde_json::from_value::<ExecutionContextCreated>(params)
                        else {
                            return;
                        };
                        // Iframes and isolated worlds are not the page.
                        if !created.context.is_default() || fired.swap(true, Ordering::AcqRel) {
                            return;
                        }
                        let _ = tx.send(ControlMsg::ExecutionContextCreated {
                            job_id,
                            id: created.context.id,
                        });
                    }),
                );
                if let Some(old) = active.context_handler.replace(token) {
                    active.context.link().remove_event_handler(old);
                }
            }
            Effect::UnsubscribeExecutionContext => {
                if let Some(token) = active.context_handler.take() {
                    active.context.link().remove_event_handler(token);
                }
            }
            Effect::ReadScript(path) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = tokio::fs::read_to_string(&path)
                        .await
                        .map_err(|e| e.to_string());
                    let _ = tx.send(ControlMsg::ScriptRead { job_id, result });
                });
            }
            Effect::Finish(_) => {}
        }
    }

    fn finish(&mut self, job_id: JobId, finish: Finish) {
        let Some(mut active) = self.arena.remove(&job_id) else {
            return;
        };
        active.release_handlers();
        let Active { job, context, .. } = active;
        let context_id = context.id();

        let (report, recycle) = match finish {
            Finish::Success(response) => {
                tracing::info!(job_id, context_id, "Job complete");
                (success_report(job.origin(), response), true)
            }
            Finish::Failure { message, fatal } => {
                tracing::warn!(job_id, context_id, fatal, error = %message, "Job failed");
                (Report::failure(job.origin().request_id(), message), !fatal)
            }
        };
        self.report(&job, report);

        let context = if recycle {
            Some(context)
        } else {
            tokio::spawn(context.close());
            None
        };
        if let Err(mpsc::error::SendError(msg)) = self.lane.send(LaneMsg::Release { job_id, context }) {
            // The lane has retired; nobody will recycle this tab.
            if let LaneMsg::Release {
                context: Some(context),
                ..
            } = msg
            {
                tokio::spawn(context.close());
            }
        }
    }

    fn report(&self, job: &Job, report: Report) {
        if job.origin().is_visible() {
            self.output.emit(report);
        } else {
            tracing::info!(
                job_id = job.id(),
                success = report.is_success(),
                error = report.error_message(),
                "Internal job finished",
            );
        }
    }

    fn reload_all(&self) -> usize {
        for (job_id, active) in &self.arena {
            let job_id = *job_id;
            let link = Arc::clone(active.context.link());
            tokio::spawn(async move {
                if let Err(e) = link.send_command("Page.reload", json!({})).await {
                    tracing::warn!(job_id, error = %e, "Reload failed");
                }
            });
        }
        tracing::info!(count = self.arena.len(), "Reloading in-flight contexts");
        self.arena.len()
    }

    async fn shutdown(&mut self, drained: Drained) {
        let mut active: Vec<Active> = self.arena.drain().map(|(_, a)| a).collect();
        active.sort_by_key(|a| a.job.id());

        let mut closing = Vec::new();
        for mut entry in active {
            entry.release_handlers();
            self.report(&entry.job, cancelled(&entry.job));
            closing.push(tokio::spawn(entry.context.close()));
        }
        for job in &drained.pending {
            self.report(job, cancelled(job));
        }
        for context in drained.idle {
            closing.push(tokio::spawn(context.close()));
        }

        let count = closing.len();
        let wait_all = async {
            for handle in closing {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, wait_all).await.is_err() {
            tracing::warn!("Some contexts did not close in time");
        }
        tracing::info!(contexts = count, pending = drained.pending.len(), "Control surface drained");
    }
}

fn success_report(origin: JobOrigin, response: Value) -> Report {
    match origin {
        // Legacy callers get the rendered payload itself as `result`.
        JobOrigin::Legacy => {
            let result = match response {
                Value::Object(mut map) => map.remove("result").unwrap_or(Value::Null),
                other => other,
            };
            Report::success(None, result)
        }
        other => Report::success(other.request_id(), response),
    }
}

fn cancelled(job: &Job) -> Report {
    Report::failure(job.origin().request_id(), CANCELLED_MESSAGE)
}
