//! Render jobs and their protocol progress.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use kaleido_core::format::ExportFormat;
use kaleido_core::request::ExportRequest;
use kaleido_core::scope::Scope;
use kaleido_core::types::{ExecutionContextId, JobId, RequestId};
use serde_json::Value;

/// Who asked for a job, which decides where its outcome goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOrigin {
    /// A modern request carrying a caller-supplied id.
    Request(RequestId),
    /// A legacy request; reported without an id.
    Legacy,
    /// Submitted by the process itself (warm-up). Logged, never reported.
    Internal,
}

impl JobOrigin {
    /// Whether the outcome is written to the output channel.
    pub fn is_visible(self) -> bool {
        !matches!(self, JobOrigin::Internal)
    }

    /// Id to report under, if any.
    pub fn request_id(self) -> Option<RequestId> {
        match self {
            JobOrigin::Request(id) => Some(id),
            JobOrigin::Legacy | JobOrigin::Internal => None,
        }
    }
}

/// Where a job is in the per-job protocol sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Waiting in the pending pool, or paired but not started.
    Queued,
    EnablePage,
    EnableRuntime,
    /// Reload sent; waiting for its ack and a fresh default context.
    AwaitExecutionContext,
    ReadScript,
    CompileScript,
    RunScript,
    Invoke,
    PrintToPdf,
    Complete,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Complete | Stage::Failed)
    }

    /// Protocol method whose completion this stage waits for.
    pub fn method(self) -> Option<&'static str> {
        match self {
            Stage::EnablePage => Some("Page.enable"),
            Stage::EnableRuntime => Some("Runtime.enable"),
            Stage::AwaitExecutionContext => Some("Page.reload"),
            Stage::CompileScript => Some("Runtime.compileScript"),
            Stage::RunScript => Some("Runtime.runScript"),
            Stage::Invoke => Some("Runtime.callFunctionOn"),
            Stage::PrintToPdf => Some("Page.printToPDF"),
            Stage::Queued | Stage::ReadScript | Stage::Complete | Stage::Failed => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One render request and its progress.
#[derive(Debug, Clone)]
pub struct Job {
    id: JobId,
    origin: JobOrigin,
    format: ExportFormat,
    scope: Arc<Scope>,
    payload: Value,
    pub(crate) stage: Stage,
    /// Index of the next scope script to inject.
    pub(crate) cursor: usize,
    pub(crate) execution_context_id: Option<ExecutionContextId>,
    pub(crate) reload_acked: bool,
    /// Parsed invocation response, kept while the PDF is captured.
    pub(crate) result: Option<Value>,
}

impl Job {
    pub fn new(id: JobId, origin: JobOrigin, export: ExportRequest) -> Self {
        Self {
            id,
            origin,
            format: export.format,
            scope: export.scope,
            payload: export.payload,
            stage: Stage::Queued,
            cursor: 0,
            execution_context_id: None,
            reload_acked: false,
            result: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn origin(&self) -> JobOrigin {
        self.origin
    }

    pub fn format(&self) -> ExportFormat {
        self.format
    }

    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn execution_context_id(&self) -> Option<ExecutionContextId> {
        self.execution_context_id
    }

    /// The script the cursor points at, if any remain.
    pub fn current_script(&self) -> Option<&Path> {
        self.scope.scripts().get(self.cursor).map(|p| p.as_path())
    }
}
