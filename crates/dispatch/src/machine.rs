//! The per-job protocol state machine.
//!
//! [`advance`] is a pure transition: it updates the job and returns the
//! effects the control surface must carry out. It never touches a link,
//! a file or a clock, so every path through it is unit-testable.
//!
//! ```text
//! Queued -> EnablePage -> EnableRuntime -> AwaitExecutionContext
//!        -> (ReadScript -> CompileScript -> RunScript)*
//!        -> Invoke -> [PrintToPdf] -> Complete
//! ```
//!
//! Any stage may end in `Failed` instead.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kaleido_core::types::ExecutionContextId;
use kaleido_devtools::link::LinkError;
use kaleido_devtools::messages::{
    CompileScriptResult, EvaluateResult, ExceptionDetails, PrintToPdfResult,
};
use serde_json::{json, Map, Value};

use crate::job::{Job, Stage};

/// Something that happened to an in-flight job.
#[derive(Debug)]
pub enum Event {
    /// The job was paired and handed to the control surface.
    Started,
    /// A command sent while the job was in `stage` finished.
    CommandDone {
        stage: Stage,
        result: Result<Value, LinkError>,
    },
    /// A default execution context was created in the job's tab.
    ExecutionContextCreated(ExecutionContextId),
    /// The local script the cursor points at was read.
    ScriptLoaded(Result<String, String>),
    /// The job's tab went away.
    Detached,
    TimedOut(Duration),
}

/// Work the control surface must do for a job.
#[derive(Debug, PartialEq)]
pub enum Effect {
    Send { method: &'static str, params: Value },
    SubscribeExecutionContext,
    UnsubscribeExecutionContext,
    ReadScript(PathBuf),
    Finish(Finish),
}

/// Terminal outcome of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Finish {
    Success(Value),
    /// `fatal` failures discard the context instead of recycling it.
    Failure { message: String, fatal: bool },
}

/// Apply `event` to `job`.
///
/// Events for a terminal job, and completions for a stage the job has
/// already left, produce no effects.
pub fn advance(job: &mut Job, event: Event) -> Vec<Effect> {
    if job.stage.is_terminal() {
        return Vec::new();
    }
    match event {
        Event::Started if job.stage == Stage::Queued => send(job, Stage::EnablePage, json!({})),
        Event::Started => Vec::new(),
        Event::CommandDone { stage, .. } if stage != job.stage => Vec::new(),
        Event::CommandDone { stage, result } => match result {
            Ok(value) => command_done(job, value),
            Err(e) => {
                let method = stage.method().unwrap_or("command");
                fail(job, format!("{method} failed: {e}"), e.is_fatal())
            }
        },
        Event::ExecutionContextCreated(id) => context_created(job, id),
        Event::ScriptLoaded(result) => script_loaded(job, result),
        Event::Detached => fail(job, "Context detached".to_string(), true),
        Event::TimedOut(after) => fail(
            job,
            format!("Job timed out after {}s", after.as_secs()),
            true,
        ),
    }
}

fn command_done(job: &mut Job, value: Value) -> Vec<Effect> {
    match job.stage {
        Stage::EnablePage => send(job, Stage::EnableRuntime, json!({})),
        Stage::EnableRuntime => {
            job.execution_context_id = None;
            job.reload_acked = false;
            let mut effects = vec![Effect::SubscribeExecutionContext];
            effects.extend(send(job, Stage::AwaitExecutionContext, json!({})));
            effects
        }
        Stage::AwaitExecutionContext => {
            job.reload_acked = true;
            if job.execution_context_id.is_some() {
                next_script(job)
            } else {
                Vec::new()
            }
        }
        Stage::CompileScript => compile_done(job, value),
        Stage::RunScript => run_done(job, value),
        Stage::Invoke => invoke_done(job, value),
        Stage::PrintToPdf => pdf_done(job, value),
        Stage::Queued | Stage::ReadScript | Stage::Complete | Stage::Failed => Vec::new(),
    }
}

fn context_created(job: &mut Job, id: ExecutionContextId) -> Vec<Effect> {
    if job.stage != Stage::AwaitExecutionContext || job.execution_context_id.is_some() {
        return Vec::new();
    }
    job.execution_context_id = Some(id);
    let mut effects = vec![Effect::UnsubscribeExecutionContext];
    if job.reload_acked {
        effects.extend(next_script(job));
    }
    effects
}

// ---- script injection ----

fn next_script(job: &mut Job) -> Vec<Effect> {
    match job.current_script().map(Path::to_path_buf) {
        Some(path) => {
            job.stage = Stage::ReadScript;
            vec![Effect::ReadScript(path)]
        }
        None => invoke(job),
    }
}

fn script_loaded(job: &mut Job, result: Result<String, String>) -> Vec<Effect> {
    if job.stage != Stage::ReadScript {
        return Vec::new();
    }
    let path = script_label(job);
    match result {
        Ok(source) => {
            let params = json!({
                "expression": source,
                "sourceURL": path,
                "persistScript": true,
                "executionContextId": job.execution_context_id,
            });
            send(job, Stage::CompileScript, params)
        }
        Err(e) => fail(job, format!("Failed to read script {path}: {e}"), false),
    }
}

fn compile_done(job: &mut Job, value: Value) -> Vec<Effect> {
    let path = script_label(job);
    let compiled: CompileScriptResult = match decode(job, value) {
        Ok(c) => c,
        Err(effects) => return effects,
    };
    if let Some(details) = compiled.exception_details {
        return fail(
            job,
            format!("Script {path} failed to compile: {}", details.summary()),
            false,
        );
    }
    let Some(script_id) = compiled.script_id else {
        return fail(job, format!("Script {path} compiled without a script id"), false);
    };
    let params = json!({
        "scriptId": script_id,
        "executionContextId": job.execution_context_id,
        "awaitPromise": true,
    });
    send(job, Stage::RunScript, params)
}

fn run_done(job: &mut Job, value: Value) -> Vec<Effect> {
    let path = script_label(job);
    let ran: EvaluateResult = match decode(job, value) {
        Ok(r) => r,
        Err(effects) => return effects,
    };
    if let Some(details) = ran.exception_details {
        return fail(job, format!("Script {path} threw: {}", details.summary()), false);
    }
    job.cursor += 1;
    next_script(job)
}

fn script_label(job: &Job) -> String {
    job.current_script()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

// ---- invocation ----

fn invoke(job: &mut Job) -> Vec<Effect> {
    let mut arguments = vec![json!({ "value": job.payload() })];
    arguments.extend(
        job.scope()
            .extra_args()
            .iter()
            .map(|arg| json!({ "value": arg })),
    );
    let params = json!({
        "functionDeclaration": job.scope().function_declaration(),
        "executionContextId": job.execution_context_id,
        "arguments": arguments,
        "awaitPromise": true,
        "returnByValue": true,
        "userGesture": true,
    });
    send(job, Stage::Invoke, params)
}

fn invoke_done(job: &mut Job, value: Value) -> Vec<Effect> {
    let evaluated: EvaluateResult = match decode(job, value) {
        Ok(e) => e,
        Err(effects) => return effects,
    };
    if let Some(details) = evaluated.exception_details {
        return fail(job, render_error(&details), false);
    }
    let response = match evaluated.result.value {
        // The scope function stringifies its result in the page.
        Some(Value::String(text)) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        Some(other) => other,
        None => return fail(job, "Render function returned no value".to_string(), false),
    };

    let code = response.get("code").and_then(Value::as_i64).unwrap_or(0);
    if code != 0 {
        let message = response
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Render failed with code {code}"));
        return fail(job, message, false);
    }

    if job.format().needs_pdf_capture() {
        job.result = Some(response);
        let params = json!({
            "printBackground": true,
            "marginTop": 0,
            "marginBottom": 0,
            "marginLeft": 0,
            "marginRight": 0,
            "preferCSSPageSize": true,
        });
        return send(job, Stage::PrintToPdf, params);
    }
    succeed(job, response)
}

fn render_error(details: &ExceptionDetails) -> String {
    format!("Render failed: {}", details.summary())
}

fn pdf_done(job: &mut Job, value: Value) -> Vec<Effect> {
    let printed: PrintToPdfResult = match decode(job, value) {
        Ok(p) => p,
        Err(effects) => return effects,
    };
    let mut response = match job.result.take() {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    response.insert("result".to_string(), Value::String(printed.data));
    succeed(job, Value::Object(response))
}

// ---- helpers ----

fn send(job: &mut Job, stage: Stage, params: Value) -> Vec<Effect> {
    job.stage = stage;
    match stage.method() {
        Some(method) => vec![Effect::Send { method, params }],
        None => fail(job, format!("Stage {stage} sends no command"), false),
    }
}

/// Decode a command result, failing the job on a shape mismatch.
fn decode<T: serde::de::DeserializeOwned>(job: &mut Job, value: Value) -> Result<T, Vec<Effect>> {
    serde_json::from_value(value).map_err(|e| {
        let method = job.stage.method().unwrap_or("command");
        fail(job, format!("Unexpected {method} result: {e}"), false)
    })
}

fn succeed(job: &mut Job, response: Value) -> Vec<Effect> {
    job.stage = Stage::Complete;
    vec![Effect::Finish(Finish::Success(response))]
}

fn fail(job: &mut Job, message: String, fatal: bool) -> Vec<Effect> {
    job.stage = Stage::Failed;
    vec![Effect::Finish(Finish::Failure { message, fatal })]
}
