//! Shared helpers for dispatch integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kaleido_core::format::{ConverterAvailability, ExportFormat};
use kaleido_core::report::Report;
use kaleido_core::request::ExportRequest;
use kaleido_core::scope::Scope;
use kaleido_devtools::link::{EventHandler, HandlerToken, LinkError, ProtocolLink, DETACHED_EVENT};
use kaleido_dispatch::{OutputSink, Scheduler, SchedulerConfig};
use serde_json::{json, Value};
use tokio::sync::oneshot;

pub const EXECUTION_CONTEXT_CREATED: &str = "Runtime.executionContextCreated";

type SharedHandler = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Default)]
struct LinkState {
    overrides: HashMap<String, Result<Value, LinkError>>,
    held: HashSet<String>,
    waiting: Vec<(String, oneshot::Sender<()>)>,
    handlers: Vec<(HandlerToken, String, SharedHandler)>,
    next_token: u64,
    commands: Vec<(String, Value)>,
    closed: bool,
    next_context_id: i64,
    /// How many `executionContextCreated` events each reload fires.
    contexts_per_reload: usize,
}

/// A fake tab that answers every command with a canned result.
///
/// `Page.reload` also fires `Runtime.executionContextCreated`, and the
/// render call returns `{"code":0,"result":"<svg/>"}`. Responses can be
/// overridden per method or held until the test releases them.
pub struct ScriptedLink {
    state: Mutex<LinkState>,
}

impl ScriptedLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LinkState {
                next_context_id: 1,
                contexts_per_reload: 1,
                ..LinkState::default()
            }),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LinkState> {
        self.state.lock().unwrap()
    }

    pub fn respond(&self, method: &str, result: Result<Value, LinkError>) {
        self.state().overrides.insert(method.to_string(), result);
    }

    /// Make `method` block until [`ScriptedLink::release`] is called.
    pub fn hold(&self, method: &str) {
        self.state().held.insert(method.to_string());
    }

    pub fn release(&self, method: &str) {
        let mut state = self.state();
        state.held.remove(method);
        let waiting = std::mem::take(&mut state.waiting);
        let (ready, still): (Vec<_>, Vec<_>) = waiting.into_iter().partition(|(m, _)| m == method);
        state.waiting = still;
        drop(state);
        for (_, tx) in ready {
            let _ = tx.send(());
        }
    }

    pub fn set_contexts_per_reload(&self, count: usize) {
        self.state().contexts_per_reload = count;
    }

    pub fn emit(&self, event: &str, params: Value) {
        let handlers: Vec<SharedHandler> = self
            .state()
            .handlers
            .iter()
            .filter(|(_, name, _)| name == event)
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(params.clone());
        }
    }

    pub fn detach(&self) {
        self.emit(DETACHED_EVENT, json!({}));
    }

    pub fn methods(&self) -> Vec<String> {
        self.state().commands.iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.methods().iter().filter(|m| *m == method).count()
    }

    pub fn params_of(&self, method: &str) -> Vec<Value> {
        self.state()
            .commands
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.state()
            .handlers
            .iter()
            .filter(|(_, name, _)| name == event)
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn default_result(method: &str) -> Value {
        match method {
            "Runtime.compileScript" => json!({ "scriptId": "script-1" }),
            "Runtime.runScript" => json!({ "result": { "type": "undefined" } }),
            "Runtime.callFunctionOn" => json!({
                "result": {
                    "type": "string",
                    "value": r#"{"code":0,"message":null,"result":"<svg/>"}"#,
                }
            }),
            "Page.printToPDF" => json!({ "data": "JVBERi0=" }),
            _ => json!({}),
        }
    }
}

#[async_trait]
impl ProtocolLink for ScriptedLink {
    async fn send_command(&self, method: &str, params: Value) -> Result<Value, LinkError> {
        let gate = {
            let mut state = self.state();
            if state.closed {
                return Err(LinkError::Closed);
            }
            state.commands.push((method.to_string(), params));
            if state.held.contains(method) {
                let (tx, rx) = oneshot::channel();
                state.waiting.push((method.to_string(), tx));
                Some(rx)
            } else {
                None
            }
        };
        if let Some(rx) = gate {
            let _ = rx.await;
        }

        if method == "Page.reload" {
            let (first, count) = {
                let mut state = self.state();
                let first = state.next_context_id;
                state.next_context_id += state.contexts_per_reload as i64;
                (first, state.contexts_per_reload)
            };
            for offset in 0..count {
                self.emit(
                    EXECUTION_CONTEXT_CREATED,
                    json!({
                        "context": {
                            "id": first + offset as i64,
                            "auxData": { "isDefault": true, "frameId": "main" },
                        }
                    }),
                );
            }
        }

        let state = self.state();
        match state.overrides.get(method) {
            Some(result) => result.clone(),
            None => Ok(Self::default_result(method)),
        }
    }

    fn add_event_handler(&self, event: &str, handler: EventHandler) -> HandlerToken {
        let mut state = self.state();
        state.next_token += 1;
        let token = HandlerToken::new(state.next_token);
        state
            .handlers
            .push((token, event.to_string(), Arc::from(handler)));
        token
    }

    fn remove_event_handler(&self, token: HandlerToken) -> bool {
        let mut state = self.state();
        let before = state.handlers.len();
        state.handlers.retain(|(t, _, _)| *t != token);
        state.handlers.len() != before
    }

    async fn close(&self) -> Result<(), LinkError> {
        let mut state = self.state();
        state.closed = true;
        state.handlers.clear();
        Ok(())
    }
}

/// Output sink that keeps every report in memory.
#[derive(Default)]
pub struct CollectingSink {
    reports: Mutex<Vec<Report>>,
}

impl CollectingSink {
    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().unwrap().len()
    }

    /// Wait until at least `count` reports have arrived.
    pub async fn wait_for(&self, count: usize) -> Vec<Report> {
        wait_until(|| self.len() >= count).await;
        self.reports()
    }
}

impl OutputSink for CollectingSink {
    fn emit(&self, report: Report) {
        self.reports.lock().unwrap().push(report);
    }
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 2s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn start(sink: Arc<CollectingSink>) -> Scheduler {
    start_with(sink, None)
}

pub fn start_with(sink: Arc<CollectingSink>, job_timeout: Option<Duration>) -> Scheduler {
    let config = SchedulerConfig {
        job_timeout,
        converters: ConverterAvailability::all(),
    };
    Scheduler::start(config, sink)
}

pub fn export(format: ExportFormat, scope: Scope) -> ExportRequest {
    ExportRequest {
        format,
        scope: Arc::new(scope),
        payload: json!({ "data": [], "layout": {} }),
    }
}

pub fn plotly_export() -> ExportRequest {
    export(ExportFormat::Svg, Scope::new("plotly").unwrap())
}
