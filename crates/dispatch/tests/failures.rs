//! Integration tests for job failures and context discarding.

mod common;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use common::{plotly_export, start, start_with, wait_until, CollectingSink, ScriptedLink};
use kaleido_core::format::{ConverterAvailability, ExportFormat};
use kaleido_core::report::Outcome;
use kaleido_core::scope::Scope;
use kaleido_devtools::link::LinkError;
use kaleido_dispatch::{DispatchError, JobOrigin, Scheduler, SchedulerConfig};
use serde_json::json;

// ---------------------------------------------------------------------------
// Test: a tab detaching mid-injection fails the job and is discarded
// ---------------------------------------------------------------------------

#[tokio::test]
async fn detach_during_script_injection_discards_context() {
    let mut script = tempfile::NamedTempFile::new().unwrap();
    writeln!(script, "window.kaleido_scopes = {{ plotly: async () => ({{}}) }};").unwrap();

    let sink = Arc::new(CollectingSink::default());
    let scheduler = start(sink.clone());
    let doomed = ScriptedLink::new();
    doomed.hold("Runtime.compileScript");
    scheduler.submit_context(doomed.clone()).unwrap();

    let scope = Scope::new("plotly").unwrap().with_script(script.path());
    scheduler
        .post_job(JobOrigin::Request(1), common::export(ExportFormat::Png, scope))
        .unwrap();

    wait_until(|| doomed.count("Runtime.compileScript") == 1).await;
    let compiled = doomed.params_of("Runtime.compileScript");
    assert!(compiled[0]["expression"]
        .as_str()
        .unwrap()
        .contains("kaleido_scopes"));

    doomed.detach();
    let reports = sink.wait_for(1).await;
    assert_eq!(reports[0].id, Some(1));
    assert_eq!(reports[0].error_message(), Some("Context detached"));
    wait_until(|| doomed.is_closed()).await;

    // The held compile finally answers; nobody is listening any more.
    doomed.release("Runtime.compileScript");

    let fresh = ScriptedLink::new();
    let fresh_id = scheduler.submit_context(fresh.clone()).unwrap();
    scheduler
        .post_job(JobOrigin::Request(2), plotly_export())
        .unwrap();
    let reports = sink.wait_for(2).await;
    assert!(reports[1].is_success());
    assert_eq!(reports.len(), 2);
    assert_eq!(doomed.count("Runtime.runScript"), 0);

    wait_until(|| fresh.count("Runtime.callFunctionOn") == 1).await;
    let snap = scheduler.snapshot().await.unwrap();
    assert!(!snap.idle.contains(&1));
    assert!(snap.idle.contains(&fresh_id) || snap.in_flight.iter().any(|(_, c)| *c == fresh_id));
}

// ---------------------------------------------------------------------------
// Test: an idle tab that detaches leaves the pool and is closed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn detached_idle_context_never_returns_to_pool() {
    let sink = Arc::new(CollectingSink::default());
    let scheduler = start(sink.clone());
    let lost = ScriptedLink::new();
    let spare = ScriptedLink::new();
    let lost_id = scheduler.submit_context(lost.clone()).unwrap();
    let spare_id = scheduler.submit_context(spare.clone()).unwrap();

    lost.detach();
    wait_until(|| lost.is_closed()).await;
    assert_eq!(scheduler.snapshot().await.unwrap().idle, vec![spare_id]);

    // The oldest idle tab would have been the lost one.
    scheduler
        .post_job(JobOrigin::Request(11), plotly_export())
        .unwrap();
    let reports = sink.wait_for(1).await;
    assert!(reports[0].is_success());
    assert!(lost.methods().is_empty());
    assert_eq!(spare.count("Runtime.callFunctionOn"), 1);

    let mut idle = Vec::new();
    for _ in 0..100 {
        idle = scheduler.snapshot().await.unwrap().idle;
        if !idle.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(idle, vec![spare_id]);
    assert!(!idle.contains(&lost_id));
}

// ---------------------------------------------------------------------------
// Test: a second executionContextCreated does not advance the job twice
// ---------------------------------------------------------------------------

#[tokio::test]
async fn execution_context_handler_fires_once() {
    let sink = Arc::new(CollectingSink::default());
    let scheduler = start(sink.clone());
    let link = ScriptedLink::new();
    link.set_contexts_per_reload(2);
    scheduler.submit_context(link.clone()).unwrap();

    scheduler
        .post_job(JobOrigin::Request(3), plotly_export())
        .unwrap();
    let reports = sink.wait_for(1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(sink.len(), 1);
    assert!(reports[0].is_success());
    assert_eq!(link.count("Runtime.callFunctionOn"), 1);
    assert_eq!(link.params_of("Runtime.callFunctionOn")[0]["executionContextId"], 1);
}

// ---------------------------------------------------------------------------
// Test: a protocol error fails the job but keeps the context
// ---------------------------------------------------------------------------

#[tokio::test]
async fn protocol_error_recycles_context() {
    let sink = Arc::new(CollectingSink::default());
    let scheduler = start(sink.clone());
    let link = ScriptedLink::new();
    link.respond(
        "Runtime.callFunctionOn",
        Err(LinkError::Protocol {
            code: -32000,
            message: "Cannot find context".into(),
        }),
    );
    let context_id = scheduler.submit_context(link.clone()).unwrap();

    scheduler
        .post_job(JobOrigin::Request(4), plotly_export())
        .unwrap();
    let reports = sink.wait_for(1).await;
    let message = reports[0].error_message().unwrap();
    assert!(message.contains("Runtime.callFunctionOn"), "{message}");

    let mut idle = Vec::new();
    for _ in 0..100 {
        idle = scheduler.snapshot().await.unwrap().idle;
        if !idle.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(idle, vec![context_id]);
    assert!(!link.is_closed());
}

// ---------------------------------------------------------------------------
// Test: a non-zero render code fails the job with the page's message
// ---------------------------------------------------------------------------

#[tokio::test]
async fn render_error_code_is_reported() {
    let sink = Arc::new(CollectingSink::default());
    let scheduler = start(sink.clone());
    let link = ScriptedLink::new();
    link.respond(
        "Runtime.callFunctionOn",
        Ok(json!({
            "result": {
                "type": "string",
                "value": r#"{"code":525,"message":"Invalid figure","result":null}"#,
            }
        })),
    );
    scheduler.submit_context(link.clone()).unwrap();

    scheduler
        .post_job(JobOrigin::Request(6), plotly_export())
        .unwrap();
    let reports = sink.wait_for(1).await;
    assert_eq!(reports[0].error_message(), Some("Invalid figure"));
}

// ---------------------------------------------------------------------------
// Test: a job past its deadline fails and its context is closed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timed_out_job_discards_context() {
    let sink = Arc::new(CollectingSink::default());
    let scheduler = start_with(sink.clone(), Some(Duration::from_millis(50)));
    let stuck = ScriptedLink::new();
    stuck.hold("Runtime.callFunctionOn");
    scheduler.submit_context(stuck.clone()).unwrap();

    scheduler
        .post_job(JobOrigin::Request(7), plotly_export())
        .unwrap();
    let reports = sink.wait_for(1).await;
    let message = reports[0].error_message().unwrap();
    assert!(message.contains("timed out"), "{message}");
    wait_until(|| stuck.is_closed()).await;

    stuck.release("Runtime.callFunctionOn");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(sink.len(), 1);
    let snap = scheduler.snapshot().await.unwrap();
    assert!(snap.idle.is_empty());
    assert!(snap.in_flight.is_empty());
}

// ---------------------------------------------------------------------------
// Test: formats needing a missing converter never reach a tab
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_converter_is_rejected_with_code() {
    let sink = Arc::new(CollectingSink::default());
    let config = SchedulerConfig {
        job_timeout: None,
        converters: ConverterAvailability {
            pdftops: false,
            inkscape: true,
        },
    };
    let scheduler = Scheduler::start(config, sink.clone());
    let link = ScriptedLink::new();
    scheduler.submit_context(link.clone()).unwrap();

    let result = scheduler.post_job(
        JobOrigin::Legacy,
        common::export(ExportFormat::Eps, Scope::new("plotly").unwrap()),
    );
    assert_matches!(result, Err(DispatchError::MissingConverter(_)));

    let reports = sink.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].id, None);
    assert_matches!(
        &reports[0].outcome,
        Outcome::Failure { code: 530, message } if message.contains("pdftops")
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(link.methods().is_empty());
}
