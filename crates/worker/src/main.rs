use std::sync::Arc;

use anyhow::Context as _;
use kaleido_core::format::ConverterAvailability;
use kaleido_core::request::RequestSession;
use kaleido_devtools::client::DevToolsClient;
use kaleido_devtools::link::ContextFactory;
use kaleido_devtools::retry::{connect_with_retry, RetryPolicy};
use kaleido_dispatch::{LineWriter, Scheduler, SchedulerConfig};
use kaleido_worker::config::WorkerConfig;
use kaleido_worker::logging;
use kaleido_worker::session::Session;
use serde_json::json;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    logging::init(config.log_json);
    tracing::info!(
        devtools_url = %config.devtools_url,
        tabs = config.tabs,
        protocol = %config.protocol,
        default_scope = %config.default_scope,
        "Loaded worker configuration",
    );

    // --- Scopes ---
    let scopes = Arc::new(config.scope_registry().context("Invalid scope configuration")?);
    let default_scope = scopes
        .resolve(&config.default_scope)
        .context("Invalid KALEIDO_DEFAULT_SCOPE")?;
    tracing::info!(scopes = ?scopes.names(), "Scopes registered");

    // --- Output channel ---
    let (writer, writer_task) =
        LineWriter::spawn(tokio::io::stdout(), config.protocol, config.version.clone());

    // --- Scheduler ---
    let scheduler = Arc::new(Scheduler::start(
        SchedulerConfig {
            job_timeout: config.job_timeout,
            converters: ConverterAvailability::detect(),
        },
        Arc::new(writer.clone()),
    ));

    let cancel = CancellationToken::new();
    tokio::spawn(watch_signals(cancel.clone()));

    // --- Browser ---
    let client = DevToolsClient::new(config.devtools_url.clone());
    let retry = RetryPolicy {
        attempts: Some(config.connect_attempts),
        ..RetryPolicy::default()
    };
    let Some(connection) = connect_with_retry(&client, &retry, &cancel).await else {
        scheduler.shutdown().await;
        writer.flush().await;
        anyhow::bail!("Could not connect to DevTools at {}", config.devtools_url);
    };
    match connection.browser_version().await {
        Ok(version) => tracing::info!(
            product = %version.product,
            protocol_version = %version.protocol_version,
            "Connected to browser",
        ),
        Err(e) => tracing::warn!(error = %e, "Could not read browser version"),
    }

    let factory: Arc<dyn ContextFactory> = Arc::new(connection.tab_factory(config.page_url.clone()));
    for _ in 0..config.tabs {
        match scheduler.create_context(factory.as_ref()).await {
            Ok(context_id) => tracing::info!(context_id, "Tab ready"),
            Err(e) => tracing::error!(error = %e, "Failed to open tab"),
        }
    }

    if config.warm_up {
        match scheduler.warm_up(default_scope, json!({})) {
            Ok(job_id) => tracing::info!(job_id, "Warm-up job submitted"),
            Err(e) => tracing::warn!(error = %e, "Warm-up job rejected"),
        }
    }

    // --- Request session ---
    let requests = RequestSession::new(config.protocol, scopes, config.default_scope.clone());
    let mut session = Session::new(
        Arc::clone(&scheduler),
        factory,
        Arc::new(writer.clone()),
        requests,
    );
    tokio::select! {
        end = session.run(BufReader::new(tokio::io::stdin())) => match end {
            Ok(end) => tracing::info!(?end, "Session ended"),
            Err(e) => tracing::error!(error = %e, "Failed to read requests"),
        },
        () = cancel.cancelled() => {}
    }

    // --- Shutdown ---
    scheduler.shutdown().await;
    connection.shutdown().await;
    writer.flush().await;
    drop(session);
    drop(scheduler);
    drop(writer);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), writer_task).await;

    tracing::info!("Worker stopped");
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn watch_signals(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
    token.cancel();
}
