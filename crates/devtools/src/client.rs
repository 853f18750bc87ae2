//! WebSocket client for a browser's DevTools endpoint.
//!
//! [`DevToolsClient`] holds the endpoint URL. [`DevToolsClient::connect`]
//! opens the socket and spawns the reader and writer tasks, returning a
//! [`DevToolsConnection`] that hands out tabs.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;

use crate::link::LinkError;
use crate::messages::BrowserVersion;
use crate::processor::{process_frames, write_frames, Router};
use crate::tab::TabFactory;

/// How long [`DevToolsConnection::shutdown`] waits for its tasks.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration handle for one browser endpoint.
pub struct DevToolsClient {
    ws_url: String,
}

/// A live connection to the browser.
pub struct DevToolsConnection {
    router: Arc<Router>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl DevToolsClient {
    /// `ws_url` is the browser-level endpoint, e.g.
    /// `ws://127.0.0.1:9222/devtools/browser/<id>`.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Connect to the endpoint.
    pub async fn connect(&self) -> Result<DevToolsConnection, ClientError> {
        let (ws_stream, _response) = connect_async(self.ws_url.as_str()).await.map_err(|e| {
            ClientError::Connection(format!(
                "Failed to connect to DevTools at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(ws_url = %self.ws_url, "Connected to DevTools");

        let (sink, stream) = ws_stream.split();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let router = Arc::new(Router::new(outgoing_tx));
        let cancel = CancellationToken::new();

        let reader = tokio::spawn(process_frames(stream, Arc::clone(&router), cancel.clone()));
        let writer = tokio::spawn(write_frames(sink, outgoing_rx, cancel.clone()));

        Ok(DevToolsConnection {
            router,
            cancel,
            reader,
            writer,
        })
    }
}

impl DevToolsConnection {
    /// A factory opening tabs at `page_url` on this connection.
    pub fn tab_factory(&self, page_url: impl Into<String>) -> TabFactory {
        TabFactory::new(Arc::clone(&self.router), page_url)
    }

    /// Ask the browser for its product and protocol version.
    pub async fn browser_version(&self) -> Result<BrowserVersion, ClientError> {
        let value = self
            .router
            .call(None, "Browser.getVersion", json!({}))
            .await?;
        serde_json::from_value(value).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.router.is_closed()
    }

    /// Stop both tasks and fail anything still outstanding.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let tasks = async {
            let _ = self.writer.await;
            let _ = self.reader.await;
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, tasks).await.is_err() {
            tracing::warn!("DevTools connection tasks did not stop in time");
        }
        self.router.close();
        tracing::info!("DevTools connection closed");
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Failed to establish the initial WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A protocol-level error on an already-established connection.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Link(#[from] LinkError),
}
