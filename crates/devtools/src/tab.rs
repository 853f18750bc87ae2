//! Browser tabs as [`ProtocolLink`]s.
//!
//! Each tab is a page target attached with a flattened session, so all
//! tabs share the browser connection and are told apart by `sessionId`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::link::{ContextFactory, EventHandler, HandlerToken, LinkError, ProtocolLink};
use crate::messages::{AttachToTargetResult, CreateTargetResult};
use crate::processor::Router;

/// One attached page target.
pub struct TabLink {
    router: Arc<Router>,
    target_id: String,
    session_id: String,
    closed: AtomicBool,
}

impl TabLink {
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[async_trait]
impl ProtocolLink for TabLink {
    async fn send_command(&self, method: &str, params: Value) -> Result<Value, LinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }
        self.router
            .call(Some(self.session_id.as_str()), method, params)
            .await
    }

    fn add_event_handler(&self, event: &str, handler: EventHandler) -> HandlerToken {
        self.router.subscribe(Some(self.session_id.as_str()), event, handler)
    }

    fn remove_event_handler(&self, token: HandlerToken) -> bool {
        self.router.unsubscribe(token)
    }

    async fn close(&self) -> Result<(), LinkError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.router.forget_session(&self.session_id);
        self.router.fail_session(&self.session_id, LinkError::Closed);
        if self.router.is_closed() {
            return Ok(());
        }
        self.router
            .call(
                None,
                "Target.closeTarget",
                json!({ "targetId": self.target_id }),
            )
            .await?;
        tracing::debug!(target_id = %self.target_id, "Tab closed");
        Ok(())
    }
}

/// Opens new tabs on a browser connection.
#[derive(Clone)]
pub struct TabFactory {
    router: Arc<Router>,
    page_url: String,
}

impl TabFactory {
    pub fn new(router: Arc<Router>, page_url: impl Into<String>) -> Self {
        Self {
            router,
            page_url: page_url.into(),
        }
    }

    /// Create a page target and attach to it.
    pub async fn open_tab(&self) -> Result<TabLink, LinkError> {
        let created: CreateTargetResult = decode(
            self.router
                .call(None, "Target.createTarget", json!({ "url": self.page_url }))
                .await?,
        )?;
        let attached: AttachToTargetResult = decode(
            self.router
                .call(
                    None,
                    "Target.attachToTarget",
                    json!({ "targetId": created.target_id, "flatten": true }),
                )
                .await?,
        )?;

        tracing::info!(
            target_id = %created.target_id,
            session_id = %attached.session_id,
            "Tab attached",
        );

        Ok(TabLink {
            router: Arc::clone(&self.router),
            target_id: created.target_id,
            session_id: attached.session_id,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ContextFactory for TabFactory {
    async fn create_link(&self) -> Result<Arc<dyn ProtocolLink>, LinkError> {
        let link: Arc<dyn ProtocolLink> = Arc::new(self.open_tab().await?);
        Ok(link)
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, LinkError> {
    serde_json::from_value(value).map_err(|e| LinkError::Encoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    /// Answer every command on `rx` from a fixed script of results.
    fn fake_browser(
        router: Arc<Router>,
        mut rx: mpsc::UnboundedReceiver<Message>,
        results: Vec<Value>,
    ) -> tokio::task::JoinHandle<Vec<Value>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            for result in results {
                let Some(Message::Text(text)) = rx.recv().await else {
                    break;
                };
                let frame: Value = serde_json::from_str(&text).unwrap();
                let reply = json!({ "id": frame["id"], "result": result });
                seen.push(frame);
                router.handle_text(&reply.to_string());
            }
            seen
        })
    }

    #[tokio::test]
    async fn open_tab_creates_and_attaches() {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Arc::new(Router::new(tx));
        let browser = fake_browser(
            Arc::clone(&router),
            rx,
            vec![json!({"targetId": "T1"}), json!({"sessionId": "S1"})],
        );

        let tab = TabFactory::new(Arc::clone(&router), "about:blank")
            .open_tab()
            .await
            .unwrap();
        assert_eq!(tab.target_id(), "T1");
        assert_eq!(tab.session_id(), "S1");

        let frames = browser.await.unwrap();
        assert_eq!(frames[0]["method"], "Target.createTarget");
        assert_eq!(frames[0]["params"]["url"], "about:blank");
        assert_eq!(frames[1]["params"]["flatten"], true);
    }

    #[tokio::test]
    async fn closed_tab_rejects_commands() {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Arc::new(Router::new(tx));
        let browser = fake_browser(
            Arc::clone(&router),
            rx,
            vec![json!({"targetId": "T1"}), json!({"sessionId": "S1"}), json!({})],
        );
        let tab = TabFactory::new(Arc::clone(&router), "about:blank")
            .open_tab()
            .await
            .unwrap();

        tab.close().await.unwrap();
        tab.close().await.unwrap();
        assert_eq!(
            tab.send_command("Page.reload", json!({})).await,
            Err(LinkError::Closed)
        );
        let frames = browser.await.unwrap();
        assert_eq!(frames[2]["method"], "Target.closeTarget");
    }

    #[tokio::test]
    async fn detached_idle_tab_fails_fatally() {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Arc::new(Router::new(tx));
        let browser = fake_browser(
            Arc::clone(&router),
            rx,
            vec![json!({"targetId": "T1"}), json!({"sessionId": "S1"})],
        );
        let tab = TabFactory::new(Arc::clone(&router), "about:blank")
            .open_tab()
            .await
            .unwrap();
        browser.await.unwrap();

        router.handle_text(
            r#"{"method": "Target.detachedFromTarget", "params": {"sessionId": "S1", "targetId": "T1"}}"#,
        );
        let err = tab.send_command("Page.enable", json!({})).await.unwrap_err();
        assert_eq!(err, LinkError::Detached);
        assert!(err.is_fatal());
    }
}
