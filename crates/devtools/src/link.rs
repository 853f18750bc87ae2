//! The protocol capability a rendering context exposes to the dispatcher.
//!
//! A [`ProtocolLink`] is one attached tab: commands go out, results and
//! events come back. The dispatcher never sees sockets or session ids,
//! only this trait, so tests can substitute an in-memory link.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// Event delivered when the tab behind a link goes away.
///
/// Real links synthesise it from `Target.detachedFromTarget` or from the
/// connection closing; subscribers treat it as a fatal context error.
pub const DETACHED_EVENT: &str = "Inspector.detached";

/// Callback registered for one protocol event.
pub type EventHandler = Box<dyn Fn(Value) + Send + Sync>;

/// Opaque handle returned by [`ProtocolLink::add_event_handler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken(u64);

impl HandlerToken {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Why a protocol command did not produce a result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LinkError {
    /// The engine answered with an error payload.
    #[error("Protocol error {code}: {message}")]
    Protocol { code: i64, message: String },

    /// The tab was detached while the command was outstanding.
    #[error("Target detached")]
    Detached,

    /// The link was closed, locally or by the engine.
    #[error("Connection closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl LinkError {
    /// Whether the tab behind the link is unusable after this error.
    ///
    /// An error response leaves the tab healthy; every other variant
    /// means the tab or its connection is gone.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LinkError::Protocol { .. } | LinkError::Encoding(_))
    }
}

/// One attached rendering tab.
#[async_trait]
pub trait ProtocolLink: Send + Sync {
    /// Send a command and wait for its result object.
    async fn send_command(&self, method: &str, params: Value) -> Result<Value, LinkError>;

    /// Register `handler` for every future `event` on this tab.
    fn add_event_handler(&self, event: &str, handler: EventHandler) -> HandlerToken;

    /// Deregister a handler. Returns `false` if it was already gone.
    fn remove_event_handler(&self, token: HandlerToken) -> bool;

    /// Close the tab. Closing twice is not an error.
    async fn close(&self) -> Result<(), LinkError>;
}

/// Creates new attached tabs on demand.
#[async_trait]
pub trait ContextFactory: Send + Sync {
    async fn create_link(&self) -> Result<Arc<dyn ProtocolLink>, LinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_responses_are_not_fatal() {
        let err = LinkError::Protocol {
            code: -32000,
            message: "Cannot find context".into(),
        };
        assert!(!err.is_fatal());
        assert!(!LinkError::Encoding("bad".into()).is_fatal());
    }

    #[test]
    fn lost_tabs_are_fatal() {
        assert!(LinkError::Detached.is_fatal());
        assert!(LinkError::Closed.is_fatal());
        assert!(LinkError::Transport("reset".into()).is_fatal());
    }
}
