//! Rendering contexts: one attached tab each.

use std::fmt;
use std::sync::Arc;

use kaleido_core::types::ContextId;
use kaleido_devtools::link::ProtocolLink;

/// One tab plus its protocol link.
///
/// A context is always held by exactly one of the idle pool, the
/// pairing lane's hand-off, or the control surface's in-flight arena.
/// It is moved between them, never shared.
pub struct Context {
    id: ContextId,
    link: Arc<dyn ProtocolLink>,
}

impl Context {
    pub fn new(id: ContextId, link: Arc<dyn ProtocolLink>) -> Self {
        Self { id, link }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn link(&self) -> &Arc<dyn ProtocolLink> {
        &self.link
    }

    /// Close the tab, logging rather than returning failures.
    pub async fn close(self) {
        match self.link.close().await {
            Ok(()) => tracing::debug!(context_id = self.id, "Context closed"),
            Err(e) => tracing::warn!(context_id = self.id, error = %e, "Context close failed"),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").field("id", &self.id).finish_non_exhaustive()
    }
}
