//! Frame routing for one browser connection.
//!
//! A [`Router`] is shared by every tab on the connection. Outgoing
//! commands are numbered, queued for the writer task and parked until
//! their response arrives. [`process_frames`] reads the socket and hands
//! every text frame to the router, which completes parked commands and
//! fans events out to the handlers subscribed for that session.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::link::{EventHandler, HandlerToken, LinkError, DETACHED_EVENT};
use crate::messages::{parse_message, CommandFrame, DetachedFromTarget, IncomingMessage};

const DETACHED_FROM_TARGET: &str = "Target.detachedFromTarget";

struct PendingCommand {
    session_id: Option<String>,
    method: String,
    reply: oneshot::Sender<Result<Value, LinkError>>,
}

struct Subscription {
    token: HandlerToken,
    session_id: Option<String>,
    event: String,
    handler: Arc<EventHandler>,
}

/// Shared command/event state of one connection.
pub struct Router {
    outgoing: mpsc::UnboundedSender<Message>,
    next_command_id: AtomicU64,
    next_token: AtomicU64,
    closed: AtomicBool,
    pending: Mutex<HashMap<u64, PendingCommand>>,
    /// Sessions whose target detached. Only locked while `pending` is held.
    detached: Mutex<HashSet<String>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Router {
    /// Create a router that queues outgoing frames on `outgoing`.
    pub fn new(outgoing: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            outgoing,
            next_command_id: AtomicU64::new(1),
            next_token: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            detached: Mutex::new(HashSet::new()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether the target behind `session_id` has detached.
    pub fn is_detached(&self, session_id: &str) -> bool {
        let _pending = lock(&self.pending);
        lock(&self.detached).contains(session_id)
    }

    /// Send a command and wait for its response.
    ///
    /// `session_id` of `None` addresses the browser itself. Commands for
    /// a detached session fail with [`LinkError::Detached`] without
    /// reaching the browser.
    pub async fn call(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value, LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        let id = self.next_command_id.fetch_add(1, Ordering::Relaxed);
        let text = serde_json::to_string(&CommandFrame {
            id,
            method,
            params: &params,
            session_id,
        })
        .map_err(|e| LinkError::Encoding(e.to_string()))?;

        let (reply, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if let Some(session) = session_id {
                if lock(&self.detached).contains(session) {
                    tracing::debug!(method, session_id = session, "Command for detached session");
                    return Err(LinkError::Detached);
                }
            }
            pending.insert(
                id,
                PendingCommand {
                    session_id: session_id.map(str::to_string),
                    method: method.to_string(),
                    reply,
                },
            );
        }

        if self.outgoing.send(Message::Text(text)).is_err() {
            lock(&self.pending).remove(&id);
            return Err(LinkError::Closed);
        }
        tracing::trace!(command_id = id, method, session_id, "Command sent");

        rx.await.unwrap_or(Err(LinkError::Closed))
    }

    /// Subscribe `handler` to `event` frames for one session.
    pub fn subscribe(
        &self,
        session_id: Option<&str>,
        event: &str,
        handler: EventHandler,
    ) -> HandlerToken {
        let token = HandlerToken::new(self.next_token.fetch_add(1, Ordering::Relaxed));
        lock(&self.subscriptions).push(Subscription {
            token,
            session_id: session_id.map(str::to_string),
            event: event.to_string(),
            handler: Arc::new(handler),
        });
        token
    }

    pub fn unsubscribe(&self, token: HandlerToken) -> bool {
        let mut subs = lock(&self.subscriptions);
        let before = subs.len();
        subs.retain(|s| s.token != token);
        subs.len() != before
    }

    /// Drop every subscription and the detached mark of a session.
    pub fn forget_session(&self, session_id: &str) {
        lock(&self.subscriptions).retain(|s| s.session_id.as_deref() != Some(session_id));
        let _pending = lock(&self.pending);
        lock(&self.detached).remove(session_id);
    }

    /// Route one incoming text frame.
    pub fn handle_text(&self, text: &str) {
        match parse_message(text) {
            Ok(IncomingMessage::Response {
                id,
                session_id,
                result,
            }) => self.complete(id, session_id, result.map_err(|e| LinkError::Protocol {
                code: e.code,
                message: e.message,
            })),
            Ok(IncomingMessage::Event {
                method,
                params,
                session_id,
            }) => {
                if method == DETACHED_FROM_TARGET {
                    self.handle_detached(&params);
                }
                self.emit(session_id.as_deref(), &method, params);
            }
            Err(e) => {
                tracing::warn!(error = %e, raw_message = %text, "Failed to parse DevTools frame");
            }
        }
    }

    fn complete(&self, id: u64, session_id: Option<String>, result: Result<Value, LinkError>) {
        let Some(pending) = lock(&self.pending).remove(&id) else {
            tracing::debug!(command_id = id, ?session_id, "Response for unknown command");
            return;
        };
        if let Err(e) = &result {
            tracing::debug!(command_id = id, method = %pending.method, error = %e, "Command failed");
        }
        // The caller may have given up waiting; nothing to do then.
        let _ = pending.reply.send(result);
    }

    fn handle_detached(&self, params: &Value) {
        match serde_json::from_value::<DetachedFromTarget>(params.clone()) {
            Ok(detached) => {
                tracing::info!(
                    session_id = %detached.session_id,
                    target_id = ?detached.target_id,
                    "Tab detached",
                );
                self.mark_detached(&detached.session_id);
                self.emit(
                    Some(detached.session_id.as_str()),
                    DETACHED_EVENT,
                    json!({ "reason": "target_detached" }),
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "Malformed detachedFromTarget params");
            }
        }
    }

    /// Refuse further commands for a session and fail its outstanding ones.
    fn mark_detached(&self, session_id: &str) {
        let failed = {
            let mut pending = lock(&self.pending);
            lock(&self.detached).insert(session_id.to_string());
            take_session(&mut pending, session_id)
        };
        for p in failed {
            let _ = p.reply.send(Err(LinkError::Detached));
        }
    }

    /// Fail every outstanding command of one session.
    pub fn fail_session(&self, session_id: &str, error: LinkError) {
        let failed = take_session(&mut lock(&self.pending), session_id);
        for p in failed {
            let _ = p.reply.send(Err(error.clone()));
        }
    }

    /// Mark the connection closed: fail every outstanding command and
    /// tell every tab subscribed to [`DETACHED_EVENT`] it is gone.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let failed: Vec<PendingCommand> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        for p in failed {
            let _ = p.reply.send(Err(LinkError::Closed));
        }

        let handlers: Vec<Arc<EventHandler>> = lock(&self.subscriptions)
            .iter()
            .filter(|s| s.event == DETACHED_EVENT)
            .map(|s| Arc::clone(&s.handler))
            .collect();
        for handler in handlers {
            handler(json!({ "reason": "connection_closed" }));
        }
    }

    fn emit(&self, session_id: Option<&str>, method: &str, params: Value) {
        // Collect first so handlers may unsubscribe themselves.
        let handlers: Vec<Arc<EventHandler>> = lock(&self.subscriptions)
            .iter()
            .filter(|s| s.event == method && s.session_id.as_deref() == session_id)
            .map(|s| Arc::clone(&s.handler))
            .collect();
        if handlers.is_empty() {
            tracing::trace!(method, session_id, "Unhandled event");
        }
        for handler in handlers {
            handler(params.clone());
        }
    }
}

fn take_session(
    pending: &mut HashMap<u64, PendingCommand>,
    session_id: &str,
) -> Vec<PendingCommand> {
    let ids: Vec<u64> = pending
        .iter()
        .filter(|(_, p)| p.session_id.as_deref() == Some(session_id))
        .map(|(id, _)| *id)
        .collect();
    ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
}

/// Read frames until the socket closes, errors, or `cancel` fires.
///
/// Always closes the router on exit so no caller waits forever.
pub async fn process_frames<S>(mut stream: S, router: Arc<Router>, cancel: CancellationToken)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => router.handle_text(&text),
            Some(Ok(Message::Binary(_))) => {
                tracing::trace!("Ignoring binary frame");
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(?frame, "DevTools WebSocket closed");
                break;
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "DevTools WebSocket receive error");
                break;
            }
            None => break,
        }
    }
    router.close();
}

/// Forward queued frames to the socket until the queue closes or
/// `cancel` fires, then send a close frame.
pub async fn write_frames<S>(
    mut sink: S,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = outgoing.recv() => msg,
        };
        let Some(msg) = msg else { break };
        if let Err(e) = sink.send(msg).await {
            tracing::error!(error = %e, "DevTools WebSocket send error");
            return;
        }
    }
    if let Err(e) = sink.send(Message::Close(None)).await {
        tracing::debug!(error = %e, "Close frame not sent");
    }
}
