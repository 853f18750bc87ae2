//! DevTools protocol plumbing for the rendering engine.
//!
//! Provides the [`link::ProtocolLink`] capability the dispatcher drives,
//! typed wire messages, a WebSocket connection to the browser endpoint
//! with per-tab flattened sessions, and exponential-backoff connection
//! retry.

pub mod client;
pub mod link;
pub mod messages;
pub mod processor;
pub mod retry;
pub mod tab;
