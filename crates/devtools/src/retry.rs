//! Startup retry for the DevTools endpoint.
//!
//! The browser is normally launched next to the worker and its debugging
//! port may open a little later, so the first connection goes through
//! [`connect_with_retry`].

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{DevToolsClient, DevToolsConnection};

/// How often and how patiently to retry the browser endpoint.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Pause after the first failed attempt.
    pub first_wait: Duration,
    /// Longest pause between two attempts.
    pub max_wait: Duration,
    /// Each pause is this many times the previous one.
    pub growth: u32,
    /// Total attempts; `None` keeps trying until cancelled.
    pub attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            first_wait: Duration::from_millis(500),
            max_wait: Duration::from_secs(15),
            growth: 2,
            attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Pause after failed attempt number `attempt` (1-based).
    pub fn wait_after(&self, attempt: u32) -> Duration {
        let factor = self.growth.saturating_pow(attempt.saturating_sub(1));
        self.first_wait
            .checked_mul(factor)
            .map_or(self.max_wait, |wait| wait.min(self.max_wait))
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.attempts.is_some_and(|limit| attempt >= limit)
    }
}

/// Open the browser connection, pausing between failed attempts.
///
/// `None` means the policy ran out of attempts or `cancel` fired.
pub async fn connect_with_retry(
    client: &DevToolsClient,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Option<DevToolsConnection> {
    for attempt in 1.. {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            outcome = client.connect() => Some(outcome),
        };
        let error = match outcome {
            None => {
                tracing::info!(attempt, "DevTools connect cancelled");
                return None;
            }
            Some(Ok(connection)) => {
                tracing::info!(endpoint = %client.ws_url(), attempt, "DevTools endpoint reached");
                return Some(connection);
            }
            Some(Err(e)) => e,
        };

        if policy.exhausted(attempt) {
            tracing::error!(endpoint = %client.ws_url(), attempt, error = %error, "DevTools endpoint unreachable");
            return None;
        }
        let wait = policy.wait_after(attempt);
        tracing::warn!(
            endpoint = %client.ws_url(),
            attempt,
            retry_in_ms = wait.as_millis() as u64,
            error = %error,
            "DevTools endpoint not ready",
        );
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    None
}
