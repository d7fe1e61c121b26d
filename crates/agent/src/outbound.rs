//! Outbound call orchestration
//!
//! Publishes click-to-call requests on the external bus and waits for the
//! resident leg to attach under the same call id. Runs on its own task so
//! bus I/O never stalls the state machine, and observes the session's
//! termination latches so it aborts promptly.
//!
//! Bus transport failures are terminal for the session by design: there is
//! no silent degradation and no mock fallback.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;

use intercom_core::CallId;

use crate::session::Session;
use crate::AgentError;

/// How often the wait loop re-checks the termination latches
const TERMINATE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Retry policy for outbound attempts
#[derive(Debug, Clone)]
pub struct OutboundPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
}

impl Default for OutboundPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

/// One click-to-call request
///
/// `guid` must equal the session's call id verbatim so the returned
/// resident leg attaches to the same session.
#[derive(Debug, Clone, Serialize)]
pub struct ClickToCallRequest {
    pub guid: String,
    pub origin: String,
    pub license: String,
}

impl ClickToCallRequest {
    pub fn new(call_id: CallId, origin: impl Into<String>, license: impl Into<String>) -> Self {
        Self {
            guid: call_id.to_string(),
            origin: origin.into(),
            license: license.into(),
        }
    }

    /// The JSON body published on the bus
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "data": {
                "destiny": "IA",
                "guid": self.guid,
                "license": self.license,
                "origin": self.origin,
            },
            "timestamp": Utc::now().to_rfc3339(),
        })
    }
}

/// Click-to-call bus capability
#[async_trait]
pub trait ClickToCallPublisher: Send + Sync {
    /// Publish one request. Errors are transport-level and fatal for the
    /// session.
    async fn publish(&self, request: &ClickToCallRequest) -> Result<(), AgentError>;
}

/// How an orchestrator run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundOutcome {
    /// Resident leg attached within an attempt window
    Attached,
    /// Every attempt timed out
    Exhausted,
    /// Bus transport failure
    BusFatal(String),
    /// Session terminated while waiting
    Terminated,
}

/// Run the attempt loop: publish, wait for the resident leg, retry.
pub async fn run_outbound(
    session: Arc<Session>,
    publisher: Arc<dyn ClickToCallPublisher>,
    request: ClickToCallRequest,
    policy: OutboundPolicy,
) -> OutboundOutcome {
    for attempt in 1..=policy.max_attempts {
        if session.is_fully_terminated() {
            return OutboundOutcome::Terminated;
        }

        tracing::info!(
            call_id = %session.call_id,
            attempt,
            max_attempts = policy.max_attempts,
            origin = %request.origin,
            "publishing click-to-call"
        );

        if let Err(err) = publisher.publish(&request).await {
            return OutboundOutcome::BusFatal(err.to_string());
        }

        match wait_for_attach(&session, policy.attempt_timeout).await {
            WaitResult::Attached => return OutboundOutcome::Attached,
            WaitResult::Terminated => return OutboundOutcome::Terminated,
            WaitResult::TimedOut => {
                tracing::warn!(
                    call_id = %session.call_id,
                    attempt,
                    "resident did not connect within the attempt window"
                );
            }
        }
    }

    OutboundOutcome::Exhausted
}

enum WaitResult {
    Attached,
    TimedOut,
    Terminated,
}

async fn wait_for_attach(session: &Arc<Session>, timeout: Duration) -> WaitResult {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if session.resident_is_attached() {
            return WaitResult::Attached;
        }
        if session.is_fully_terminated() {
            return WaitResult::Terminated;
        }
        if tokio::time::Instant::now() >= deadline {
            return WaitResult::TimedOut;
        }

        tokio::select! {
            _ = session.attach_notified() => {}
            _ = tokio::time::sleep(TERMINATE_POLL_INTERVAL) => {}
            _ = tokio::time::sleep_until(deadline) => {}
        }
    }
}
