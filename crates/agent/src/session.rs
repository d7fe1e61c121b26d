//! Session state
//!
//! One `Session` is shared by at most two leg handlers and the state
//! machine. The state machine owns every mutable conversational field; leg
//! handlers only dequeue from their own message queue and observe the
//! termination latches. Connection handles live with the resource manager,
//! never here, which keeps ownership acyclic and termination deterministic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use intercom_core::{AuthorizationResult, CallId, OutboundMessage, Turn, TurnRole, VisitIntent};

use crate::flow::FlowState;
use crate::AgentError;

/// Shared per-conversation state
pub struct Session {
    pub call_id: CallId,

    state: Mutex<FlowState>,
    intent: Mutex<VisitIntent>,
    history: Mutex<Vec<Turn>>,

    visitor_queue: Mutex<VecDeque<OutboundMessage>>,
    resident_queue: Mutex<VecDeque<OutboundMessage>>,

    // Set-once latches; observation is a plain load.
    terminate_visitor: AtomicBool,
    terminate_resident: AtomicBool,

    resident_attached: AtomicBool,
    attach_notify: Notify,

    created_at: Instant,
    last_activity: Mutex<Instant>,

    /// Serializes state-machine events: the state after event N is the
    /// starting state for event N+1.
    pub(crate) event_lock: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(call_id: CallId) -> Self {
        Self {
            call_id,
            state: Mutex::new(FlowState::Collecting),
            intent: Mutex::new(VisitIntent::default()),
            history: Mutex::new(Vec::new()),
            visitor_queue: Mutex::new(VecDeque::new()),
            resident_queue: Mutex::new(VecDeque::new()),
            terminate_visitor: AtomicBool::new(false),
            terminate_resident: AtomicBool::new(false),
            resident_attached: AtomicBool::new(false),
            attach_notify: Notify::new(),
            created_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            event_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> FlowState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, next: FlowState) {
        let mut state = self.state.lock();
        if *state != next {
            let from = *state;
            tracing::info!(call_id = %self.call_id, %from, to = %next, "state transition");
            *state = next;
        }
    }

    pub fn intent(&self) -> VisitIntent {
        self.intent.lock().clone()
    }

    pub(crate) fn with_intent<R>(&self, f: impl FnOnce(&mut VisitIntent) -> R) -> R {
        f(&mut self.intent.lock())
    }

    /// Record the resident's decision. Setting it twice is an invariant
    /// violation and fatal for the session.
    pub(crate) fn set_authorization(&self, result: AuthorizationResult) -> Result<(), AgentError> {
        let mut intent = self.intent.lock();
        if intent.authorization.is_some() {
            return Err(AgentError::Invariant(format!(
                "authorization already set for call {}",
                self.call_id
            )));
        }
        intent.authorization = Some(result);
        Ok(())
    }

    pub fn push_history(&self, turn: Turn) {
        self.history.lock().push(turn);
    }

    pub fn history(&self) -> Vec<Turn> {
        self.history.lock().clone()
    }

    /// Enqueue an outbound message on the queue its role names
    pub fn enqueue(&self, message: OutboundMessage) {
        let queue = match message.role {
            TurnRole::Visitor => &self.visitor_queue,
            TurnRole::Resident => &self.resident_queue,
            TurnRole::System => {
                tracing::warn!(call_id = %self.call_id, "dropping message addressed to system");
                return;
            }
        };
        queue.lock().push_back(message);
    }

    /// Take the next message for one leg, if any
    pub fn dequeue(&self, role: TurnRole) -> Option<OutboundMessage> {
        match role {
            TurnRole::Visitor => self.visitor_queue.lock().pop_front(),
            TurnRole::Resident => self.resident_queue.lock().pop_front(),
            TurnRole::System => None,
        }
    }

    pub fn queued_messages(&self, role: TurnRole) -> usize {
        match role {
            TurnRole::Visitor => self.visitor_queue.lock().len(),
            TurnRole::Resident => self.resident_queue.lock().len(),
            TurnRole::System => 0,
        }
    }

    /// Latch termination for one leg. Latches never clear.
    pub fn terminate(&self, role: TurnRole) {
        match role {
            TurnRole::Visitor => self.terminate_visitor.store(true, Ordering::SeqCst),
            TurnRole::Resident => self.terminate_resident.store(true, Ordering::SeqCst),
            TurnRole::System => {}
        }
    }

    pub fn terminate_all(&self) {
        self.terminate_visitor.store(true, Ordering::SeqCst);
        self.terminate_resident.store(true, Ordering::SeqCst);
    }

    pub fn is_terminated(&self, role: TurnRole) -> bool {
        match role {
            TurnRole::Visitor => self.terminate_visitor.load(Ordering::SeqCst),
            TurnRole::Resident => self.terminate_resident.load(Ordering::SeqCst),
            TurnRole::System => false,
        }
    }

    pub fn is_fully_terminated(&self) -> bool {
        self.is_terminated(TurnRole::Visitor) && self.is_terminated(TurnRole::Resident)
    }

    /// Mark the resident leg as attached and wake anyone waiting on it
    pub fn attach_resident(&self) {
        self.resident_attached.store(true, Ordering::SeqCst);
        self.attach_notify.notify_waiters();
    }

    pub fn resident_is_attached(&self) -> bool {
        self.resident_attached.load(Ordering::SeqCst)
    }

    pub async fn attach_notified(&self) {
        self.attach_notify.notified().await;
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use intercom_core::MessagePurpose;

    fn session() -> Session {
        Session::new(CallId::generate())
    }

    #[test]
    fn test_queues_are_per_role_and_ordered() {
        let s = session();
        s.enqueue(OutboundMessage::new(
            TurnRole::Visitor,
            MessagePurpose::Status,
            "first",
        ));
        s.enqueue(OutboundMessage::new(
            TurnRole::Visitor,
            MessagePurpose::Status,
            "second",
        ));
        s.enqueue(OutboundMessage::new(
            TurnRole::Resident,
            MessagePurpose::ContextPrompt,
            "context",
        ));

        assert_eq!(s.dequeue(TurnRole::Visitor).unwrap().text, "first");
        assert_eq!(s.dequeue(TurnRole::Visitor).unwrap().text, "second");
        assert!(s.dequeue(TurnRole::Visitor).is_none());
        assert_eq!(s.dequeue(TurnRole::Resident).unwrap().text, "context");
    }

    #[test]
    fn test_termination_latches_never_clear() {
        let s = session();
        assert!(!s.is_terminated(TurnRole::Visitor));
        s.terminate(TurnRole::Visitor);
        assert!(s.is_terminated(TurnRole::Visitor));
        assert!(!s.is_fully_terminated());
        s.terminate(TurnRole::Resident);
        assert!(s.is_fully_terminated());
    }

    #[test]
    fn test_authorization_set_once() {
        let s = session();
        s.set_authorization(AuthorizationResult::Authorized).unwrap();
        let err = s.set_authorization(AuthorizationResult::Denied).unwrap_err();
        assert!(matches!(err, AgentError::Invariant(_)));
        assert_eq!(
            s.intent().authorization,
            Some(AuthorizationResult::Authorized)
        );
    }

    #[tokio::test]
    async fn test_attach_wakes_waiters() {
        let s = std::sync::Arc::new(session());
        let waiter = {
            let s = s.clone();
            tokio::spawn(async move {
                while !s.resident_is_attached() {
                    s.attach_notified().await;
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        s.attach_resident();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }
}
