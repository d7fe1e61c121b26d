//! Session registry
//!
//! Process-wide call-id → session map. The registry owns the sessions;
//! removal is the terminal event. Operations never block on I/O while
//! holding the lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use intercom_agent::Session;
use intercom_core::CallId;

/// Process-wide session map
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<CallId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look a session up, creating it for a first-ever call id. The second
    /// leg of a conversation always lands on the existing entry, which is
    /// what correlates the two legs.
    pub fn get_or_create(&self, call_id: CallId) -> (Arc<Session>, bool) {
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(&call_id) {
            return (existing.clone(), false);
        }
        let session = Arc::new(Session::new(call_id));
        sessions.insert(call_id, session.clone());
        tracing::info!(%call_id, total = sessions.len(), "session created");
        (session, true)
    }

    pub fn get(&self, call_id: &CallId) -> Option<Arc<Session>> {
        self.sessions.read().get(call_id).cloned()
    }

    /// Latch termination on both legs and return immediately. Handlers
    /// observe the latches and drain on their own schedule.
    pub fn end(&self, call_id: &CallId) -> bool {
        match self.get(call_id) {
            Some(session) => {
                session.terminate_all();
                true
            }
            None => false,
        }
    }

    /// Final removal, called once the last handler is done with the session
    pub fn complete(&self, call_id: &CallId) {
        if self.sessions.write().remove(call_id).is_some() {
            tracing::info!(%call_id, "session removed");
        }
    }

    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }
}
