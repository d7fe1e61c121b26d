//! Conversation engine
//!
//! Owns the shared session object, the per-session conversation state
//! machine, and the outbound-call orchestrator. Leg handlers only emit
//! events; every mutation of conversational state happens here, one event
//! at a time per session.

pub mod flow;
pub mod outbound;
pub mod session;

pub use flow::{ConversationFlow, FlowEvent, FlowState};
pub use outbound::{ClickToCallPublisher, ClickToCallRequest, OutboundPolicy};
pub use session::Session;

use thiserror::Error;

/// Agent errors
#[derive(Error, Debug)]
pub enum AgentError {
    /// State-machine assertion failure. Fatal for the session.
    #[error("internal invariant violated: {0}")]
    Invariant(String),

    #[error("extraction error: {0}")]
    Llm(#[from] intercom_llm::LlmError),

    #[error("directory error: {0}")]
    Directory(#[from] intercom_directory::DirectoryError),

    /// Click-to-call transport failure. Terminal for the session by design.
    #[error("bus error: {0}")]
    Bus(String),
}
