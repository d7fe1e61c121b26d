//! Conversation types
//!
//! Turns and outbound messages shared by the leg handlers and the state
//! machine. A turn records who said what; an outbound message is text
//! waiting in a leg queue to be synthesized and played.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which side of the conversation a turn or message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    Visitor,
    Resident,
    System,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::Visitor => "visitor",
            TurnRole::Resident => "resident",
            TurnRole::System => "system",
        }
    }
}

/// One entry in a session's history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: TurnRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Why a message was enqueued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePurpose {
    Greeting,
    Clarification,
    Status,
    ContextPrompt,
    Decision,
    Farewell,
    Apology,
}

/// Text queued for synthesis on one leg
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub text: String,
    pub role: TurnRole,
    pub purpose: MessagePurpose,
}

impl OutboundMessage {
    pub fn new(role: TurnRole, purpose: MessagePurpose, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            role,
            purpose,
        }
    }

    /// Farewells get exactly one delivery attempt during shutdown
    pub fn is_farewell(&self) -> bool {
        self.purpose == MessagePurpose::Farewell
    }
}
