//! Core traits and types for the intercom agent
//!
//! This crate provides foundational types used across all other crates:
//! - Call identifiers and their wire representation
//! - SLIN audio constants and energy helpers
//! - Conversation types (turns, outbound messages)
//! - The accumulating visit intent record

pub mod audio;
pub mod call_id;
pub mod conversation;
pub mod intent;

pub use audio::{average_energy, FRAME_BYTES, FRAME_DURATION_MS, FRAME_SAMPLES, SAMPLE_RATE};
pub use call_id::{CallId, CallIdError};
pub use conversation::{MessagePurpose, OutboundMessage, Turn, TurnRole};
pub use intent::{AuthorizationResult, IntentType, VisitIntent};
