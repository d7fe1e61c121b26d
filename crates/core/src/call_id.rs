//! Call Identifiers
//!
//! A call id is a 128-bit identifier shared by the visitor and resident legs
//! of one conversation. On the wire it travels as 16 raw bytes inside an ID
//! frame; everywhere else it is the canonical dashed hex form
//! (`8-4-4-4-12`). The conversion lives here and nowhere else.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors produced when parsing call ids
#[derive(Error, Debug)]
pub enum CallIdError {
    #[error("ID payload must be 16 bytes, got {0}")]
    InvalidLength(usize),

    #[error("invalid call id text: {0}")]
    InvalidText(String),
}

/// Identifier shared by both legs of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(Uuid);

impl CallId {
    /// Generate a fresh id for an outbound-initiated conversation
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Canonicalize the 16-byte payload of an ID frame
    pub fn from_wire(payload: &[u8]) -> Result<Self, CallIdError> {
        let raw: [u8; 16] = payload
            .try_into()
            .map_err(|_| CallIdError::InvalidLength(payload.len()))?;
        Ok(Self(Uuid::from_bytes(raw)))
    }

    /// The 16 bytes carried in an ID frame
    pub fn to_wire(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Uuid's Display is the canonical lowercase dashed form.
        self.0.fmt(f)
    }
}

impl FromStr for CallId {
    type Err = CallIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| CallIdError::InvalidText(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_roundtrip() {
        let id = CallId::generate();
        let bytes = id.to_wire();
        let back = CallId::from_wire(&bytes).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn test_canonical_text_form() {
        let bytes = [0xaa; 16];
        let id = CallId::from_wire(&bytes).unwrap();
        let text = id.to_string();
        // 8-4-4-4-12 with dashes, never the bare hex form
        assert_eq!(text, "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa");
        assert_eq!(text.len(), 36);

        let reparsed: CallId = text.parse().unwrap();
        assert_eq!(reparsed.to_wire(), bytes);
    }

    #[test]
    fn test_rejects_short_payload() {
        assert!(matches!(
            CallId::from_wire(&[0u8; 15]),
            Err(CallIdError::InvalidLength(15))
        ));
    }
}
