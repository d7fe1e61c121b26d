//! AudioSocket transport layer
//!
//! The tiny binary framing spoken between the PBX and this service:
//! a 1-byte kind, a big-endian 2-byte length, and `length` payload bytes.
//! The codec is strict on decode and never interprets audio samples.

pub mod frame;

pub use frame::{read_frame, write_frame, Frame, FrameKind};

use thiserror::Error;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Malformed header or payload. Session-fatal for the leg.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer closed the stream mid-frame or before one started
    #[error("connection closed")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Socket-reset class errors racing a close are expected, not failures
    pub fn is_expected_reset(&self) -> bool {
        match self {
            TransportError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
            ),
            TransportError::Closed => true,
            _ => false,
        }
    }
}
