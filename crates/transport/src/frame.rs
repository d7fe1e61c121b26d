//! Frame codec
//!
//! Wire format, bit-exact:
//!
//! ```text
//! +------+--------+----------------+
//! | kind | length |    payload     |
//! | 1 B  |  2 B   |  length bytes  |
//! +------+--------+----------------+
//! ```
//!
//! `kind = 0x01` ID (exactly 16 payload bytes), `0x10` SLIN (signed 16-bit
//! little-endian PCM at 8 kHz mono), `0x00` HANGUP (length 0), `0xff` ERROR
//! (length >= 1, first byte is the error code). The length field is
//! big-endian unsigned.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use intercom_core::CallId;

use crate::TransportError;

/// Raw frame kind bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Hangup = 0x00,
    Id = 0x01,
    Slin = 0x10,
    Error = 0xff,
}

impl FrameKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(FrameKind::Hangup),
            0x01 => Some(FrameKind::Id),
            0x10 => Some(FrameKind::Slin),
            0xff => Some(FrameKind::Error),
            _ => None,
        }
    }
}

/// A decoded AudioSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Call identifier, 16 raw bytes on the wire
    Id(CallId),
    /// Opaque SLIN payload. Any length is permitted; 320 bytes is typical.
    Slin(Vec<u8>),
    /// Zero-payload hangup
    Hangup,
    /// Error code plus whatever detail bytes followed it
    Error { code: u8, detail: Vec<u8> },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Id(_) => FrameKind::Id,
            Frame::Slin(_) => FrameKind::Slin,
            Frame::Hangup => FrameKind::Hangup,
            Frame::Error { .. } => FrameKind::Error,
        }
    }

    /// Encode to the on-wire byte sequence
    pub fn encode(&self) -> Vec<u8> {
        let body: Vec<u8> = match self {
            Frame::Id(id) => id.to_wire().to_vec(),
            Frame::Slin(pcm) => pcm.clone(),
            Frame::Hangup => Vec::new(),
            Frame::Error { code, detail } => {
                let mut b = Vec::with_capacity(1 + detail.len());
                b.push(*code);
                b.extend_from_slice(detail);
                b
            }
        };

        let mut out = Vec::with_capacity(3 + body.len());
        out.push(self.kind() as u8);
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Decode a frame from its kind byte and payload
    pub fn decode(kind: u8, payload: Vec<u8>) -> Result<Self, TransportError> {
        let kind = FrameKind::from_byte(kind)
            .ok_or_else(|| TransportError::Protocol(format!("unknown frame kind 0x{kind:02x}")))?;

        match kind {
            FrameKind::Id => {
                if payload.len() != 16 {
                    return Err(TransportError::Protocol(format!(
                        "ID frame payload must be 16 bytes, got {}",
                        payload.len()
                    )));
                }
                let id = CallId::from_wire(&payload)
                    .map_err(|e| TransportError::Protocol(e.to_string()))?;
                Ok(Frame::Id(id))
            }
            FrameKind::Slin => Ok(Frame::Slin(payload)),
            FrameKind::Hangup => {
                if !payload.is_empty() {
                    return Err(TransportError::Protocol(format!(
                        "HANGUP frame carries no payload, got {} bytes",
                        payload.len()
                    )));
                }
                Ok(Frame::Hangup)
            }
            FrameKind::Error => {
                let Some((&code, detail)) = payload.split_first() else {
                    return Err(TransportError::Protocol(
                        "ERROR frame requires at least one payload byte".to_string(),
                    ));
                };
                Ok(Frame::Error {
                    code,
                    detail: detail.to_vec(),
                })
            }
        }
    }
}

/// Read one frame from the stream.
///
/// EOF before the first header byte maps to [`TransportError::Closed`];
/// EOF anywhere inside a frame is a protocol error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 3];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed);
        }
        Err(err) => return Err(err.into()),
    }

    let length = u16::from_be_bytes([header[1], header[2]]) as usize;
    let mut payload = vec![0u8; length];
    if length > 0 {
        reader.read_exact(&mut payload).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::Protocol("stream ended mid-frame".to_string())
            } else {
                TransportError::Io(err)
            }
        })?;
    }

    Frame::decode(header[0], payload)
}

/// Write one frame and flush it
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}
