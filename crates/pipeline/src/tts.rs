//! Synthesis capability
//!
//! Text-to-speech seam, mirror image of [`crate::stt`]. Output is SLIN
//! bytes ready to frame onto the wire.

use async_trait::async_trait;

use crate::PipelineError;

/// Text-to-speech capability
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text` with the given voice into SLIN PCM
    async fn synthesize(&self, voice: &str, text: &str) -> Result<Vec<u8>, PipelineError>;
}
