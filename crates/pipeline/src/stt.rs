//! Transcription capability
//!
//! The speech-to-text provider is an external collaborator. This seam is
//! all the pipeline knows about it; concrete adapters live with the server
//! wiring. Adapters retry transient provider failures internally and only
//! surface terminal ones.

use std::time::Duration;

use async_trait::async_trait;

use crate::PipelineError;

/// Role-specific transcription hints
#[derive(Debug, Clone)]
pub struct TranscribeHints {
    /// Recognition language, e.g. `pt-BR`
    pub language: String,

    /// End-of-segment timeout forwarded to streaming recognizers. The
    /// resident leg uses a shorter value so bare "yes"/"no" replies close
    /// quickly.
    pub segment_timeout: Duration,
}

impl Default for TranscribeHints {
    fn default() -> Self {
        Self {
            language: "pt-BR".to_string(),
            segment_timeout: Duration::from_millis(1_200),
        }
    }
}

/// Speech-to-text capability
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one SLIN utterance.
    ///
    /// `Ok(None)` means the provider heard nothing recognizable; that is a
    /// normal outcome, not an error.
    async fn transcribe(
        &self,
        audio: &[u8],
        hints: &TranscribeHints,
    ) -> Result<Option<String>, PipelineError>;
}
