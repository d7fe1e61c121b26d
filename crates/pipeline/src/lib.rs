//! Per-leg audio pipeline
//!
//! Everything between raw SLIN frames and text: voice-activity detection,
//! utterance collection with its cooperative filters, the transcription and
//! synthesis capability seams, and the content-addressed phrase cache.

pub mod cache;
pub mod stt;
pub mod tts;
pub mod utterance;
pub mod vad;

pub use cache::PhraseCache;
pub use stt::{TranscribeHints, Transcriber};
pub use tts::Synthesizer;
pub use utterance::{Utterance, UtteranceCollector, UtteranceConfig};
pub use vad::{EnergyVad, SegmenterVad, VadConfig, VadEngine, VadEvent, VadState};

use thiserror::Error;

/// Pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Terminal capability failure. Transient failures are retried inside
    /// the capability adapters and never reach this layer.
    #[error("capability failure: {0}")]
    Capability(String),

    #[error("cache i/o error: {0}")]
    Cache(#[from] std::io::Error),
}
