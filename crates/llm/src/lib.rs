//! Intent extraction interface
//!
//! The LLM-backed extractor is an external collaborator; this crate owns
//! the seam and the staged-extraction contract. Extraction runs in three
//! stages — intent type, visitor name, then apartment + resident name —
//! and a stage only runs while its fields are still empty.

pub mod extractor;
pub mod prompt;

pub use extractor::{
    pending_stages, ExtractionContext, ExtractionResult, ExtractionStage, IntentExtractor,
};
pub use prompt::build_prompt;

use thiserror::Error;

/// Extraction errors
#[derive(Error, Debug)]
pub enum LlmError {
    /// Terminal provider failure (transients are retried in the adapter)
    #[error("extraction failure: {0}")]
    Capability(String),

    #[error("malformed extractor response: {0}")]
    InvalidResponse(String),
}
