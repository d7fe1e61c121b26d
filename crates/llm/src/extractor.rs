//! Extraction stages and the extractor seam

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use intercom_core::VisitIntent;

use crate::LlmError;

/// One pass of the staged extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStage {
    /// Why is the visitor here (visit, delivery, …)
    IntentType,
    /// Who is the visitor
    VisitorName,
    /// Which apartment and which resident
    Location,
}

/// Input handed to the extractor for one stage
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionContext {
    /// The transcribed visitor utterance being processed
    pub utterance: String,
    /// Rendered conversation history
    pub history: String,
    /// Everything collected so far
    pub partial: VisitIntent,
}

/// What a stage produced
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractionResult {
    /// Newly extracted fields; empty fields leave the intent untouched
    #[serde(default)]
    pub partial: VisitIntent,
    /// Clarifying utterance for the visitor, when the stage needs more
    #[serde(default)]
    pub message: Option<String>,
}

/// Intent extraction capability
#[async_trait]
pub trait IntentExtractor: Send + Sync {
    async fn extract(
        &self,
        stage: ExtractionStage,
        context: &ExtractionContext,
    ) -> Result<ExtractionResult, LlmError>;
}

/// Stages that still have empty fields, in contract order
pub fn pending_stages(intent: &VisitIntent) -> Vec<ExtractionStage> {
    let mut stages = Vec::new();
    if !intent.intent_type.is_known() {
        stages.push(ExtractionStage::IntentType);
    }
    if intent.visitor_name.trim().is_empty() {
        stages.push(ExtractionStage::VisitorName);
    }
    if intent.apartment.trim().is_empty() || intent.resident_name.trim().is_empty() {
        stages.push(ExtractionStage::Location);
    }
    stages
}
