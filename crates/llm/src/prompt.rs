//! Prompt building
//!
//! Constructs the per-stage prompts handed to the extraction gateway. The
//! gateway owns the model; the contract here is the instruction text and
//! the JSON shape the response must come back in.

use crate::extractor::{ExtractionContext, ExtractionStage};

const RESPONSE_SHAPE: &str = r#"Respond with JSON only, in the shape:
{"partial": {"intent_type": "visit"|"delivery"|"unknown",
             "visitor_name": "", "apartment": "", "resident_name": ""},
 "message": "clarifying question for the visitor, or null"}
Leave fields you could not extract empty."#;

/// Build the prompt for one extraction stage
pub fn build_prompt(stage: ExtractionStage, context: &ExtractionContext) -> String {
    let instruction = match stage {
        ExtractionStage::IntentType => {
            "Decide why the visitor is at the gate: a visit, a delivery, or unknown. \
             Fill only intent_type."
        }
        ExtractionStage::VisitorName => {
            "Extract the visitor's own name if they stated it. Fill only visitor_name."
        }
        ExtractionStage::Location => {
            "Extract the apartment number and the resident's name the visitor is asking for. \
             Fill apartment and resident_name."
        }
    };

    format!(
        "You are the intake assistant of a residential building intercom.\n\
         {instruction}\n\n\
         Collected so far: intent_type={intent_type:?}, visitor_name={visitor_name:?}, \
         apartment={apartment:?}, resident_name={resident_name:?}\n\
         Conversation history:\n{history}\n\
         Visitor just said: {utterance:?}\n\n\
         {RESPONSE_SHAPE}",
        intent_type = context.partial.intent_type,
        visitor_name = context.partial.visitor_name,
        apartment = context.partial.apartment,
        resident_name = context.partial.resident_name,
        history = context.history,
        utterance = context.utterance,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use intercom_core::VisitIntent;

    #[test]
    fn test_prompt_carries_context() {
        let context = ExtractionContext {
            utterance: "Delivery for apartment 501, Daniel.".to_string(),
            history: "[visitor] hello".to_string(),
            partial: VisitIntent::default(),
        };

        let prompt = build_prompt(ExtractionStage::Location, &context);
        assert!(prompt.contains("apartment number"));
        assert!(prompt.contains("Delivery for apartment 501"));
        assert!(prompt.contains("Respond with JSON only"));
    }

    #[test]
    fn test_stage_specific_instructions() {
        let context = ExtractionContext {
            utterance: "hi".to_string(),
            history: String::new(),
            partial: VisitIntent::default(),
        };

        let p1 = build_prompt(ExtractionStage::IntentType, &context);
        let p2 = build_prompt(ExtractionStage::VisitorName, &context);
        assert!(p1.contains("why the visitor is at the gate"));
        assert!(p2.contains("visitor's own name"));
        assert_ne!(p1, p2);
    }
}
