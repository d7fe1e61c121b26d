//! Visit intent
//!
//! The record a visitor conversation progressively fills: why they are here,
//! who they are, and which apartment/resident they want. Fields start empty
//! and are only ever filled in, never overwritten by later extraction
//! stages.

use serde::{Deserialize, Serialize};

/// What the visitor wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentType {
    Visit,
    Delivery,
    #[default]
    Unknown,
}

impl IntentType {
    pub fn is_known(&self) -> bool {
        !matches!(self, IntentType::Unknown)
    }

    /// Short description used in prompts to the resident
    pub fn describe(&self) -> &'static str {
        match self {
            IntentType::Visit => "a visit",
            IntentType::Delivery => "a delivery",
            IntentType::Unknown => "an unspecified request",
        }
    }
}

/// The resident's decision, set at most once per session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationResult {
    Authorized,
    Denied,
}

/// Accumulating intent record for one session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisitIntent {
    #[serde(default)]
    pub intent_type: IntentType,
    #[serde(default)]
    pub visitor_name: String,
    #[serde(default)]
    pub apartment: String,
    #[serde(default)]
    pub resident_name: String,
    /// Normalized digits, recorded when validation succeeds
    #[serde(default)]
    pub resident_voip_number: Option<String>,
    #[serde(default)]
    pub authorization: Option<AuthorizationResult>,
}

impl VisitIntent {
    /// All four data-collection fields are filled
    pub fn is_complete(&self) -> bool {
        self.intent_type.is_known()
            && !self.visitor_name.trim().is_empty()
            && !self.apartment.trim().is_empty()
            && !self.resident_name.trim().is_empty()
    }

    /// Fold a partial extraction result in, filling only empty fields
    pub fn merge(&mut self, partial: &VisitIntent) {
        if !self.intent_type.is_known() && partial.intent_type.is_known() {
            self.intent_type = partial.intent_type;
        }
        if self.visitor_name.trim().is_empty() && !partial.visitor_name.trim().is_empty() {
            self.visitor_name = partial.visitor_name.clone();
        }
        if self.apartment.trim().is_empty() && !partial.apartment.trim().is_empty() {
            self.apartment = partial.apartment.clone();
        }
        if self.resident_name.trim().is_empty() && !partial.resident_name.trim().is_empty() {
            self.resident_name = partial.resident_name.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completeness() {
        let mut intent = VisitIntent::default();
        assert!(!intent.is_complete());

        intent.intent_type = IntentType::Delivery;
        intent.visitor_name = "Pedro".into();
        intent.apartment = "501".into();
        assert!(!intent.is_complete());

        intent.resident_name = "Daniel".into();
        assert!(intent.is_complete());
    }

    #[test]
    fn test_merge_fills_only_empty_fields() {
        let mut intent = VisitIntent {
            visitor_name: "Pedro".into(),
            ..Default::default()
        };

        let partial = VisitIntent {
            intent_type: IntentType::Visit,
            visitor_name: "Someone Else".into(),
            apartment: "501".into(),
            ..Default::default()
        };

        intent.merge(&partial);
        assert_eq!(intent.intent_type, IntentType::Visit);
        assert_eq!(intent.visitor_name, "Pedro");
        assert_eq!(intent.apartment, "501");
    }
}
