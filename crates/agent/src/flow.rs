//! Conversation state machine
//!
//! One tagged state per session, advanced by a single entry point:
//! [`ConversationFlow::handle_event`]. Events are serialized per session,
//! so the state after event N is the starting state for event N+1. Leg
//! handlers and the orchestrator only emit events; every conversational
//! mutation happens here.
//!
//! ```text
//! Collecting -> Validated -> Calling -> CallInProgress -> WaitingResident -> Finished
//!      \____________________________ abort ____________________________________/
//! ```

use std::fmt;
use std::sync::Arc;

use intercom_config::{CallTerminationConfig, GoodbyeSet};
use intercom_core::{
    AuthorizationResult, MessagePurpose, OutboundMessage, Turn, TurnRole, VisitIntent,
};
use intercom_directory::{validate_visit, DirectoryStore, ValidationOutcome};
use intercom_llm::{pending_stages, ExtractionContext, IntentExtractor};

use crate::outbound::{
    self, ClickToCallPublisher, ClickToCallRequest, OutboundOutcome, OutboundPolicy,
};
use crate::session::Session;
use crate::AgentError;

/// Session dialog state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Gathering intent type, visitor name, apartment and resident
    Collecting,
    /// Directory validation passed
    Validated,
    /// Click-to-call dispatched, waiting for the resident leg
    Calling,
    /// Resident leg attached, audio not yet established
    CallInProgress,
    /// Resident heard the context prompt, waiting for a decision
    WaitingResident,
    /// Farewells queued, termination latched
    Finished,
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowState::Collecting => "COLLECTING",
            FlowState::Validated => "VALIDATED",
            FlowState::Calling => "CALLING",
            FlowState::CallInProgress => "CALL_IN_PROGRESS",
            FlowState::WaitingResident => "WAITING_RESIDENT",
            FlowState::Finished => "FINISHED",
        };
        f.write_str(name)
    }
}

/// Events the state machine consumes
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// Transcribed visitor speech
    VisitorText(String),
    /// Transcribed resident speech
    ResidentText(String),
    /// Resident leg attached to the session
    ResidentConnected,
    /// First audio arrived on the resident leg
    ResidentAudioEstablished,
    /// Every outbound attempt timed out without a resident connection
    OutboundExhausted,
    /// Bus transport failure; terminal by design
    OutboundFailed(String),
    /// A leg exceeded its silence budget or the absolute cap
    LegTimeout(TurnRole),
    /// A leg disconnected
    LegClosed(TurnRole),
}

/// What the resident's reply meant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Inquiry,
    Authorize,
    Deny,
    Ambiguous,
}

/// Per-session dialog driver. Cheap to clone; clones share the session and
/// its event serialization.
#[derive(Clone)]
pub struct ConversationFlow {
    session: Arc<Session>,
    extractor: Arc<dyn IntentExtractor>,
    directory: Arc<dyn DirectoryStore>,
    publisher: Arc<dyn ClickToCallPublisher>,
    policy: OutboundPolicy,
    termination: Arc<CallTerminationConfig>,
    bus_license: String,
}

impl ConversationFlow {
    pub fn new(
        session: Arc<Session>,
        extractor: Arc<dyn IntentExtractor>,
        directory: Arc<dyn DirectoryStore>,
        publisher: Arc<dyn ClickToCallPublisher>,
        policy: OutboundPolicy,
        termination: Arc<CallTerminationConfig>,
        bus_license: String,
    ) -> Self {
        Self {
            session,
            extractor,
            directory,
            publisher,
            policy,
            termination,
            bus_license,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Advance the session by one event
    pub async fn handle_event(&self, event: FlowEvent) -> Result<(), AgentError> {
        let _serialized = self.session.event_lock.lock().await;
        self.session.touch();

        match event {
            FlowEvent::VisitorText(text) => {
                self.session.push_history(Turn::new(TurnRole::Visitor, text.clone()));
                match self.session.state() {
                    FlowState::Collecting => self.collect(&text).await,
                    // Visitor input while calling or deciding changes nothing.
                    _ => Ok(()),
                }
            }
            FlowEvent::ResidentText(text) => {
                self.session.push_history(Turn::new(TurnRole::Resident, text.clone()));
                match self.session.state() {
                    FlowState::Calling | FlowState::CallInProgress => {
                        // Text beat the audio-established event; both orders
                        // are valid. Prompt, then honor a clear decision.
                        self.enter_waiting_resident();
                        match self.classify(&text) {
                            Decision::Authorize => {
                                self.finalize(Some(AuthorizationResult::Authorized)).await
                            }
                            Decision::Deny => {
                                self.finalize(Some(AuthorizationResult::Denied)).await
                            }
                            Decision::Inquiry | Decision::Ambiguous => Ok(()),
                        }
                    }
                    FlowState::WaitingResident => self.decide(&text).await,
                    _ => Ok(()),
                }
            }
            FlowEvent::ResidentConnected => {
                if self.session.state() == FlowState::Calling {
                    self.session.set_state(FlowState::CallInProgress);
                }
                Ok(())
            }
            FlowEvent::ResidentAudioEstablished => {
                if matches!(
                    self.session.state(),
                    FlowState::Calling | FlowState::CallInProgress
                ) {
                    self.enter_waiting_resident();
                }
                Ok(())
            }
            FlowEvent::OutboundExhausted => {
                // This message doubles as the farewell: during shutdown each
                // leg delivers exactly one farewell before the hangup.
                self.say(
                    TurnRole::Visitor,
                    MessagePurpose::Farewell,
                    "We were unable to reach the resident. Please try again later. Goodbye.",
                );
                self.finalize_with(None, false).await
            }
            FlowEvent::OutboundFailed(detail) => {
                tracing::error!(call_id = %self.session.call_id, %detail, "click-to-call failed");
                self.say(
                    TurnRole::Visitor,
                    MessagePurpose::Farewell,
                    "Sorry, we could not place the call to the resident. Please try again later.",
                );
                self.finalize_with(None, false).await
            }
            FlowEvent::LegTimeout(role) => {
                tracing::info!(call_id = %self.session.call_id, role = role.as_str(), "leg timed out");
                self.finalize(None).await
            }
            FlowEvent::LegClosed(role) => {
                if self.session.state() == FlowState::Finished {
                    return Ok(());
                }
                tracing::info!(call_id = %self.session.call_id, role = role.as_str(), "leg closed early");
                self.finalize(None).await
            }
        }
    }

    /// Data-collection stage: run the pending extraction stages, then try
    /// directory validation once all four fields are filled.
    async fn collect(&self, text: &str) -> Result<(), AgentError> {
        let history = self.render_history();
        let mut clarification: Option<String> = None;

        // Each pending stage runs at most once per utterance; a later stage
        // sees whatever the earlier ones just filled in.
        let mut attempted: Vec<intercom_llm::ExtractionStage> = Vec::new();
        loop {
            let partial = self.session.intent();
            let Some(stage) = pending_stages(&partial)
                .into_iter()
                .find(|s| !attempted.contains(s))
            else {
                break;
            };
            attempted.push(stage);

            let context = ExtractionContext {
                utterance: text.to_string(),
                history: history.clone(),
                partial,
            };

            match self.extractor.extract(stage, &context).await {
                Ok(result) => {
                    self.session.with_intent(|intent| intent.merge(&result.partial));
                    if let Some(message) = result.message {
                        clarification = Some(message);
                    }
                }
                Err(err) => {
                    tracing::warn!(call_id = %self.session.call_id, %err, "intent extraction failed");
                    self.say(
                        TurnRole::Visitor,
                        MessagePurpose::Apology,
                        "Sorry, I did not catch that. Could you repeat, please?",
                    );
                    return Ok(());
                }
            }
        }

        let intent = self.session.intent();
        if intent.is_complete() {
            self.validate(intent).await
        } else {
            if let Some(message) = clarification {
                self.say(TurnRole::Visitor, MessagePurpose::Clarification, message);
            }
            Ok(())
        }
    }

    /// Fuzzy validation against the directory
    async fn validate(&self, intent: VisitIntent) -> Result<(), AgentError> {
        let entry = match self.directory.find_apartment(&intent.apartment).await {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(call_id = %self.session.call_id, %err, "directory lookup failed");
                self.say(
                    TurnRole::Visitor,
                    MessagePurpose::Apology,
                    "Sorry, I cannot check the directory right now. One moment, please.",
                );
                return Ok(());
            }
        };

        match validate_visit(entry.as_ref(), &intent.resident_name) {
            ValidationOutcome::Matched { voip_number, score } => {
                tracing::info!(
                    call_id = %self.session.call_id,
                    score,
                    apartment = %intent.apartment,
                    "visit validated"
                );
                self.session
                    .with_intent(|i| i.resident_voip_number = Some(voip_number));
                self.session.set_state(FlowState::Validated);
                self.say(
                    TurnRole::Visitor,
                    MessagePurpose::Status,
                    "Thank you, we have everything we need. Please wait while we contact the resident.",
                );
                self.session.set_state(FlowState::Calling);
                self.start_outbound();
                Ok(())
            }
            ValidationOutcome::ApartmentNotFound => {
                // Clear the field so the next utterance re-runs its stage.
                self.session.with_intent(|i| i.apartment.clear());
                self.say(
                    TurnRole::Visitor,
                    MessagePurpose::Clarification,
                    format!(
                        "I could not find apartment {} in this building. \
                         Which apartment are you visiting?",
                        intent.apartment
                    ),
                );
                Ok(())
            }
            ValidationOutcome::ResidentNotMatched { best_score } => {
                tracing::info!(
                    call_id = %self.session.call_id,
                    best_score,
                    "resident not matched"
                );
                self.session.with_intent(|i| i.resident_name.clear());
                self.say(
                    TurnRole::Visitor,
                    MessagePurpose::Clarification,
                    format!(
                        "I could not match a resident named {} in apartment {}. \
                         Who are you looking for?",
                        intent.resident_name, intent.apartment
                    ),
                );
                Ok(())
            }
        }
    }

    /// Dispatch the orchestrator on its own task
    fn start_outbound(&self) {
        let intent = self.session.intent();
        let Some(origin) = intent.resident_voip_number.clone() else {
            tracing::error!(call_id = %self.session.call_id, "calling without a voip number");
            return;
        };

        let request = ClickToCallRequest::new(self.session.call_id, origin, &self.bus_license);
        let flow = self.clone();
        let session = self.session.clone();
        let publisher = self.publisher.clone();
        let policy = self.policy.clone();

        tokio::spawn(async move {
            let outcome = outbound::run_outbound(session, publisher, request, policy).await;
            let event = match outcome {
                OutboundOutcome::Attached | OutboundOutcome::Terminated => return,
                OutboundOutcome::Exhausted => FlowEvent::OutboundExhausted,
                OutboundOutcome::BusFatal(detail) => FlowEvent::OutboundFailed(detail),
            };
            if let Err(err) = flow.handle_event(event).await {
                tracing::error!(%err, "outbound outcome handling failed");
            }
        });
    }

    fn enter_waiting_resident(&self) {
        self.session.set_state(FlowState::WaitingResident);
        let intent = self.session.intent();
        let visitor = if intent.visitor_name.is_empty() {
            "a visitor".to_string()
        } else {
            intent.visitor_name.clone()
        };
        self.say(
            TurnRole::Resident,
            MessagePurpose::ContextPrompt,
            format!(
                "Resident of apartment {}: {} is at the gate requesting {}. \
                 Do you authorize entry? Say YES or NO.",
                intent.apartment,
                visitor,
                intent.intent_type.describe()
            ),
        );
    }

    /// Resident decision parsing
    async fn decide(&self, text: &str) -> Result<(), AgentError> {
        match self.classify(text) {
            Decision::Inquiry => {
                let intent = self.session.intent();
                self.say(
                    TurnRole::Resident,
                    MessagePurpose::ContextPrompt,
                    format!(
                        "{} is at the gate of apartment {} for {}. \
                         Say YES to authorize or NO to deny.",
                        if intent.visitor_name.is_empty() {
                            "A visitor".to_string()
                        } else {
                            intent.visitor_name.clone()
                        },
                        intent.apartment,
                        intent.intent_type.describe()
                    ),
                );
                Ok(())
            }
            Decision::Authorize => self.finalize(Some(AuthorizationResult::Authorized)).await,
            Decision::Deny => self.finalize(Some(AuthorizationResult::Denied)).await,
            Decision::Ambiguous => {
                self.say(
                    TurnRole::Resident,
                    MessagePurpose::Clarification,
                    "I did not understand. Please answer YES or NO.",
                );
                Ok(())
            }
        }
    }

    fn classify(&self, text: &str) -> Decision {
        let lower = text.to_lowercase();
        if lower.contains('?') || lower.contains("who") || lower.contains("quem") {
            return Decision::Inquiry;
        }

        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric() && c != '\'')
            .filter(|w| !w.is_empty())
            .collect();

        let matches_token = |token: &str| {
            if token.contains(' ') {
                lower.contains(token)
            } else {
                words.iter().any(|w| *w == token)
            }
        };

        // Negations first: "não autorizo" must read as a denial even though
        // it contains an affirmative token.
        if self
            .termination
            .negative_tokens
            .iter()
            .any(|t| matches_token(&t.to_lowercase()))
        {
            return Decision::Deny;
        }
        if self
            .termination
            .affirmative_tokens
            .iter()
            .any(|t| matches_token(&t.to_lowercase()))
        {
            return Decision::Authorize;
        }
        Decision::Ambiguous
    }

    /// Abort path: any state can finalize. Queues role + outcome keyed
    /// farewells, then latches termination on both legs. Safe to call from
    /// concurrent shutdown paths; the second caller observes FINISHED and
    /// does nothing.
    async fn finalize(&self, result: Option<AuthorizationResult>) -> Result<(), AgentError> {
        self.finalize_with(result, true).await
    }

    /// `visitor_farewell: false` when the caller already queued the
    /// visitor's terminal message itself.
    async fn finalize_with(
        &self,
        result: Option<AuthorizationResult>,
        visitor_farewell: bool,
    ) -> Result<(), AgentError> {
        if self.session.state() == FlowState::Finished {
            return Ok(());
        }

        if let Some(result) = result {
            if let Err(err) = self.session.set_authorization(result) {
                // Invariant violation is fatal for the session.
                self.session.set_state(FlowState::Finished);
                self.session.terminate_all();
                return Err(err);
            }
        }

        self.session.set_state(FlowState::Finished);

        let outcome = self.session.intent().authorization;
        let messages = &self.termination.goodbye_messages;
        if visitor_farewell {
            self.say(
                TurnRole::Visitor,
                MessagePurpose::Farewell,
                pick_goodbye(&messages.visitor, outcome),
            );
        }
        if self.session.resident_is_attached() {
            self.say(
                TurnRole::Resident,
                MessagePurpose::Farewell,
                pick_goodbye(&messages.resident, outcome),
            );
        }

        self.session.terminate_all();
        Ok(())
    }

    fn say(&self, role: TurnRole, purpose: MessagePurpose, text: impl Into<String>) {
        let text = text.into();
        self.session
            .push_history(Turn::new(TurnRole::System, text.clone()));
        self.session
            .enqueue(OutboundMessage::new(role, purpose, text));
    }

    fn render_history(&self) -> String {
        self.session
            .history()
            .iter()
            .rev()
            .take(10)
            .rev()
            .map(|turn| format!("[{}] {}", turn.role.as_str(), turn.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn pick_goodbye(set: &GoodbyeSet, outcome: Option<AuthorizationResult>) -> String {
    match outcome {
        Some(AuthorizationResult::Authorized) => set.authorized.clone(),
        Some(AuthorizationResult::Denied) => set.denied.clone(),
        None => set.default.clone(),
    }
}
