//! End-to-end conversation scenarios driven through the state machine

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use intercom_agent::{
    AgentError, ClickToCallPublisher, ClickToCallRequest, ConversationFlow, FlowEvent, FlowState,
    OutboundPolicy, Session,
};
use intercom_config::CallTerminationConfig;
use intercom_core::{
    AuthorizationResult, CallId, IntentType, MessagePurpose, OutboundMessage, TurnRole,
    VisitIntent,
};
use intercom_directory::{DirectoryEntry, DirectoryError, DirectoryStore, ExtensionRecord};
use intercom_llm::{
    ExtractionContext, ExtractionResult, ExtractionStage, IntentExtractor, LlmError,
};

/// Extractor whose knowledge is set by the test between utterances
struct ScriptedExtractor {
    known: Mutex<VisitIntent>,
}

impl ScriptedExtractor {
    fn new(known: VisitIntent) -> Arc<Self> {
        Arc::new(Self {
            known: Mutex::new(known),
        })
    }

    fn learn(&self, update: impl FnOnce(&mut VisitIntent)) {
        update(&mut self.known.lock());
    }
}

#[async_trait]
impl IntentExtractor for ScriptedExtractor {
    async fn extract(
        &self,
        stage: ExtractionStage,
        _context: &ExtractionContext,
    ) -> Result<ExtractionResult, LlmError> {
        let known = self.known.lock().clone();
        let mut partial = VisitIntent::default();
        match stage {
            ExtractionStage::IntentType => partial.intent_type = known.intent_type,
            ExtractionStage::VisitorName => partial.visitor_name = known.visitor_name,
            ExtractionStage::Location => {
                partial.apartment = known.apartment;
                partial.resident_name = known.resident_name;
            }
        }
        Ok(ExtractionResult {
            partial,
            message: Some("Could you tell me a bit more?".to_string()),
        })
    }
}

struct FixedDirectory {
    entries: Vec<DirectoryEntry>,
}

#[async_trait]
impl DirectoryStore for FixedDirectory {
    async fn list_extensions(&self) -> Result<Vec<ExtensionRecord>, DirectoryError> {
        Ok(Vec::new())
    }

    async fn find_apartment(
        &self,
        apartment: &str,
    ) -> Result<Option<DirectoryEntry>, DirectoryError> {
        Ok(self
            .entries
            .iter()
            .find(|e| e.apartment == apartment)
            .cloned())
    }
}

struct RecordingPublisher {
    published: Mutex<Vec<ClickToCallRequest>>,
    fail: bool,
}

impl RecordingPublisher {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            published: Mutex::new(Vec::new()),
            fail,
        })
    }
}

#[async_trait]
impl ClickToCallPublisher for RecordingPublisher {
    async fn publish(&self, request: &ClickToCallRequest) -> Result<(), AgentError> {
        if self.fail {
            return Err(AgentError::Bus("dns failure".to_string()));
        }
        self.published.lock().push(request.clone());
        Ok(())
    }
}

struct Harness {
    session: Arc<Session>,
    flow: ConversationFlow,
    extractor: Arc<ScriptedExtractor>,
    publisher: Arc<RecordingPublisher>,
}

fn directory_501() -> FixedDirectory {
    FixedDirectory {
        entries: vec![DirectoryEntry {
            apartment: "501".to_string(),
            residents: vec!["Daniel dos Reis".to_string()],
            voip_number: "sip:1003021@pbx.local".to_string(),
        }],
    }
}

fn harness(known: VisitIntent, bus_fails: bool) -> Harness {
    let call_id: CallId = "aaaaaaaa-aaaa-4aaa-aaaa-aaaaaaaaaaaa".parse().unwrap();
    let session = Arc::new(Session::new(call_id));
    let extractor = ScriptedExtractor::new(known);
    let publisher = RecordingPublisher::new(bus_fails);
    let flow = ConversationFlow::new(
        session.clone(),
        extractor.clone(),
        Arc::new(directory_501()),
        publisher.clone(),
        OutboundPolicy {
            max_attempts: 2,
            attempt_timeout: Duration::from_millis(400),
        },
        Arc::new(CallTerminationConfig::default()),
        "123456789012".to_string(),
    );
    Harness {
        session,
        flow,
        extractor,
        publisher,
    }
}

fn drain(session: &Session, role: TurnRole) -> Vec<OutboundMessage> {
    let mut out = Vec::new();
    while let Some(msg) = session.dequeue(role) {
        out.push(msg);
    }
    out
}

async fn wait_for_state(session: &Session, state: FlowState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while session.state() != state {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {state:?}, still in {:?}",
            session.state()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn scenario_a_happy_path_authorization() {
    let h = harness(
        VisitIntent {
            intent_type: IntentType::Delivery,
            apartment: "501".to_string(),
            resident_name: "Daniel".to_string(),
            ..Default::default()
        },
        false,
    );

    // First utterance: everything except the visitor's own name.
    h.flow
        .handle_event(FlowEvent::VisitorText(
            "Delivery for apartment 501, Daniel.".to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(h.session.state(), FlowState::Collecting);
    let msgs = drain(&h.session, TurnRole::Visitor);
    assert!(!msgs.is_empty(), "clarification expected");

    // Second utterance completes the intent and validation fires.
    h.extractor.learn(|k| k.visitor_name = "Pedro".to_string());
    h.flow
        .handle_event(FlowEvent::VisitorText("My name is Pedro.".to_string()))
        .await
        .unwrap();
    assert_eq!(h.session.state(), FlowState::Calling);

    // The orchestrator publishes from its own task.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while h.publisher.published.lock().is_empty() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "click-to-call never published"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let published = h.publisher.published.lock().clone();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].guid, "aaaaaaaa-aaaa-4aaa-aaaa-aaaaaaaaaaaa");
    assert_eq!(published[0].origin, "1003021");

    let status = drain(&h.session, TurnRole::Visitor);
    assert!(status
        .iter()
        .any(|m| m.text.to_lowercase().contains("wait")));

    // Resident leg connects under the same call id.
    h.session.attach_resident();
    h.flow
        .handle_event(FlowEvent::ResidentConnected)
        .await
        .unwrap();
    assert_eq!(h.session.state(), FlowState::CallInProgress);

    h.flow
        .handle_event(FlowEvent::ResidentAudioEstablished)
        .await
        .unwrap();
    assert_eq!(h.session.state(), FlowState::WaitingResident);

    let prompt = drain(&h.session, TurnRole::Resident);
    assert!(prompt[0].text.contains("501"));
    assert!(prompt[0].text.contains("Pedro"));

    // Resident authorizes.
    h.flow
        .handle_event(FlowEvent::ResidentText("Yes, let him in.".to_string()))
        .await
        .unwrap();
    assert_eq!(h.session.state(), FlowState::Finished);
    assert_eq!(
        h.session.intent().authorization,
        Some(AuthorizationResult::Authorized)
    );
    assert!(h.session.is_fully_terminated());

    let farewell = drain(&h.session, TurnRole::Visitor);
    assert!(farewell.iter().any(|m| m.is_farewell()
        && m.text == CallTerminationConfig::default().goodbye_messages.visitor.authorized));
    let resident_farewell = drain(&h.session, TurnRole::Resident);
    assert!(resident_farewell.iter().any(|m| m.is_farewell()));
}

#[tokio::test]
async fn scenario_b_denial() {
    let h = harness(
        VisitIntent {
            intent_type: IntentType::Visit,
            visitor_name: "Pedro".to_string(),
            apartment: "501".to_string(),
            resident_name: "Daniel".to_string(),
            ..Default::default()
        },
        false,
    );

    h.flow
        .handle_event(FlowEvent::VisitorText(
            "Visit for Daniel in 501, I'm Pedro.".to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(h.session.state(), FlowState::Calling);

    h.session.attach_resident();
    h.flow
        .handle_event(FlowEvent::ResidentAudioEstablished)
        .await
        .unwrap();

    h.flow
        .handle_event(FlowEvent::ResidentText("No.".to_string()))
        .await
        .unwrap();

    assert_eq!(h.session.state(), FlowState::Finished);
    assert_eq!(
        h.session.intent().authorization,
        Some(AuthorizationResult::Denied)
    );

    let farewell = drain(&h.session, TurnRole::Visitor);
    let denied_text = CallTerminationConfig::default().goodbye_messages.visitor.denied;
    assert!(farewell.iter().any(|m| m.text == denied_text));
}

#[tokio::test]
async fn scenario_c_resident_never_answers() {
    let h = harness(
        VisitIntent {
            intent_type: IntentType::Visit,
            visitor_name: "Pedro".to_string(),
            apartment: "501".to_string(),
            resident_name: "Daniel".to_string(),
            ..Default::default()
        },
        false,
    );

    h.flow
        .handle_event(FlowEvent::VisitorText("Visit for Daniel.".to_string()))
        .await
        .unwrap();
    assert_eq!(h.session.state(), FlowState::Calling);

    // Nobody attaches; both attempts must expire.
    wait_for_state(&h.session, FlowState::Finished).await;

    assert_eq!(h.publisher.published.lock().len(), 2);
    let msgs = drain(&h.session, TurnRole::Visitor);
    assert!(msgs
        .iter()
        .any(|m| m.text.to_lowercase().contains("unable to reach")));
    assert_eq!(h.session.intent().authorization, None);
}

#[tokio::test]
async fn scenario_d_fuzzy_mismatch_stays_collecting() {
    let h = harness(
        VisitIntent {
            intent_type: IntentType::Visit,
            visitor_name: "Pedro".to_string(),
            apartment: "501".to_string(),
            resident_name: "Zezé".to_string(),
            ..Default::default()
        },
        false,
    );

    h.flow
        .handle_event(FlowEvent::VisitorText("apartment 501, Zezé".to_string()))
        .await
        .unwrap();

    assert_eq!(h.session.state(), FlowState::Collecting);
    assert!(h.publisher.published.lock().is_empty());

    let msgs = drain(&h.session, TurnRole::Visitor);
    assert!(msgs
        .iter()
        .any(|m| m.purpose == MessagePurpose::Clarification
            && m.text.to_lowercase().contains("could not match")));
    // The mismatching name was cleared for re-collection.
    assert!(h.session.intent().resident_name.is_empty());
}

#[tokio::test]
async fn bus_failure_aborts_with_apology() {
    let h = harness(
        VisitIntent {
            intent_type: IntentType::Visit,
            visitor_name: "Pedro".to_string(),
            apartment: "501".to_string(),
            resident_name: "Daniel".to_string(),
            ..Default::default()
        },
        true,
    );

    h.flow
        .handle_event(FlowEvent::VisitorText("Visit for Daniel.".to_string()))
        .await
        .unwrap();

    wait_for_state(&h.session, FlowState::Finished).await;
    let msgs = drain(&h.session, TurnRole::Visitor);
    assert!(msgs.iter().any(|m| m.is_farewell()
        && m.text.to_lowercase().contains("could not place the call")));
    assert!(h.session.is_fully_terminated());
}

#[tokio::test]
async fn authorization_is_set_at_most_once() {
    let h = harness(
        VisitIntent {
            intent_type: IntentType::Visit,
            visitor_name: "Pedro".to_string(),
            apartment: "501".to_string(),
            resident_name: "Daniel".to_string(),
            ..Default::default()
        },
        false,
    );

    h.flow
        .handle_event(FlowEvent::VisitorText("Visit.".to_string()))
        .await
        .unwrap();
    h.session.attach_resident();
    h.flow
        .handle_event(FlowEvent::ResidentAudioEstablished)
        .await
        .unwrap();
    h.flow
        .handle_event(FlowEvent::ResidentText("yes".to_string()))
        .await
        .unwrap();

    // A second decision in FINISHED is history-only.
    h.flow
        .handle_event(FlowEvent::ResidentText("no".to_string()))
        .await
        .unwrap();
    assert_eq!(
        h.session.intent().authorization,
        Some(AuthorizationResult::Authorized)
    );
}

#[tokio::test]
async fn visitor_input_while_calling_is_history_only() {
    let h = harness(
        VisitIntent {
            intent_type: IntentType::Visit,
            visitor_name: "Pedro".to_string(),
            apartment: "501".to_string(),
            resident_name: "Daniel".to_string(),
            ..Default::default()
        },
        false,
    );

    h.flow
        .handle_event(FlowEvent::VisitorText("Visit for Daniel.".to_string()))
        .await
        .unwrap();
    assert_eq!(h.session.state(), FlowState::Calling);
    drain(&h.session, TurnRole::Visitor);

    let history_before = h.session.history().len();
    h.flow
        .handle_event(FlowEvent::VisitorText("Hello? Anyone?".to_string()))
        .await
        .unwrap();

    assert_eq!(h.session.state(), FlowState::Calling);
    assert!(drain(&h.session, TurnRole::Visitor).is_empty());
    assert_eq!(h.session.history().len(), history_before + 1);
}

#[tokio::test]
async fn resident_inquiry_keeps_waiting() {
    let h = harness(
        VisitIntent {
            intent_type: IntentType::Delivery,
            visitor_name: "Pedro".to_string(),
            apartment: "501".to_string(),
            resident_name: "Daniel".to_string(),
            ..Default::default()
        },
        false,
    );

    h.flow
        .handle_event(FlowEvent::VisitorText("Delivery.".to_string()))
        .await
        .unwrap();
    h.session.attach_resident();
    h.flow
        .handle_event(FlowEvent::ResidentAudioEstablished)
        .await
        .unwrap();
    drain(&h.session, TurnRole::Resident);

    h.flow
        .handle_event(FlowEvent::ResidentText("Who is it?".to_string()))
        .await
        .unwrap();
    assert_eq!(h.session.state(), FlowState::WaitingResident);
    let detail = drain(&h.session, TurnRole::Resident);
    assert!(detail[0].text.contains("Pedro"));

    // Ambiguous reply re-asks.
    h.flow
        .handle_event(FlowEvent::ResidentText("hmm maybe".to_string()))
        .await
        .unwrap();
    assert_eq!(h.session.state(), FlowState::WaitingResident);
    let reask = drain(&h.session, TurnRole::Resident);
    assert!(reask[0].text.contains("YES or NO"));
}
