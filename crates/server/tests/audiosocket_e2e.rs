//! Full two-leg conversation over real sockets
//!
//! A fake PBX drives both legs of the AudioSocket protocol against a live
//! listener pair: visitor greeting, speech, validation, click-to-call,
//! resident decision, farewells and hangups, and finally session removal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::time::timeout;

use intercom_agent::{AgentError, ClickToCallPublisher, ClickToCallRequest};
use intercom_config::Settings;
use intercom_core::{audio::constant_frame, CallId, FRAME_SAMPLES};
use intercom_directory::{
    DirectoryEntry, DirectoryError, DirectoryStore, ExtensionRecord, SnapshotStore,
};
use intercom_llm::{
    ExtractionContext, ExtractionResult, ExtractionStage, IntentExtractor, LlmError,
};
use intercom_pipeline::{PhraseCache, PipelineError, Synthesizer, TranscribeHints, Transcriber};
use intercom_server::{ExtensionManager, LegDeps, ResourceManager, SessionRegistry};
use intercom_transport::{read_frame, write_frame, Frame, TransportError};

struct QueueTranscriber {
    texts: Mutex<Vec<String>>,
}

#[async_trait]
impl Transcriber for QueueTranscriber {
    async fn transcribe(
        &self,
        _audio: &[u8],
        _hints: &TranscribeHints,
    ) -> Result<Option<String>, PipelineError> {
        let mut texts = self.texts.lock();
        if texts.is_empty() {
            Ok(None)
        } else {
            Ok(Some(texts.remove(0)))
        }
    }
}

struct TestSynthesizer;

#[async_trait]
impl Synthesizer for TestSynthesizer {
    async fn synthesize(&self, _voice: &str, _text: &str) -> Result<Vec<u8>, PipelineError> {
        // Three frames of audible tone per message, regardless of text.
        Ok(constant_frame(1_000, FRAME_SAMPLES * 3))
    }
}

struct FullIntentExtractor;

#[async_trait]
impl IntentExtractor for FullIntentExtractor {
    async fn extract(
        &self,
        stage: ExtractionStage,
        _context: &ExtractionContext,
    ) -> Result<ExtractionResult, LlmError> {
        let mut partial = intercom_core::VisitIntent::default();
        match stage {
            ExtractionStage::IntentType => partial.intent_type = intercom_core::IntentType::Visit,
            ExtractionStage::VisitorName => partial.visitor_name = "Pedro".to_string(),
            ExtractionStage::Location => {
                partial.apartment = "501".to_string();
                partial.resident_name = "Daniel".to_string();
            }
        }
        Ok(ExtractionResult {
            partial,
            message: Some("Anything else?".to_string()),
        })
    }
}

struct TestDirectory;

#[async_trait]
impl DirectoryStore for TestDirectory {
    async fn list_extensions(&self) -> Result<Vec<ExtensionRecord>, DirectoryError> {
        Ok(Vec::new())
    }

    async fn find_apartment(
        &self,
        apartment: &str,
    ) -> Result<Option<DirectoryEntry>, DirectoryError> {
        if apartment == "501" {
            Ok(Some(DirectoryEntry {
                apartment: "501".to_string(),
                residents: vec!["Daniel dos Reis".to_string()],
                voip_number: "sip:1003021@pbx.local".to_string(),
            }))
        } else {
            Ok(None)
        }
    }
}

struct RecordingPublisher {
    published: Mutex<Vec<ClickToCallRequest>>,
}

#[async_trait]
impl ClickToCallPublisher for RecordingPublisher {
    async fn publish(&self, request: &ClickToCallRequest) -> Result<(), AgentError> {
        self.published.lock().push(request.clone());
        Ok(())
    }
}

fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.greeting.delay_seconds = 0.0;
    settings.greeting.message = "Hello, welcome!".to_string();
    settings.system.silence_threshold_seconds = 0.1; // 5-frame tail
    settings.system.goodbye_delay_seconds = 0.02;
    settings.system.cleanup_grace_seconds = 0.1;
    settings.audio.transmission_delay_ms = 1;
    settings.audio.post_audio_delay_seconds = 0.02;
    settings.audio.discard_buffer_frames = 2;
    settings.audio.anti_echo_guard_seconds = 0.05;
    settings.orchestrator.max_attempts = 1;
    settings.orchestrator.attempt_timeout_seconds = 5.0;
    settings
}

struct TestStack {
    registry: Arc<SessionRegistry>,
    publisher: Arc<RecordingPublisher>,
    extensions: ExtensionManager,
    visitor_port: u16,
    resident_port: u16,
    _cache_dir: tempfile::TempDir,
}

async fn start_stack(transcripts: Vec<&str>) -> TestStack {
    let cache_dir = tempfile::tempdir().unwrap();
    let settings = Arc::new(fast_settings());
    let registry = Arc::new(SessionRegistry::new());
    let resources = Arc::new(ResourceManager::new(&settings.resources));
    let publisher = Arc::new(RecordingPublisher {
        published: Mutex::new(Vec::new()),
    });

    let deps = LegDeps {
        settings: settings.clone(),
        registry: registry.clone(),
        resources,
        transcriber: Arc::new(QueueTranscriber {
            texts: Mutex::new(transcripts.into_iter().map(str::to_string).collect()),
        }),
        synthesizer: Arc::new(TestSynthesizer),
        extractor: Arc::new(FullIntentExtractor),
        directory: Arc::new(TestDirectory),
        publisher: publisher.clone(),
        cache: Arc::new(PhraseCache::new(cache_dir.path())),
    };

    let extensions = ExtensionManager::new(
        deps,
        SnapshotStore::new(cache_dir.path().join("ramais_config.json")),
    );
    extensions
        .start_pair(ExtensionRecord {
            id: 1,
            ia_number: "1000".to_string(),
            return_number: "1001".to_string(),
            bind_ip: "127.0.0.1".to_string(),
            ia_port: 0,
            return_port: 0,
            building_id: 1,
        })
        .await
        .unwrap();

    let status = extensions.status();
    let visitor_port = status[0].visitor_port;
    let resident_port = status[0].resident_port;

    TestStack {
        registry,
        publisher,
        extensions,
        visitor_port,
        resident_port,
        _cache_dir: cache_dir,
    }
}

async fn open_leg(port: u16, call_id: CallId) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    write_frame(&mut stream, &Frame::Id(call_id)).await.unwrap();
    stream
}

/// Read frames until the line is quiet for `quiet`; returns what was seen.
async fn drain_until_quiet(stream: &mut TcpStream, quiet: Duration) -> Vec<Frame> {
    let mut frames = Vec::new();
    loop {
        match timeout(quiet, read_frame(stream)).await {
            Ok(Ok(frame)) => frames.push(frame),
            Ok(Err(_)) | Err(_) => return frames,
        }
    }
}

/// Read until a HANGUP frame or EOF; returns whether HANGUP was seen.
async fn read_until_hangup(stream: &mut TcpStream) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        match timeout(Duration::from_secs(1), read_frame(stream)).await {
            Ok(Ok(Frame::Hangup)) => return true,
            Ok(Ok(_)) => {}
            Ok(Err(TransportError::Closed)) => return false,
            Ok(Err(_)) => return false,
            Err(_) => {}
        }
    }
    false
}

async fn speak(stream: &mut TcpStream, voiced_frames: usize, quiet_frames: usize) {
    for _ in 0..voiced_frames {
        write_frame(stream, &Frame::Slin(constant_frame(2_000, FRAME_SAMPLES)))
            .await
            .unwrap();
    }
    for _ in 0..quiet_frames {
        write_frame(stream, &Frame::Slin(constant_frame(10, FRAME_SAMPLES)))
            .await
            .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_conversation_authorization() {
    let stack = start_stack(vec![
        "Visit for Daniel in 501, I'm Pedro.",
        "Yes, let him in.",
    ])
    .await;

    let call_id: CallId = "aaaaaaaa-aaaa-4aaa-aaaa-aaaaaaaaaaaa".parse().unwrap();

    // Visitor leg: ID frame, then the greeting comes back as SLIN.
    let mut visitor = open_leg(stack.visitor_port, call_id).await;
    let greeting = drain_until_quiet(&mut visitor, Duration::from_millis(700)).await;
    assert!(
        greeting.iter().any(|f| matches!(f, Frame::Slin(_))),
        "greeting audio expected, got {greeting:?}"
    );

    // Clear of the anti-echo guard, the visitor states their business.
    tokio::time::sleep(Duration::from_millis(150)).await;
    speak(&mut visitor, 30, 8).await;

    // Validation passes and the click-to-call goes out.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while stack.publisher.published.lock().is_empty() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "click-to-call was never published"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    {
        let published = stack.publisher.published.lock();
        assert_eq!(published[0].guid, call_id.to_string());
        assert_eq!(published[0].origin, "1003021");
    }

    // Resident leg arrives under the same call id; no greeting, but the
    // context prompt plays once audio is established.
    let mut resident = open_leg(stack.resident_port, call_id).await;
    speak(&mut resident, 1, 0).await;
    let prompt = drain_until_quiet(&mut resident, Duration::from_millis(700)).await;
    assert!(
        prompt.iter().any(|f| matches!(f, Frame::Slin(_))),
        "context prompt expected, got {prompt:?}"
    );

    // Resident authorizes.
    tokio::time::sleep(Duration::from_millis(150)).await;
    speak(&mut resident, 20, 8).await;

    // Both legs hear a farewell and then the hangup frame.
    assert!(read_until_hangup(&mut visitor).await, "visitor hangup");
    assert!(read_until_hangup(&mut resident).await, "resident hangup");

    // The registry forgets the session within the cleanup grace.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while stack.registry.count() != 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "session was never removed"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hangup_wire_form_is_exact() {
    // Invariant: the active hangup is exactly 00 00 00 on the wire.
    assert_eq!(Frame::Hangup.encode(), vec![0x00, 0x00, 0x00]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn directory_changes_reconfigure_listeners() {
    use intercom_directory::{ChangeAction, DirectoryChange};

    let stack = start_stack(vec![]).await;
    assert_eq!(stack.extensions.active_pairs(), 1);

    // INSERT binds a second pair that accepts connections right away.
    stack
        .extensions
        .apply_change(DirectoryChange {
            action: ChangeAction::Insert,
            record: ExtensionRecord {
                id: 9,
                ia_number: "9000".to_string(),
                return_number: "9001".to_string(),
                bind_ip: "127.0.0.1".to_string(),
                ia_port: 0,
                return_port: 0,
                building_id: 2,
            },
        })
        .await;
    assert_eq!(stack.extensions.active_pairs(), 2);

    let new_pair = stack
        .extensions
        .status()
        .into_iter()
        .find(|s| s.id == 9)
        .expect("inserted pair is serving");
    assert!(TcpStream::connect(("127.0.0.1", new_pair.visitor_port))
        .await
        .is_ok());

    // DELETE stops it again; the change is mirrored to the snapshot.
    stack
        .extensions
        .apply_change(DirectoryChange {
            action: ChangeAction::Delete,
            record: ExtensionRecord {
                id: 9,
                ia_number: "9000".to_string(),
                return_number: "9001".to_string(),
                bind_ip: "127.0.0.1".to_string(),
                ia_port: 0,
                return_port: 0,
                building_id: 2,
            },
        })
        .await;
    assert_eq!(stack.extensions.active_pairs(), 1);
    assert!(stack
        ._cache_dir
        .path()
        .join("ramais_config.json")
        .exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stopping_a_pair_keeps_live_sessions() {
    let stack = start_stack(vec![]).await;
    let call_id = CallId::generate();

    let mut visitor = open_leg(stack.visitor_port, call_id).await;
    // Session exists once the ID frame lands.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while stack.registry.get(&call_id).is_none() {
        assert!(tokio::time::Instant::now() < deadline, "session not created");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Deleting the extension stops the listener but not the leg.
    assert!(stack.extensions.stop_pair(1));
    assert_eq!(stack.extensions.active_pairs(), 0);

    // The in-flight leg still responds: a frame write goes through and the
    // session is still registered.
    write_frame(&mut visitor, &Frame::Slin(constant_frame(10, FRAME_SAMPLES)))
        .await
        .unwrap();
    assert!(stack.registry.get(&call_id).is_some());

    // Wind down.
    write_frame(&mut visitor, &Frame::Hangup).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while stack.registry.count() != 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "session was never removed after hangup"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
