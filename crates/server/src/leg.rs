//! Leg handler
//!
//! One actor per TCP connection, with two cooperating subtasks: receive
//! (frames → VAD → transcription → state machine) and send (queue → cache
//! or synthesis → paced SLIN frames). Both yield at I/O boundaries and at
//! the termination poll tick, so a latched termination is observed within
//! half a second of the current operation finishing. The send subtask owns
//! shutdown: it drains at most one farewell, then writes the HANGUP frame.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use intercom_agent::{ClickToCallPublisher, ConversationFlow, FlowEvent, OutboundPolicy, Session};
use intercom_config::{Settings, VadKind};
use intercom_core::{MessagePurpose, OutboundMessage, TurnRole, FRAME_BYTES};
use intercom_directory::DirectoryStore;
use intercom_llm::IntentExtractor;
use intercom_pipeline::{
    EnergyVad, PhraseCache, SegmenterVad, Synthesizer, TranscribeHints, Transcriber, Utterance,
    UtteranceCollector, UtteranceConfig, VadConfig, VadEngine,
};
use intercom_transport::{read_frame, write_frame, Frame, TransportError};

use crate::registry::SessionRegistry;
use crate::resources::ResourceManager;
use crate::ServerError;

/// Latch observation cadence for both subtasks
const TERMINATE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Queue poll cadence on the send side
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How long the opening ID frame may take
const OPENING_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for the send subtask to deliver its farewell and hangup after
/// the receive subtask is gone
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Everything a leg handler needs, bundled for the accept loops
#[derive(Clone)]
pub struct LegDeps {
    pub settings: Arc<Settings>,
    pub registry: Arc<SessionRegistry>,
    pub resources: Arc<ResourceManager>,
    pub transcriber: Arc<dyn Transcriber>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub extractor: Arc<dyn IntentExtractor>,
    pub directory: Arc<dyn DirectoryStore>,
    pub publisher: Arc<dyn ClickToCallPublisher>,
    pub cache: Arc<PhraseCache>,
}

/// Echo suppression handshake between the send and receive subtasks
#[derive(Default)]
struct EchoGate {
    /// Instant the last outbound frame finished
    playback_end: Mutex<Option<Instant>>,
    /// Incoming frames still to be discarded
    discard: AtomicUsize,
}

impl EchoGate {
    fn mark_playback_end(&self) {
        *self.playback_end.lock() = Some(Instant::now());
    }

    fn take_playback_end(&self) -> Option<Instant> {
        self.playback_end.lock().take()
    }

    fn arm_discard(&self, frames: usize) {
        self.discard.store(frames, Ordering::SeqCst);
    }

    /// True while this frame falls in the discard window; the final
    /// discarded frame is reported so the caller can reset the detector.
    fn consume_discard(&self) -> Option<bool> {
        self.discard
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|previous| previous == 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveExit {
    PeerClosed,
    Terminated,
    ProtocolError,
}

/// Entry point for one accepted connection
pub async fn run_leg(role: TurnRole, stream: TcpStream, deps: LegDeps, port: u16) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    tracing::info!(role = role.as_str(), %peer, port, "leg connected");

    match leg_main(role, stream, deps, port).await {
        Ok(()) => tracing::info!(role = role.as_str(), %peer, "leg finished"),
        Err(ServerError::Transport(err)) if err.is_expected_reset() => {
            // Peer reset racing our close is normal PBX behavior.
            tracing::info!(role = role.as_str(), %peer, "peer reset during close");
        }
        Err(err) => tracing::error!(role = role.as_str(), %peer, %err, "leg failed"),
    }
}

async fn leg_main(
    role: TurnRole,
    stream: TcpStream,
    deps: LegDeps,
    port: u16,
) -> Result<(), ServerError> {
    let (mut reader, write_half) = stream.into_split();

    // The first frame must carry the call id.
    let opening = timeout(OPENING_FRAME_TIMEOUT, read_frame(&mut reader))
        .await
        .map_err(|_| {
            ServerError::Transport(TransportError::Protocol(
                "no ID frame before timeout".to_string(),
            ))
        })??;
    let Frame::Id(call_id) = opening else {
        return Err(ServerError::Transport(TransportError::Protocol(format!(
            "expected ID frame, got {:?}",
            opening.kind()
        ))));
    };

    tracing::info!(role = role.as_str(), %call_id, "call id received");

    let (session, created) = deps.registry.get_or_create(call_id);
    if created {
        deps.resources.register_session(call_id, Some(port));
    }

    let writer = Arc::new(tokio::sync::Mutex::new(write_half));
    deps.resources.register_connection(call_id, role, &writer);

    let flow = build_flow(&deps, &session);

    match role {
        TurnRole::Visitor => schedule_greeting(&deps, &session),
        TurnRole::Resident => {
            session.attach_resident();
            flow.handle_event(FlowEvent::ResidentConnected).await?;
        }
        TurnRole::System => {}
    }

    let gate = Arc::new(EchoGate::default());
    let leg_stop = Arc::new(AtomicBool::new(false));

    let send_task = tokio::spawn(send_loop(
        writer.clone(),
        role,
        session.clone(),
        deps.clone(),
        gate.clone(),
        leg_stop.clone(),
    ));

    let receive_result = receive_loop(&mut reader, role, &session, &flow, &deps, &gate).await;

    // The receive side is gone; let the send side finish its shutdown work
    // (farewell + hangup when terminated), then stop it.
    leg_stop.store(true, Ordering::SeqCst);
    match timeout(SHUTDOWN_GRACE, send_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) if matches!(&err, ServerError::Transport(t) if t.is_expected_reset()) => {
            tracing::info!(call_id = %session.call_id, "peer reset during send shutdown");
        }
        Ok(Ok(Err(err))) => tracing::warn!(call_id = %session.call_id, %err, "send subtask failed"),
        Ok(Err(join_err)) => {
            tracing::error!(call_id = %session.call_id, %join_err, "send subtask panicked")
        }
        Err(_) => tracing::warn!(call_id = %session.call_id, "send subtask overran shutdown grace"),
    }

    deps.resources.unregister_connection(&call_id, role);
    schedule_cleanup(&deps, &session);

    match receive_result {
        Ok(_) => Ok(()),
        Err(err) => {
            // A failed receive subtask is fatal for the whole session.
            session.terminate_all();
            Err(err)
        }
    }
}

fn build_flow(deps: &LegDeps, session: &Arc<Session>) -> ConversationFlow {
    ConversationFlow::new(
        session.clone(),
        deps.extractor.clone(),
        deps.directory.clone(),
        deps.publisher.clone(),
        OutboundPolicy {
            max_attempts: deps.settings.orchestrator.max_attempts,
            attempt_timeout: deps.settings.orchestrator.attempt_timeout(),
        },
        Arc::new(deps.settings.call_termination.clone()),
        deps.settings.bus.license.clone(),
    )
}

/// Queue the configured greeting after its delay. Only the visitor leg
/// greets; a resident attaching to an existing session gets the context
/// prompt from the state machine instead.
fn schedule_greeting(deps: &LegDeps, session: &Arc<Session>) {
    let session = session.clone();
    let greeting = deps.settings.greeting.clone();
    tokio::spawn(async move {
        tokio::time::sleep(greeting.delay()).await;
        if !session.is_terminated(TurnRole::Visitor) {
            session.enqueue(OutboundMessage::new(
                TurnRole::Visitor,
                MessagePurpose::Greeting,
                greeting.message,
            ));
        }
    });
}

fn build_vad(settings: &Settings, role: TurnRole) -> Box<dyn VadEngine> {
    let segment_timeout = Duration::from_millis(match role {
        TurnRole::Resident => settings.system.resident_segment_timeout_ms,
        _ => settings.system.azure_speech_segment_timeout_ms,
    });

    let config = VadConfig {
        speech_threshold: settings.audio.energy_threshold,
        end_confirm_threshold: settings.audio.energy_confirm_threshold,
        silence_tail: settings.system.silence_threshold(),
        segment_timeout,
    };

    match settings.system.voice_detection_type {
        VadKind::BasicVad => Box::new(EnergyVad::new(config)),
        VadKind::StreamingRecognizer => Box::new(SegmenterVad::new(config)),
    }
}

fn build_collector(settings: &Settings, role: TurnRole) -> UtteranceCollector {
    let prebuffer_frames =
        ((settings.audio.prebuffer_seconds * 1000.0) as u64 / 20).max(1) as usize;
    UtteranceCollector::new(UtteranceConfig {
        anti_echo_guard: settings.audio.anti_echo_guard(),
        min_frames: settings.audio.min_utterance_frames,
        // Short "yes"/"no" replies must survive on the resident leg.
        retain_short: role == TurnRole::Resident,
        energy_threshold: settings.audio.energy_threshold,
        energy_window_frames: settings.audio.min_utterance_frames,
        prebuffer_frames,
        watchdog: settings.audio.vad_watchdog(),
    })
}

async fn receive_loop(
    reader: &mut OwnedReadHalf,
    role: TurnRole,
    session: &Arc<Session>,
    flow: &ConversationFlow,
    deps: &LegDeps,
    gate: &Arc<EchoGate>,
) -> Result<ReceiveExit, ServerError> {
    let settings = &deps.settings;
    let mut vad = build_vad(settings, role);
    let mut collector = build_collector(settings, role);

    let hints = TranscribeHints {
        language: settings.speech.language.clone(),
        segment_timeout: Duration::from_millis(match role {
            TurnRole::Resident => settings.system.resident_segment_timeout_ms,
            _ => settings.system.azure_speech_segment_timeout_ms,
        }),
    };

    let started = Instant::now();
    let mut last_speech = Instant::now();
    let mut timeout_reported = false;
    let mut audio_established = false;

    loop {
        if session.is_terminated(role) {
            return Ok(ReceiveExit::Terminated);
        }

        if let Some(utterance) = collector.check_watchdog() {
            vad.reset();
            if transcribe_and_dispatch(role, session, flow, deps, &hints, utterance).await? {
                last_speech = Instant::now();
            }
        }

        let over_cap = started.elapsed() > settings.system.max_transaction_time();
        let over_silence = role == TurnRole::Resident
            && last_speech.elapsed() > settings.system.resident_max_silence();
        if (over_cap || over_silence) && !timeout_reported {
            timeout_reported = true;
            tracing::info!(
                call_id = %session.call_id,
                role = role.as_str(),
                over_cap,
                "leg timeout"
            );
            flow.handle_event(FlowEvent::LegTimeout(role)).await?;
            continue;
        }

        let frame = match timeout(TERMINATE_POLL_INTERVAL, read_frame(reader)).await {
            Err(_) => continue, // poll tick, re-check latches
            Ok(Err(TransportError::Closed)) => {
                flow.handle_event(FlowEvent::LegClosed(role)).await?;
                return Ok(ReceiveExit::PeerClosed);
            }
            Ok(Err(TransportError::Protocol(detail))) => {
                // Local to this leg; the session survives if the other leg
                // is still connected.
                tracing::warn!(call_id = %session.call_id, %detail, "protocol error, closing leg");
                return Ok(ReceiveExit::ProtocolError);
            }
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok(frame)) => frame,
        };

        match frame {
            Frame::Hangup => {
                tracing::info!(call_id = %session.call_id, role = role.as_str(), "peer hangup");
                flow.handle_event(FlowEvent::LegClosed(role)).await?;
                return Ok(ReceiveExit::PeerClosed);
            }
            Frame::Error { code, .. } => {
                tracing::warn!(call_id = %session.call_id, code, "peer error frame");
                flow.handle_event(FlowEvent::LegClosed(role)).await?;
                return Ok(ReceiveExit::PeerClosed);
            }
            // A repeated ID frame is tolerated and changes nothing.
            Frame::Id(_) => {}
            Frame::Slin(pcm) => {
                if !audio_established && role == TurnRole::Resident {
                    audio_established = true;
                    flow.handle_event(FlowEvent::ResidentAudioEstablished).await?;
                }

                if let Some(playback_end) = gate.take_playback_end() {
                    collector.note_playback_finished_at(playback_end);
                }
                if let Some(window_closed) = gate.consume_discard() {
                    // Tail of our own audio reflected back. After the last
                    // discarded frame, start from a clean slate.
                    if window_closed {
                        vad.reset();
                        collector.reset();
                    }
                    continue;
                }

                let event = vad.process_frame(&pcm);
                if event.is_some() {
                    last_speech = Instant::now();
                    session.touch();
                }
                if let Some(utterance) = collector.push_frame(&pcm, event) {
                    if transcribe_and_dispatch(role, session, flow, deps, &hints, utterance)
                        .await?
                    {
                        last_speech = Instant::now();
                    }
                }
            }
        }
    }
}

/// Returns whether usable text reached the state machine
async fn transcribe_and_dispatch(
    role: TurnRole,
    session: &Arc<Session>,
    flow: &ConversationFlow,
    deps: &LegDeps,
    hints: &TranscribeHints,
    utterance: Utterance,
) -> Result<bool, ServerError> {
    let slot = deps.resources.acquire_transcription().await?;
    let started = Instant::now();
    let outcome = deps.transcriber.transcribe(&utterance.pcm, hints).await;
    drop(slot);

    let text = match outcome {
        Ok(Some(text)) if !text.trim().is_empty() => text,
        Ok(_) => return Ok(false),
        Err(err) => {
            // Terminal capability failure: apologize, proceed with nothing.
            tracing::warn!(call_id = %session.call_id, %err, "transcription failed");
            session.enqueue(OutboundMessage::new(
                role,
                MessagePurpose::Apology,
                "Sorry, I could not hear you well. Could you repeat, please?",
            ));
            return Ok(false);
        }
    };

    deps.resources
        .record_transcription(&session.call_id, started.elapsed());
    tracing::info!(
        call_id = %session.call_id,
        role = role.as_str(),
        frames = utterance.frames,
        %text,
        "utterance transcribed"
    );

    let event = match role {
        TurnRole::Visitor => FlowEvent::VisitorText(text),
        TurnRole::Resident => FlowEvent::ResidentText(text),
        TurnRole::System => return Ok(false),
    };
    flow.handle_event(event).await?;
    Ok(true)
}

async fn send_loop(
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    role: TurnRole,
    session: Arc<Session>,
    deps: LegDeps,
    gate: Arc<EchoGate>,
    leg_stop: Arc<AtomicBool>,
) -> Result<(), ServerError> {
    let settings = &deps.settings;

    loop {
        if session.is_terminated(role) {
            // One-shot farewell drain, then the active hangup.
            if let Some(farewell) = next_farewell(&session, role) {
                if let Err(err) = play_message(&writer, &session, &deps, &gate, &farewell).await {
                    tracing::debug!(call_id = %session.call_id, %err, "farewell delivery failed");
                }
                tokio::time::sleep(settings.system.goodbye_delay()).await;
            }

            let mut w = writer.lock().await;
            match write_frame(&mut *w, &Frame::Hangup).await {
                Ok(()) => {
                    tracing::info!(call_id = %session.call_id, role = role.as_str(), "hangup sent")
                }
                Err(err) if err.is_expected_reset() => {
                    tracing::info!(call_id = %session.call_id, "peer reset before hangup");
                }
                Err(err) => return Err(err.into()),
            }
            return Ok(());
        }

        // Receive side died without session termination (protocol error):
        // nothing left to say on a broken leg.
        if leg_stop.load(Ordering::SeqCst) {
            return Ok(());
        }

        match session.dequeue(role) {
            Some(message) => {
                play_message(&writer, &session, &deps, &gate, &message).await?;
            }
            None => tokio::time::sleep(QUEUE_POLL_INTERVAL).await,
        }
    }
}

/// Messages still queued when termination latches; everything but one
/// farewell is dropped, and that farewell gets a single delivery attempt.
fn next_farewell(session: &Arc<Session>, role: TurnRole) -> Option<OutboundMessage> {
    while let Some(message) = session.dequeue(role) {
        if message.is_farewell() {
            return Some(message);
        }
        tracing::debug!(call_id = %session.call_id, "dropping queued message during shutdown");
    }
    None
}

/// Synthesize (or fetch from cache) and emit one message as paced SLIN
async fn play_message(
    writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    session: &Arc<Session>,
    deps: &LegDeps,
    gate: &Arc<EchoGate>,
    message: &OutboundMessage,
) -> Result<(), ServerError> {
    let settings = &deps.settings;
    let voice = &settings.greeting.voice;

    let key = PhraseCache::key(voice, &message.text);
    let pcm = match deps.cache.lookup(&key).await {
        // Cache hits skip the synthesis slot entirely.
        Some(hit) => hit,
        None => {
            let slot = deps.resources.acquire_synthesis().await?;
            let started = Instant::now();
            let outcome = deps.synthesizer.synthesize(voice, &message.text).await;
            drop(slot);
            match outcome {
                Ok(pcm) => {
                    deps.resources
                        .record_synthesis(&session.call_id, started.elapsed());
                    if let Err(err) = deps.cache.store(&key, &pcm).await {
                        tracing::warn!(%err, "phrase cache store failed");
                    }
                    pcm
                }
                Err(err) => {
                    tracing::warn!(call_id = %session.call_id, %err, "synthesis failed, skipping message");
                    return Ok(());
                }
            }
        }
    };

    // Pacing widens under load; the flag is sampled, not per-frame.
    let mut delay = settings.audio.transmission_delay();
    if deps.resources.throttle_audio() {
        delay = delay.mul_f64(1.5);
    }

    tracing::debug!(
        call_id = %session.call_id,
        bytes = pcm.len(),
        purpose = ?message.purpose,
        "sending audio"
    );

    {
        let mut w = writer.lock().await;
        for chunk in pcm.chunks(FRAME_BYTES) {
            write_frame(&mut *w, &Frame::Slin(chunk.to_vec())).await?;
            tokio::time::sleep(delay).await;
        }
    }

    gate.mark_playback_end();
    session.touch();

    tokio::time::sleep(settings.audio.post_audio_delay()).await;
    gate.arm_discard(settings.audio.discard_buffer_frames);

    Ok(())
}

/// After a leg exits: once the session is fully terminated, wait the
/// cleanup grace and remove it. Scheduled by both legs; removal is
/// idempotent.
fn schedule_cleanup(deps: &LegDeps, session: &Arc<Session>) {
    let registry = deps.registry.clone();
    let resources = deps.resources.clone();
    let session = session.clone();
    let grace = deps.settings.system.cleanup_grace();
    let cap = deps.settings.system.max_transaction_time();

    tokio::spawn(async move {
        // Wait for both latches and for the other leg to let go of its
        // connection, so removal really is the last event.
        let deadline = tokio::time::Instant::now() + cap;
        while (!session.is_fully_terminated()
            || !resources.connected_roles(&session.call_id).is_empty())
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(TERMINATE_POLL_INTERVAL).await;
        }
        if !session.is_fully_terminated() {
            tracing::warn!(call_id = %session.call_id, "forcing termination at cleanup deadline");
            session.terminate_all();
        }
        tokio::time::sleep(grace).await;
        registry.complete(&session.call_id);
        resources.unregister_session(&session.call_id);
    });
}
