//! Voice Activity Detection
//!
//! Two interchangeable detectors behind one trait, selected by
//! configuration:
//!
//! - [`EnergyVad`] (`basic-vad`): per-frame energy classification. Emits
//!   SpeechStart on the first voiced frame and SpeechEnd once a silence
//!   tail confirms the utterance is over.
//! - [`SegmenterVad`] (`streaming-recognizer`): models engines that report
//!   only segment ends. Emits SpeechEnd after the configured end-of-segment
//!   timeout elapses with no voiced frame; the utterance collector's
//!   pre-buffer recovers the untracked onset.
//!
//! Neither detector filters anything — the cooperative filters live in
//! [`crate::utterance`].

use std::time::Duration;

use intercom_core::{average_energy, FRAME_DURATION_MS};

/// Detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    Silence,
    Speech,
}

/// Boundary events emitted by a detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStart,
    SpeechEnd,
}

/// VAD engine trait for pluggable implementations
pub trait VadEngine: Send {
    /// Process a single 20 ms SLIN frame
    fn process_frame(&mut self, pcm: &[u8]) -> Option<VadEvent>;

    /// Reset detector state
    fn reset(&mut self);

    /// Get current state
    fn state(&self) -> VadState;
}

/// Shared detector tuning
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// A frame at or above this average amplitude is voiced
    pub speech_threshold: f64,

    /// While in speech, a frame below this amplitude counts toward the
    /// end-of-speech confirmation tail
    pub end_confirm_threshold: f64,

    /// Silence tail that closes an utterance (basic-vad)
    pub silence_tail: Duration,

    /// End-of-segment timeout (streaming-recognizer)
    pub segment_timeout: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            speech_threshold: 600.0,
            end_confirm_threshold: 800.0,
            silence_tail: Duration::from_secs(2),
            segment_timeout: Duration::from_millis(1_200),
        }
    }
}

fn frames_in(duration: Duration) -> usize {
    (duration.as_millis() as u64 / FRAME_DURATION_MS).max(1) as usize
}

/// Per-frame energy detector (`basic-vad`)
pub struct EnergyVad {
    config: VadConfig,
    state: VadState,
    silence_frames: usize,
    silence_tail_frames: usize,
}

impl EnergyVad {
    pub fn new(config: VadConfig) -> Self {
        let silence_tail_frames = frames_in(config.silence_tail);
        Self {
            config,
            state: VadState::Silence,
            silence_frames: 0,
            silence_tail_frames,
        }
    }
}

impl VadEngine for EnergyVad {
    fn process_frame(&mut self, pcm: &[u8]) -> Option<VadEvent> {
        let energy = average_energy(pcm);

        match self.state {
            VadState::Silence => {
                if energy >= self.config.speech_threshold {
                    self.state = VadState::Speech;
                    self.silence_frames = 0;
                    return Some(VadEvent::SpeechStart);
                }
                None
            }
            VadState::Speech => {
                if energy < self.config.end_confirm_threshold {
                    self.silence_frames += 1;
                    if self.silence_frames >= self.silence_tail_frames {
                        self.state = VadState::Silence;
                        self.silence_frames = 0;
                        return Some(VadEvent::SpeechEnd);
                    }
                } else {
                    self.silence_frames = 0;
                }
                None
            }
        }
    }

    fn reset(&mut self) {
        self.state = VadState::Silence;
        self.silence_frames = 0;
    }

    fn state(&self) -> VadState {
        self.state
    }
}

/// End-driven segmenter (`streaming-recognizer`)
///
/// Never reports SpeechStart. Tracks whether any voiced frame has been seen
/// and closes the segment once the timeout's worth of quiet frames go by.
pub struct SegmenterVad {
    config: VadConfig,
    voiced_seen: bool,
    quiet_frames: usize,
    timeout_frames: usize,
}

impl SegmenterVad {
    pub fn new(config: VadConfig) -> Self {
        let timeout_frames = frames_in(config.segment_timeout);
        Self {
            config,
            voiced_seen: false,
            quiet_frames: 0,
            timeout_frames,
        }
    }

    /// Detectors for the resident leg run with a shorter segment timeout
    pub fn with_timeout(mut config: VadConfig, segment_timeout: Duration) -> Self {
        config.segment_timeout = segment_timeout;
        Self::new(config)
    }
}

impl VadEngine for SegmenterVad {
    fn process_frame(&mut self, pcm: &[u8]) -> Option<VadEvent> {
        let energy = average_energy(pcm);

        if energy >= self.config.speech_threshold {
            self.voiced_seen = true;
            self.quiet_frames = 0;
            return None;
        }

        if self.voiced_seen {
            self.quiet_frames += 1;
            if self.quiet_frames >= self.timeout_frames {
                self.voiced_seen = false;
                self.quiet_frames = 0;
                return Some(VadEvent::SpeechEnd);
            }
        }
        None
    }

    fn reset(&mut self) {
        self.voiced_seen = false;
        self.quiet_frames = 0;
    }

    fn state(&self) -> VadState {
        if self.voiced_seen {
            VadState::Speech
        } else {
            VadState::Silence
        }
    }
}
