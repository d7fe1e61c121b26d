//! Utterance collection and cooperative filtering
//!
//! Sits between a [`crate::vad::VadEngine`] and transcription. Buffers
//! frames, keeps a rolling pre-buffer for engines that only report segment
//! ends, and applies the filters that keep garbage away from the
//! transcriber:
//!
//! 1. anti-echo guard after our own playback,
//! 2. bare SpeechEnd without any onset is dropped,
//! 3. minimum length (waived where short replies are expected),
//! 4. minimum average energy over the final frames (strict `<` rejects).
//!
//! A watchdog force-closes utterances the detector never ends.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use intercom_core::{average_energy, FRAME_BYTES};

use crate::vad::VadEvent;

/// Collector tuning
#[derive(Debug, Clone)]
pub struct UtteranceConfig {
    /// SpeechEnd this close to the end of our own audio is echo
    pub anti_echo_guard: Duration,

    /// Utterances below this frame count are dropped
    pub min_frames: usize,

    /// Keep sub-minimum utterances ("yes"/"no" replies on the resident leg)
    pub retain_short: bool,

    /// Average-amplitude floor for transcription admission
    pub energy_threshold: f64,

    /// How many final frames the energy check averages over
    pub energy_window_frames: usize,

    /// Rolling pre-buffer capacity in frames (2 s of audio)
    pub prebuffer_frames: usize,

    /// SpeechStart with no SpeechEnd for this long forces a close
    pub watchdog: Duration,
}

impl Default for UtteranceConfig {
    fn default() -> Self {
        Self {
            anti_echo_guard: Duration::from_millis(1_500),
            min_frames: 15,
            retain_short: false,
            energy_threshold: 600.0,
            energy_window_frames: 15,
            prebuffer_frames: 100,
            watchdog: Duration::from_secs(10),
        }
    }
}

/// A completed utterance ready for transcription
#[derive(Debug, Clone)]
pub struct Utterance {
    pub pcm: Vec<u8>,
    pub frames: usize,
}

/// Why a SpeechEnd produced no utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropReason {
    EchoGuard,
    NoStart,
    TooShort,
    TooQuiet,
}

/// Per-leg utterance collector
pub struct UtteranceCollector {
    config: UtteranceConfig,
    prebuffer: VecDeque<Vec<u8>>,
    collected: Vec<u8>,
    collected_frames: usize,
    in_progress: bool,
    started_at: Option<Instant>,
    last_playback_end: Option<Instant>,
}

impl UtteranceCollector {
    pub fn new(config: UtteranceConfig) -> Self {
        Self {
            config,
            prebuffer: VecDeque::new(),
            collected: Vec::new(),
            collected_frames: 0,
            in_progress: false,
            started_at: None,
            last_playback_end: None,
        }
    }

    /// Feed one frame plus whatever event the detector produced for it.
    ///
    /// Returns a finished utterance when a SpeechEnd survives the filters.
    pub fn push_frame(&mut self, pcm: &[u8], event: Option<VadEvent>) -> Option<Utterance> {
        if self.in_progress {
            self.collected.extend_from_slice(pcm);
            self.collected_frames += 1;
        } else {
            self.prebuffer.push_back(pcm.to_vec());
            while self.prebuffer.len() > self.config.prebuffer_frames {
                self.prebuffer.pop_front();
            }

            // Engines that report only segment ends never emit SpeechStart;
            // a voiced frame marks the onset so the no-start filter only
            // rejects truly silent segments.
            let self_detected = average_energy(pcm) >= self.config.energy_threshold;
            if event == Some(VadEvent::SpeechStart) || self_detected {
                self.begin();
            }
        }

        if event == Some(VadEvent::SpeechEnd) {
            if !self.in_progress {
                self.log_drop(DropReason::NoStart);
                return None;
            }
            return self.finish(false);
        }
        None
    }

    /// Force-close a stuck utterance. Returns the audio collected so far
    /// when the collector has an utterance in progress past the watchdog.
    pub fn check_watchdog(&mut self) -> Option<Utterance> {
        let started = self.started_at?;
        if self.in_progress && started.elapsed() > self.config.watchdog {
            tracing::warn!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "speech never ended, forcing utterance closed"
            );
            return self.finish(true);
        }
        None
    }

    /// Record that our own outbound audio just finished playing. Starts the
    /// anti-echo guard window.
    pub fn note_playback_finished(&mut self) {
        self.last_playback_end = Some(Instant::now());
    }

    /// Same, with the exact instant the last frame went out. Used when the
    /// send side observed the completion before the receive side got to
    /// record it.
    pub fn note_playback_finished_at(&mut self, at: Instant) {
        self.last_playback_end = Some(at);
    }

    /// Clear the utterance-in-progress flag, the pre-buffer, and the
    /// collected audio. Called at session creation, after outbound audio,
    /// and on state-machine request. Does not clear the echo-guard clock.
    pub fn reset(&mut self) {
        self.prebuffer.clear();
        self.collected.clear();
        self.collected_frames = 0;
        self.in_progress = false;
        self.started_at = None;
    }

    fn begin(&mut self) {
        self.in_progress = true;
        self.started_at = Some(Instant::now());
        self.collected_frames = self.prebuffer.len();
        self.collected = self.prebuffer.drain(..).flatten().collect();
    }

    fn finish(&mut self, forced: bool) -> Option<Utterance> {
        let pcm = std::mem::take(&mut self.collected);
        let frames = self.collected_frames;
        self.collected_frames = 0;
        self.in_progress = false;
        self.started_at = None;
        self.prebuffer.clear();

        if let Some(end) = self.last_playback_end {
            if end.elapsed() < self.config.anti_echo_guard {
                self.log_drop(DropReason::EchoGuard);
                return None;
            }
        }

        if !forced && !self.config.retain_short && frames < self.config.min_frames {
            self.log_drop(DropReason::TooShort);
            return None;
        }

        let window_bytes = self.config.energy_window_frames * FRAME_BYTES;
        let tail = if pcm.len() > window_bytes {
            &pcm[pcm.len() - window_bytes..]
        } else {
            &pcm[..]
        };
        if average_energy(tail) < self.config.energy_threshold {
            self.log_drop(DropReason::TooQuiet);
            return None;
        }

        Some(Utterance { pcm, frames })
    }

    fn log_drop(&self, reason: DropReason) {
        tracing::debug!(?reason, "speech end filtered out");
    }
}
