//! Resource manager
//!
//! Tracks active sessions and their metrics, caps concurrent transcription
//! and synthesis with semaphores sized from the host hardware, holds weak
//! references to connection writers for targeted hangups, and samples
//! system load to drive adaptive audio pacing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sysinfo::System;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use intercom_config::ResourceConfig;
use intercom_core::{CallId, TurnRole};

use crate::ServerError;

/// Sessions × cpu thresholds that switch throttling on
const THROTTLE_MIN_SESSIONS: usize = 3;
const THROTTLE_CPU_PERCENT: f32 = 85.0;

/// How often the load sampler re-evaluates the throttle flag
const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// Snapshot of system load for status reporting
#[derive(Debug, Clone, serde::Serialize)]
pub struct SystemLoad {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub active_sessions: usize,
}

#[derive(Debug, Default)]
struct SessionMetrics {
    port: Option<u16>,
    transcriptions: u64,
    syntheses: u64,
    transcription_ms: u64,
    synthesis_ms: u64,
    started: Option<Instant>,
}

/// Writer handle kept weak so the leg handler stays the exclusive owner
pub struct ConnectionHandle {
    writer: Weak<tokio::sync::Mutex<OwnedWriteHalf>>,
    pub registered_at: Instant,
}

/// Process-wide resource accounting
pub struct ResourceManager {
    transcription_slots: Arc<Semaphore>,
    synthesis_slots: Arc<Semaphore>,
    max_transcriptions: usize,
    max_synthesis: usize,

    sessions: Mutex<HashMap<CallId, SessionMetrics>>,
    connections: Mutex<HashMap<(CallId, TurnRole), ConnectionHandle>>,

    system: Mutex<System>,
    throttle: AtomicBool,
}

impl ResourceManager {
    /// Size the semaphores from the host hardware, honoring explicit
    /// overrides from configuration.
    pub fn new(config: &ResourceConfig) -> Self {
        let tier = hardware_tier();
        let max_transcriptions = config.max_concurrent_transcriptions.unwrap_or(tier);
        let max_synthesis = config.max_concurrent_synthesis.unwrap_or(tier);

        tracing::info!(
            max_transcriptions,
            max_synthesis,
            "resource manager initialized"
        );

        Self {
            transcription_slots: Arc::new(Semaphore::new(max_transcriptions)),
            synthesis_slots: Arc::new(Semaphore::new(max_synthesis)),
            max_transcriptions,
            max_synthesis,
            sessions: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            system: Mutex::new(System::new()),
            throttle: AtomicBool::new(false),
        }
    }

    pub fn register_session(&self, call_id: CallId, port: Option<u16>) {
        let mut sessions = self.sessions.lock();
        sessions.entry(call_id).or_insert_with(|| SessionMetrics {
            port,
            started: Some(Instant::now()),
            ..Default::default()
        });
        tracing::debug!(%call_id, total = sessions.len(), "session registered");
    }

    pub fn unregister_session(&self, call_id: &CallId) {
        if let Some(metrics) = self.sessions.lock().remove(call_id) {
            let lifetime = metrics
                .started
                .map(|s| s.elapsed().as_secs_f64())
                .unwrap_or_default();
            tracing::info!(
                %call_id,
                lifetime_secs = lifetime,
                transcriptions = metrics.transcriptions,
                syntheses = metrics.syntheses,
                transcription_ms = metrics.transcription_ms,
                synthesis_ms = metrics.synthesis_ms,
                "session finished"
            );
        }
    }

    pub fn record_transcription(&self, call_id: &CallId, took: Duration) {
        if let Some(m) = self.sessions.lock().get_mut(call_id) {
            m.transcriptions += 1;
            m.transcription_ms += took.as_millis() as u64;
        }
    }

    pub fn record_synthesis(&self, call_id: &CallId, took: Duration) {
        if let Some(m) = self.sessions.lock().get_mut(call_id) {
            m.syntheses += 1;
            m.synthesis_ms += took.as_millis() as u64;
        }
    }

    /// Acquire a transcription slot. The permit releases on drop, on every
    /// exit path.
    pub async fn acquire_transcription(&self) -> Result<OwnedSemaphorePermit, ServerError> {
        self.transcription_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ServerError::Internal("transcription semaphore closed".to_string()))
    }

    /// Acquire a synthesis slot. Cache hits never come here.
    pub async fn acquire_synthesis(&self) -> Result<OwnedSemaphorePermit, ServerError> {
        self.synthesis_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ServerError::Internal("synthesis semaphore closed".to_string()))
    }

    pub fn register_connection(
        &self,
        call_id: CallId,
        role: TurnRole,
        writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    ) {
        self.connections.lock().insert(
            (call_id, role),
            ConnectionHandle {
                writer: Arc::downgrade(writer),
                registered_at: Instant::now(),
            },
        );
    }

    pub fn unregister_connection(&self, call_id: &CallId, role: TurnRole) {
        self.connections.lock().remove(&(*call_id, role));
    }

    /// Upgrade the weak writer reference for a targeted operation. Callers
    /// get a strong handle or nothing; a dead leg yields nothing.
    pub fn connection(
        &self,
        call_id: &CallId,
        role: TurnRole,
    ) -> Option<Arc<tokio::sync::Mutex<OwnedWriteHalf>>> {
        self.connections
            .lock()
            .get(&(*call_id, role))
            .and_then(|handle| handle.writer.upgrade())
    }

    /// Roles with a live connection for this call
    pub fn connected_roles(&self, call_id: &CallId) -> Vec<TurnRole> {
        let connections = self.connections.lock();
        [TurnRole::Visitor, TurnRole::Resident]
            .into_iter()
            .filter(|role| {
                connections
                    .get(&(*call_id, *role))
                    .map(|h| h.writer.strong_count() > 0)
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn session_port(&self, call_id: &CallId) -> Option<u16> {
        self.sessions.lock().get(call_id).and_then(|m| m.port)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Current load snapshot; refreshes the sampler state
    pub fn sample_load(&self) -> SystemLoad {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        system.refresh_memory();

        let cpu_percent = system.global_cpu_info().cpu_usage();
        let total = system.total_memory().max(1);
        let memory_percent = (system.used_memory() as f32 / total as f32) * 100.0;

        SystemLoad {
            cpu_percent,
            memory_percent,
            active_sessions: self.active_sessions(),
        }
    }

    /// Cached throttle decision; evaluation is sampled, never per-frame
    pub fn throttle_audio(&self) -> bool {
        self.throttle.load(Ordering::Relaxed)
    }

    /// Background task periodically re-evaluating the throttle rule
    pub fn start_sampler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let load = manager.sample_load();
                let throttled = load.active_sessions > THROTTLE_MIN_SESSIONS
                    && load.cpu_percent > THROTTLE_CPU_PERCENT;
                let was = manager.throttle.swap(throttled, Ordering::Relaxed);
                if was != throttled {
                    tracing::info!(
                        throttled,
                        cpu = load.cpu_percent as f64,
                        sessions = load.active_sessions,
                        "audio throttle changed"
                    );
                }
            }
        })
    }

    pub fn limits(&self) -> (usize, usize) {
        (self.max_transcriptions, self.max_synthesis)
    }
}

/// Concurrency tier from cores and memory:
/// >=4 cores and >=8 GiB -> 3..=6, >=2 cores and >=4 GiB -> 2, else 1.
fn hardware_tier() -> usize {
    let mut system = System::new();
    system.refresh_memory();

    let cores = system.physical_core_count().unwrap_or(2);
    let mem_gib = system.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);

    if cores >= 4 && mem_gib >= 8.0 {
        cores.saturating_sub(1).clamp(3, 6)
    } else if cores >= 2 && mem_gib >= 4.0 {
        2
    } else {
        1
    }
}
