//! Main settings module

use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Main application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Management API server
    #[serde(default)]
    pub server: ServerConfig,

    /// Greeting played to the visitor on connect
    #[serde(default)]
    pub greeting: GreetingConfig,

    /// Session timing and voice-detection selection
    #[serde(default)]
    pub system: SystemConfig,

    /// Outbound audio pacing and echo suppression
    #[serde(default)]
    pub audio: AudioConfig,

    /// Farewell messages and resident decision tokens
    #[serde(default)]
    pub call_termination: CallTerminationConfig,

    /// Outbound-call retry policy
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Extension directory source and snapshot fallback
    #[serde(default)]
    pub directory: DirectoryConfig,

    /// Click-to-call bus gateway
    #[serde(default)]
    pub bus: BusConfig,

    /// Speech gateway (transcription + synthesis)
    #[serde(default)]
    pub speech: SpeechConfig,

    /// Intent extraction gateway
    #[serde(default)]
    pub llm: LlmConfig,

    /// Concurrency cap overrides
    #[serde(default)]
    pub resources: ResourceConfig,

    /// Synthesized phrase cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orchestrator.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "orchestrator.max_attempts".to_string(),
                message: "at least one outbound attempt is required".to_string(),
            });
        }

        if self.audio.transmission_delay_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "audio.transmission_delay_ms".to_string(),
                message: "frame pacing cannot be zero".to_string(),
            });
        }

        if self.call_termination.affirmative_tokens.is_empty()
            || self.call_termination.negative_tokens.is_empty()
        {
            return Err(ConfigError::InvalidValue {
                field: "call_termination".to_string(),
                message: "affirmative and negative token lists must be non-empty".to_string(),
            });
        }

        Ok(())
    }
}

/// Management API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host for the management API
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port for the management API
    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_api_port() -> u16 {
    8082
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_api_port(),
        }
    }
}

/// Greeting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreetingConfig {
    #[serde(default = "default_greeting_message")]
    pub message: String,

    /// Synthesis voice, also the default for every other message
    #[serde(default = "default_voice")]
    pub voice: String,

    /// Delay between the opening ID frame and the greeting
    #[serde(default = "default_greeting_delay")]
    pub delay_seconds: f64,
}

fn default_greeting_message() -> String {
    "Hello, welcome! How can I help you?".to_string()
}
fn default_voice() -> String {
    "pt-BR-ThalitaNeural".to_string()
}
fn default_greeting_delay() -> f64 {
    0.5
}

impl GreetingConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay_seconds)
    }
}

impl Default for GreetingConfig {
    fn default() -> Self {
        Self {
            message: default_greeting_message(),
            voice: default_voice(),
            delay_seconds: default_greeting_delay(),
        }
    }
}

/// Which voice-activity detector drives utterance boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VadKind {
    /// Per-frame energy classification with a silence tail
    #[default]
    #[serde(rename = "basic-vad")]
    BasicVad,
    /// End-of-segment driven detector (reports SpeechEnd only)
    #[serde(rename = "streaming-recognizer")]
    StreamingRecognizer,
}

/// Session timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Visitor-leg silence budget
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold_seconds: f64,

    /// Resident-leg silence budget
    #[serde(default = "default_resident_max_silence")]
    pub resident_max_silence_seconds: f64,

    /// Absolute per-leg cap
    #[serde(default = "default_max_transaction_time")]
    pub max_transaction_time_seconds: f64,

    /// Grace between the farewell finishing and the HANGUP frame
    #[serde(default = "default_goodbye_delay")]
    pub goodbye_delay_seconds: f64,

    /// Forced removal delay after the last HANGUP send
    #[serde(default = "default_cleanup_grace")]
    pub cleanup_grace_seconds: f64,

    #[serde(default)]
    pub voice_detection_type: VadKind,

    /// End-of-segment timeout for the streaming-recognizer detector
    #[serde(default = "default_segment_timeout_ms")]
    pub azure_speech_segment_timeout_ms: u64,

    /// Shorter end-of-segment timeout applied on the resident leg
    #[serde(default = "default_resident_segment_timeout_ms")]
    pub resident_segment_timeout_ms: u64,
}

fn default_silence_threshold() -> f64 {
    1.5
}
fn default_resident_max_silence() -> f64 {
    45.0
}
fn default_max_transaction_time() -> f64 {
    60.0
}
fn default_goodbye_delay() -> f64 {
    0.5
}
fn default_cleanup_grace() -> f64 {
    1.0
}
fn default_segment_timeout_ms() -> u64 {
    1_200
}
fn default_resident_segment_timeout_ms() -> u64 {
    700
}

impl SystemConfig {
    pub fn silence_threshold(&self) -> Duration {
        Duration::from_secs_f64(self.silence_threshold_seconds)
    }
    pub fn resident_max_silence(&self) -> Duration {
        Duration::from_secs_f64(self.resident_max_silence_seconds)
    }
    pub fn max_transaction_time(&self) -> Duration {
        Duration::from_secs_f64(self.max_transaction_time_seconds)
    }
    pub fn goodbye_delay(&self) -> Duration {
        Duration::from_secs_f64(self.goodbye_delay_seconds)
    }
    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_secs_f64(self.cleanup_grace_seconds)
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            silence_threshold_seconds: default_silence_threshold(),
            resident_max_silence_seconds: default_resident_max_silence(),
            max_transaction_time_seconds: default_max_transaction_time(),
            goodbye_delay_seconds: default_goodbye_delay(),
            cleanup_grace_seconds: default_cleanup_grace(),
            voice_detection_type: VadKind::default(),
            azure_speech_segment_timeout_ms: default_segment_timeout_ms(),
            resident_segment_timeout_ms: default_resident_segment_timeout_ms(),
        }
    }
}

/// Outbound audio pacing and utterance filtering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Pause between outbound SLIN frames
    #[serde(default = "default_transmission_delay_ms")]
    pub transmission_delay_ms: u64,

    /// Pause after the last frame of an outbound message
    #[serde(default = "default_post_audio_delay")]
    pub post_audio_delay_seconds: f64,

    /// Incoming frames discarded after outbound audio to kill echo
    #[serde(default = "default_discard_buffer_frames")]
    pub discard_buffer_frames: usize,

    /// SpeechEnd events this close to outbound-audio completion are dropped
    #[serde(default = "default_anti_echo_guard")]
    pub anti_echo_guard_seconds: f64,

    /// Minimum utterance length (waived on the resident leg)
    #[serde(default = "default_min_utterance_frames")]
    pub min_utterance_frames: usize,

    /// Average-amplitude floor for transcription admission
    #[serde(default = "default_energy_threshold")]
    pub energy_threshold: f64,

    /// Average-amplitude floor for end-of-speech confirmation
    #[serde(default = "default_energy_confirm_threshold")]
    pub energy_confirm_threshold: f64,

    /// Rolling pre-buffer retained ahead of speech onset
    #[serde(default = "default_prebuffer_seconds")]
    pub prebuffer_seconds: f64,

    /// SpeechStart without SpeechEnd for this long forces the utterance closed
    #[serde(default = "default_vad_watchdog")]
    pub vad_watchdog_seconds: f64,
}

fn default_transmission_delay_ms() -> u64 {
    10
}
fn default_post_audio_delay() -> f64 {
    0.3
}
fn default_discard_buffer_frames() -> usize {
    15
}
fn default_anti_echo_guard() -> f64 {
    1.5
}
fn default_min_utterance_frames() -> usize {
    15
}
fn default_energy_threshold() -> f64 {
    600.0
}
fn default_energy_confirm_threshold() -> f64 {
    800.0
}
fn default_prebuffer_seconds() -> f64 {
    2.0
}
fn default_vad_watchdog() -> f64 {
    10.0
}

impl AudioConfig {
    pub fn transmission_delay(&self) -> Duration {
        Duration::from_millis(self.transmission_delay_ms)
    }
    pub fn post_audio_delay(&self) -> Duration {
        Duration::from_secs_f64(self.post_audio_delay_seconds)
    }
    pub fn anti_echo_guard(&self) -> Duration {
        Duration::from_secs_f64(self.anti_echo_guard_seconds)
    }
    pub fn vad_watchdog(&self) -> Duration {
        Duration::from_secs_f64(self.vad_watchdog_seconds)
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            transmission_delay_ms: default_transmission_delay_ms(),
            post_audio_delay_seconds: default_post_audio_delay(),
            discard_buffer_frames: default_discard_buffer_frames(),
            anti_echo_guard_seconds: default_anti_echo_guard(),
            min_utterance_frames: default_min_utterance_frames(),
            energy_threshold: default_energy_threshold(),
            energy_confirm_threshold: default_energy_confirm_threshold(),
            prebuffer_seconds: default_prebuffer_seconds(),
            vad_watchdog_seconds: default_vad_watchdog(),
        }
    }
}

/// Farewell text for one leg, keyed by the authorization outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoodbyeSet {
    pub authorized: String,
    pub denied: String,
    pub default: String,
}

/// Farewell messages for both legs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoodbyeMessages {
    #[serde(default = "default_visitor_goodbyes")]
    pub visitor: GoodbyeSet,
    #[serde(default = "default_resident_goodbyes")]
    pub resident: GoodbyeSet,
}

fn default_visitor_goodbyes() -> GoodbyeSet {
    GoodbyeSet {
        authorized: "The resident authorized your entry. Welcome!".to_string(),
        denied: "The resident denied your entry. Goodbye.".to_string(),
        default: "Thank you for your visit. Goodbye.".to_string(),
    }
}

fn default_resident_goodbyes() -> GoodbyeSet {
    GoodbyeSet {
        authorized: "Entry authorized. Thank you.".to_string(),
        denied: "Entry denied. Thank you.".to_string(),
        default: "Thank you. Goodbye.".to_string(),
    }
}

impl Default for GoodbyeMessages {
    fn default() -> Self {
        Self {
            visitor: default_visitor_goodbyes(),
            resident: default_resident_goodbyes(),
        }
    }
}

/// Farewell messages and resident decision tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallTerminationConfig {
    #[serde(default)]
    pub goodbye_messages: GoodbyeMessages,

    /// Tokens that count as an authorization. The source docs disagree on
    /// the exact list, so it lives in configuration.
    #[serde(default = "default_affirmative_tokens")]
    pub affirmative_tokens: Vec<String>,

    /// Tokens that count as a denial
    #[serde(default = "default_negative_tokens")]
    pub negative_tokens: Vec<String>,
}

fn default_affirmative_tokens() -> Vec<String> {
    ["sim", "pode", "autorizo", "autorizado", "yes", "sure", "ok"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_negative_tokens() -> Vec<String> {
    ["não", "nao", "nego", "negado", "no", "don't"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

impl Default for CallTerminationConfig {
    fn default() -> Self {
        Self {
            goodbye_messages: GoodbyeMessages::default(),
            affirmative_tokens: default_affirmative_tokens(),
            negative_tokens: default_negative_tokens(),
        }
    }
}

/// Outbound-call retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Per-attempt wait for the resident leg to connect
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_seconds: f64,
}

fn default_max_attempts() -> u32 {
    2
}
fn default_attempt_timeout() -> f64 {
    10.0
}

impl OrchestratorConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.attempt_timeout_seconds)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            attempt_timeout_seconds: default_attempt_timeout(),
        }
    }
}

/// Extension directory source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Postgres URL; when absent the snapshot file is the only source
    #[serde(default)]
    pub database_url: Option<String>,

    /// LISTEN/NOTIFY channel carrying extension changes
    #[serde(default = "default_directory_channel")]
    pub channel: String,

    /// Local snapshot mirrored on every successful load
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,

    /// Compatibility pair bound when no source is available
    #[serde(default = "default_bind_ip")]
    pub default_bind_ip: String,
    #[serde(default = "default_ia_port")]
    pub default_ia_port: u16,
    #[serde(default = "default_return_port")]
    pub default_return_port: u16,
}

fn default_directory_channel() -> String {
    "change_record_extension_ia".to_string()
}
fn default_snapshot_path() -> String {
    "data/ramais_config.json".to_string()
}
fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_ia_port() -> u16 {
    8080
}
fn default_return_port() -> u16 {
    8081
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            channel: default_directory_channel(),
            snapshot_path: default_snapshot_path(),
            default_bind_ip: default_bind_ip(),
            default_ia_port: default_ia_port(),
            default_return_port: default_return_port(),
        }
    }
}

/// Click-to-call bus gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Gateway endpoint receiving the click-to-call payload. Required at
    /// runtime: the bus is a hard dependency and there is no fallback.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_routing_key")]
    pub routing_key: String,

    #[serde(default)]
    pub exchange: String,

    /// Opaque license token forwarded in the payload
    #[serde(default)]
    pub license: String,
}

fn default_routing_key() -> String {
    "voip1-in".to_string()
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            routing_key: default_routing_key(),
            exchange: String::new(),
            license: String::new(),
        }
    }
}

/// Speech gateway endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    /// Base URL of the transcription/synthesis gateway
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Request timeout for both directions
    #[serde(default = "default_speech_timeout")]
    pub request_timeout_seconds: f64,

    #[serde(default = "default_language")]
    pub language: String,
}

fn default_speech_timeout() -> f64 {
    15.0
}
fn default_language() -> String {
    "pt-BR".to_string()
}

impl SpeechConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_seconds)
    }
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            request_timeout_seconds: default_speech_timeout(),
            language: default_language(),
        }
    }
}

/// Intent extraction gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of the extraction gateway
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Model hint forwarded to the gateway
    #[serde(default)]
    pub model: Option<String>,
}

/// Concurrency cap overrides. When unset the caps are sized from the host
/// hardware at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default)]
    pub max_concurrent_transcriptions: Option<usize>,
    #[serde(default)]
    pub max_concurrent_synthesis: Option<usize>,
}

/// Synthesized phrase cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: String,

    /// Phrases synthesized at startup
    #[serde(default)]
    pub prewarm: Vec<String>,
}

fn default_cache_dir() -> String {
    "audio/cache".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            prewarm: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

/// Load settings from files and environment
///
/// Priority (highest to lowest):
/// 1. Environment variables (`INTERCOM` prefix, `__` separator)
/// 2. config/{env}.yaml (if env specified)
/// 3. config/default.yaml
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name("config/default").required(false));

    if let Some(env_name) = env {
        builder =
            builder.add_source(File::with_name(&format!("config/{}", env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("INTERCOM")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}
