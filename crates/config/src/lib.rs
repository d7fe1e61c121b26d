//! Configuration for the intercom agent
//!
//! Layered loading: `config/default.yaml`, then `config/{env}.yaml`, then
//! environment variables with the `INTERCOM` prefix and `__` separator.

pub mod settings;

pub use settings::{
    load_settings, AudioConfig, BusConfig, CacheConfig, CallTerminationConfig, DirectoryConfig,
    GoodbyeMessages, GoodbyeSet, GreetingConfig, LlmConfig, ObservabilityConfig,
    OrchestratorConfig, ResourceConfig, ServerConfig, Settings, SpeechConfig, SystemConfig,
    VadKind,
};

use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config load error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
