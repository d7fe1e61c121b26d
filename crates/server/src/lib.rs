//! Intercom server
//!
//! Binds the AudioSocket listener pairs, runs one leg handler per
//! connection, correlates legs through the session registry, and exposes
//! the management HTTP API.

pub mod capabilities;
pub mod extensions;
pub mod http;
pub mod leg;
pub mod registry;
pub mod resources;
pub mod state;

pub use capabilities::{HttpBusPublisher, HttpIntentExtractor, HttpSpeechGateway, OfflineDirectory};
pub use extensions::ExtensionManager;
pub use http::create_router;
pub use leg::{run_leg, LegDeps};
pub use registry::SessionRegistry;
pub use resources::{ResourceManager, SystemLoad};
pub use state::AppState;

use thiserror::Error;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("transport error: {0}")]
    Transport(#[from] intercom_transport::TransportError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] intercom_pipeline::PipelineError),

    #[error("agent error: {0}")]
    Agent(#[from] intercom_agent::AgentError),

    #[error("directory error: {0}")]
    Directory(#[from] intercom_directory::DirectoryError),

    #[error("config error: {0}")]
    Config(#[from] intercom_config::ConfigError),

    #[error("no free port within {scanned} of {base}")]
    NoFreePort { base: u16, scanned: u16 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
