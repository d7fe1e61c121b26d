//! Application state
//!
//! Shared state for the management API handlers.

use std::sync::Arc;

use intercom_config::Settings;
use intercom_directory::DirectoryStore;

use crate::extensions::ExtensionManager;
use crate::registry::SessionRegistry;
use crate::resources::ResourceManager;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub registry: Arc<SessionRegistry>,
    pub resources: Arc<ResourceManager>,
    pub directory: Arc<dyn DirectoryStore>,
    pub extensions: ExtensionManager,
}
