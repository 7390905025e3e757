//! State shared by every handler.

use std::sync::Arc;

use motorlink_control::{CommandDispatcher, DeviceHub, Sessions};
use motorlink_core::{LinkConfig, PersistenceStore};

/// Application state.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<DeviceHub>,
    pub sessions: Arc<Sessions>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub config: Arc<LinkConfig>,
}

impl AppState {
    #[must_use]
    pub fn new(hub: Arc<DeviceHub>, store: Arc<dyn PersistenceStore>, config: LinkConfig) -> Self {
        let sessions = Arc::new(Sessions::new(store));
        Self {
            hub,
            dispatcher: Arc::new(CommandDispatcher::new(Arc::clone(&sessions))),
            sessions,
            config: Arc::new(config),
        }
    }

    /// Store behind the session coordinator.
    #[must_use]
    pub fn store(&self) -> Arc<dyn PersistenceStore> {
        Arc::clone(self.sessions.store())
    }
}
