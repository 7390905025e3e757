//! Shared fixtures for the in-crate tests.

use std::sync::Arc;

use motorlink_core::{LinkConfig, PersistenceStore, ProtocolDriver, UserId};
use motorlink_driver::{LineCodec, RecordingDriver};
use motorlink_session::storage::MemoryStore;
use tokio::sync::mpsc;

use crate::{Connection, DeviceHub, Outbound, Sessions};

pub struct Fixture {
    pub driver: Arc<RecordingDriver>,
    pub hub: DeviceHub,
    pub config: LinkConfig,
    pub sessions: Arc<Sessions>,
}

impl Fixture {
    pub fn new() -> Self {
        let driver = Arc::new(RecordingDriver::new());
        let shared = Arc::clone(&driver);
        let factory = move || Arc::clone(&shared) as Arc<dyn ProtocolDriver>;
        let store: Arc<dyn PersistenceStore> = Arc::new(MemoryStore::new());

        Self {
            driver,
            hub: DeviceHub::new(Arc::new(factory), Arc::new(LineCodec)),
            config: LinkConfig {
                address: "127.0.0.1".to_string(),
                error_threshold: 3,
                ..LinkConfig::default()
            },
            sessions: Arc::new(Sessions::new(store)),
        }
    }

    pub fn store(&self) -> Arc<dyn PersistenceStore> {
        Arc::clone(self.sessions.store())
    }

    pub async fn connect(&self, user: &str) -> (Connection, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.config.outbound_capacity);
        let connection = Connection::accept(&self.hub, &self.config, UserId::new(user), self.store(), tx)
            .await
            .unwrap();
        (connection, rx)
    }
}
