//! Per-connection telemetry persistence.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
};

use motorlink_core::{
    PersistenceStore, SessionId, StorageError, TelemetrySample,
    types::{Timestamp, keys, now_millis},
};

/// Logging toggle of one connection.
///
/// Holds the session samples are recorded against, or nothing while
/// logging is off.
#[derive(Debug, Default)]
pub struct LoggingState {
    session: Mutex<Option<SessionId>>,
}

impl LoggingState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start recording against `session`.
    pub fn enable(&self, session: SessionId) {
        *self.lock() = Some(session);
    }

    /// Stop recording. Returns the session that was being recorded, if any.
    pub fn disable(&self) -> Option<SessionId> {
        self.lock().take()
    }

    /// Turn logging off only if it still records `session`.
    fn disable_if(&self, session: SessionId) -> bool {
        let mut current = self.lock();
        if *current == Some(session) {
            *current = None;
            true
        } else {
            false
        }
    }

    /// Session currently recorded against.
    #[must_use]
    pub fn current(&self) -> Option<SessionId> {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<SessionId>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Assembles samples from the telemetry stream of one connection.
///
/// A sample is appended once every sampled key has been refreshed since the
/// previous one. Values seen while logging is off are tracked but never
/// complete a sample.
pub(crate) struct SampleRecorder {
    store: Arc<dyn PersistenceStore>,
    logging: Arc<LoggingState>,
    latest: HashMap<&'static str, i64>,
    fresh: HashSet<&'static str>,
    last_timestamp: Timestamp,
}

impl SampleRecorder {
    pub(crate) fn new(store: Arc<dyn PersistenceStore>, logging: Arc<LoggingState>) -> Self {
        Self {
            store,
            logging,
            latest: HashMap::new(),
            fresh: HashSet::new(),
            last_timestamp: Timestamp::MIN,
        }
    }

    /// Feed one telemetry value.
    pub(crate) async fn observe(&mut self, key: &str, value: i64) {
        let Some(key) = keys::SAMPLED.into_iter().find(|k| *k == key) else {
            return;
        };
        self.latest.insert(key, value);

        let Some(session) = self.logging.current() else {
            self.fresh.clear();
            return;
        };
        self.fresh.insert(key);
        if self.fresh.len() < keys::SAMPLED.len() {
            return;
        }
        self.fresh.clear();

        let sample = self.sample(session);
        match self.store.append_sample(sample).await {
            Ok(()) => {}
            Err(e @ (StorageError::Inactive(_) | StorageError::NotFound(_))) => {
                if self.logging.disable_if(session) {
                    tracing::warn!(%session, "Logging stopped: {e}");
                }
            }
            Err(e) => tracing::warn!(%session, "Sample not recorded: {e}"),
        }
    }

    fn sample(&mut self, session: SessionId) -> TelemetrySample {
        let value = |key: &str| self.latest.get(key).copied().unwrap_or_default();
        let timestamp = now_millis().max(self.last_timestamp.saturating_add(1));
        let sample = TelemetrySample {
            session: Some(session),
            position: value(keys::ACTUAL_POSITION),
            velocity: value(keys::ACTUAL_VELOCITY),
            phase_current: value(keys::PHASE_CURRENT),
            voltage_logic: value(keys::VOLTAGE_LOGIC),
            timestamp,
        };
        self.last_timestamp = timestamp;
        sample
    }
}

#[cfg(test)]
mod tests {
    use motorlink_core::UserId;
    use motorlink_session::storage::MemoryStore;
    use tokio_test::assert_ok;

    use super::*;

    async fn feed(recorder: &mut SampleRecorder, position: i64) {
        recorder.observe(keys::ACTUAL_POSITION, position).await;
        recorder.observe(keys::ACTUAL_VELOCITY, 2).await;
        recorder.observe(keys::PHASE_CURRENT, 3).await;
        recorder.observe(keys::VOLTAGE_LOGIC, 24).await;
    }

    #[tokio::test]
    async fn test_nothing_recorded_while_off() {
        let store = Arc::new(MemoryStore::new());
        let session = assert_ok!(store.activate_session(&UserId::new("ada")).await);
        let mut recorder = SampleRecorder::new(store.clone(), Arc::new(LoggingState::new()));

        feed(&mut recorder, 1).await;

        assert!(assert_ok!(store.samples(session.id).await).is_empty());
        assert!(store.unassigned_samples().is_empty());
    }

    #[tokio::test]
    async fn test_sample_needs_every_key_refreshed() {
        let store = Arc::new(MemoryStore::new());
        let session = assert_ok!(store.activate_session(&UserId::new("ada")).await);
        let logging = Arc::new(LoggingState::new());
        logging.enable(session.id);
        let mut recorder = SampleRecorder::new(store.clone(), logging);

        feed(&mut recorder, 1).await;
        recorder.observe(keys::ACTUAL_POSITION, 5).await;
        recorder.observe("motor_temperature", 40).await;
        feed(&mut recorder, 7).await;

        let samples = assert_ok!(store.samples(session.id).await);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].position, 1);
        assert_eq!(samples[1].position, 7);
        assert_eq!(samples[1].voltage_logic, 24);
        assert!(samples[0].timestamp < samples[1].timestamp);
    }

    #[tokio::test]
    async fn test_ended_session_switches_logging_off() {
        let store = Arc::new(MemoryStore::new());
        let session = assert_ok!(store.activate_session(&UserId::new("ada")).await);
        let logging = Arc::new(LoggingState::new());
        logging.enable(session.id);
        let mut recorder = SampleRecorder::new(store.clone(), Arc::clone(&logging));

        assert_ok!(store.end_session(session.id).await);
        feed(&mut recorder, 1).await;

        assert_eq!(logging.current(), None);
        assert!(assert_ok!(store.samples(session.id).await).is_empty());
    }

    #[test]
    fn test_disable_is_idempotent() {
        let logging = LoggingState::new();
        let id = uuid::Uuid::new_v4();
        logging.enable(id);
        assert_eq!(logging.disable(), Some(id));
        assert_eq!(logging.disable(), None);
        assert_eq!(logging.current(), None);
    }
}
