//! In-memory session and telemetry storage.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use async_trait::async_trait;
use motorlink_core::{
    traits::{PersistenceStore, StorageError},
    types::{Session, SessionId, TelemetrySample, UserId, now_millis},
};

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Session>,
    samples: HashMap<SessionId, Vec<TelemetrySample>>,
    unassigned: Vec<TelemetrySample>,
}

/// In-memory storage implementation.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples stored without a session.
    #[must_use]
    pub fn unassigned_samples(&self) -> Vec<TelemetrySample> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .unassigned
            .clone()
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn activate_session(&self, user: &UserId) -> Result<Session, StorageError> {
        let now = now_millis();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        for session in inner
            .sessions
            .values_mut()
            .filter(|s| s.is_active && &s.user == user)
        {
            session.end(now);
        }

        let session = Session::begin(user.clone(), now);
        inner.sessions.insert(session.id, session.clone());
        inner.samples.insert(session.id, Vec::new());

        Ok(session)
    }

    async fn end_session(&self, id: SessionId) -> Result<Session, StorageError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let session = inner.sessions.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        session.end(now_millis());
        Ok(session.clone())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, StorageError> {
        Ok(self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions
            .get(&id)
            .cloned())
    }

    async fn active_session(&self, user: &UserId) -> Result<Option<Session>, StorageError> {
        Ok(self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions
            .values()
            .find(|s| s.is_active && &s.user == user)
            .cloned())
    }

    async fn sessions_for_user(&self, user: &UserId) -> Result<Vec<Session>, StorageError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut result: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| &s.user == user)
            .cloned()
            .collect();

        // Newest first
        result.sort_by(|a, b| b.start_time.cmp(&a.start_time));

        Ok(result)
    }

    async fn append_sample(&self, sample: TelemetrySample) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let Some(id) = sample.session else {
            inner.unassigned.push(sample);
            return Ok(());
        };

        match inner.sessions.get(&id) {
            None => return Err(StorageError::NotFound(id)),
            Some(session) if !session.is_active => return Err(StorageError::Inactive(id)),
            Some(_) => {}
        }

        let samples = inner.samples.entry(id).or_default();
        let at = samples.partition_point(|s| s.timestamp <= sample.timestamp);
        samples.insert(at, sample);

        Ok(())
    }

    async fn samples(&self, session: SessionId) -> Result<Vec<TelemetrySample>, StorageError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        if !inner.sessions.contains_key(&session) {
            return Err(StorageError::NotFound(session));
        }
        Ok(inner.samples.get(&session).cloned().unwrap_or_default())
    }
}
