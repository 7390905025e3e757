//! Session coordinator enforcing one active session per user.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use motorlink_core::{
    traits::{PersistenceStore, StorageError},
    types::{Session, SessionId, TelemetrySample, UserId},
};

/// Session coordinator error.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Session not found: {0}")]
    NotFound(SessionId),
}

type UserLocks = Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>;

/// Handle on one user's transition lock. Dropping the last handle removes
/// the lock from the map.
struct UserLock<'a> {
    locks: &'a UserLocks,
    user: UserId,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for UserLock<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Handles are only cloned under the map lock, so two means the map
        // and this one.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.user);
        }
    }
}

/// Coordinates session transitions against a shared store.
///
/// Transitions for the same user are serialized by a per-user async lock;
/// the store's atomic activate closes the remaining window between
/// processes sharing one store.
pub struct SessionCoordinator<S>
where
    S: PersistenceStore + ?Sized,
{
    store: Arc<S>,
    user_locks: UserLocks,
}

impl<S> SessionCoordinator<S>
where
    S: PersistenceStore + ?Sized,
{
    /// Create a new coordinator over `store`.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn user_lock(&self, user: &UserId) -> UserLock<'_> {
        let mut locks = self.user_locks.lock().unwrap_or_else(PoisonError::into_inner);
        UserLock {
            locks: &self.user_locks,
            user: user.clone(),
            lock: Arc::clone(locks.entry(user.clone()).or_default()),
        }
    }

    /// Start a new session for `user`, ending the previous active one.
    ///
    /// # Errors
    /// Returns error if the store fails.
    pub async fn start_session(&self, user: &UserId) -> Result<Session, CoordinatorError> {
        let lock = self.user_lock(user);
        let _guard = lock.lock.lock().await;

        let session = self.store.activate_session(user).await?;
        tracing::info!(user = %user, session = %session.id, "Session started");
        Ok(session)
    }

    /// Stop a session.
    ///
    /// Stopping a session that already ended returns it unchanged.
    ///
    /// # Errors
    /// Returns error if the session does not exist or the store fails.
    pub async fn stop_session(&self, id: SessionId) -> Result<Session, CoordinatorError> {
        let session = self
            .store
            .get_session(id)
            .await?
            .ok_or(CoordinatorError::NotFound(id))?;

        if !session.is_active {
            tracing::debug!(session = %id, "Session already inactive");
            return Ok(session);
        }

        let lock = self.user_lock(&session.user);
        let _guard = lock.lock.lock().await;

        let session = self.store.end_session(id).await.map_err(|e| match e {
            StorageError::NotFound(id) => CoordinatorError::NotFound(id),
            other => CoordinatorError::Storage(other),
        })?;
        tracing::info!(user = %session.user, session = %id, "Session stopped");
        Ok(session)
    }

    /// Get the active session of `user`.
    ///
    /// # Errors
    /// Returns error if the store fails.
    pub async fn get_active_session(&self, user: &UserId) -> Result<Option<Session>, CoordinatorError> {
        Ok(self.store.active_session(user).await?)
    }

    /// Get a session by ID.
    ///
    /// # Errors
    /// Returns error if the session does not exist or the store fails.
    pub async fn get_session(&self, id: SessionId) -> Result<Session, CoordinatorError> {
        self.store
            .get_session(id)
            .await?
            .ok_or(CoordinatorError::NotFound(id))
    }

    /// List sessions of `user`, newest first.
    ///
    /// # Errors
    /// Returns error if the store fails.
    pub async fn list_sessions(&self, user: &UserId) -> Result<Vec<Session>, CoordinatorError> {
        Ok(self.store.sessions_for_user(user).await?)
    }

    /// Telemetry recorded during a session.
    ///
    /// # Errors
    /// Returns error if the session does not exist or the store fails.
    pub async fn session_samples(&self, id: SessionId) -> Result<Vec<TelemetrySample>, CoordinatorError> {
        self.store.samples(id).await.map_err(|e| match e {
            StorageError::NotFound(id) => CoordinatorError::NotFound(id),
            other => CoordinatorError::Storage(other),
        })
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use tokio_test::{assert_err, assert_ok};
    use uuid::Uuid;

    use super::*;
    use crate::storage::MemoryStore;

    fn coordinator() -> SessionCoordinator<MemoryStore> {
        SessionCoordinator::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_start_ends_prior_session() {
        let coordinator = coordinator();
        let user = UserId::new("ada");

        let first = assert_ok!(coordinator.start_session(&user).await);
        let second = assert_ok!(coordinator.start_session(&user).await);

        let first = assert_ok!(coordinator.get_session(first.id).await);
        assert!(!first.is_active);
        assert!(first.end_time.is_some());

        let sessions = assert_ok!(coordinator.list_sessions(&user).await);
        let active: Vec<_> = sessions.iter().filter(|s| s.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_leave_one_active() {
        let coordinator = Arc::new(coordinator());
        let user = UserId::new("ada");

        let starts = (0..32).map(|_| {
            let coordinator = Arc::clone(&coordinator);
            let user = user.clone();
            tokio::spawn(async move { coordinator.start_session(&user).await })
        });
        for result in futures::future::join_all(starts).await {
            assert_ok!(assert_ok!(result));
        }

        let sessions = assert_ok!(coordinator.list_sessions(&user).await);
        assert_eq!(sessions.len(), 32);
        assert_eq!(sessions.iter().filter(|s| s.is_active).count(), 1);
        assert!(coordinator.user_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_locks_do_not_accumulate() {
        let coordinator = coordinator();
        for name in ["ada", "bob", "cy"] {
            let session = assert_ok!(coordinator.start_session(&UserId::new(name)).await);
            assert_ok!(coordinator.stop_session(session.id).await);
        }
        assert!(coordinator.user_locks.lock().unwrap().is_empty());

        let lock = coordinator.user_lock(&UserId::new("ada"));
        let _held = lock.lock.lock().await;
        let waiting = coordinator.user_lock(&UserId::new("ada"));
        drop(waiting);
        assert_eq!(coordinator.user_locks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let coordinator = coordinator();
        let user = UserId::new("ada");
        let session = assert_ok!(coordinator.start_session(&user).await);

        let stopped = assert_ok!(coordinator.stop_session(session.id).await);
        assert!(!stopped.is_active);

        let again = assert_ok!(coordinator.stop_session(session.id).await);
        assert_eq!(again, stopped);
        assert_eq!(assert_ok!(coordinator.get_active_session(&user).await), None);
    }

    #[tokio::test]
    async fn test_stop_unknown_session() {
        let coordinator = coordinator();
        let id = Uuid::new_v4();
        let err = assert_err!(coordinator.stop_session(id).await);
        assert!(matches!(err, CoordinatorError::NotFound(missing) if missing == id));
    }

    #[tokio::test]
    async fn test_session_samples_reads_store() {
        let coordinator = coordinator();
        let session = assert_ok!(coordinator.start_session(&UserId::new("ada")).await);
        assert_ok!(
            coordinator
                .store()
                .append_sample(TelemetrySample {
                    session: Some(session.id),
                    position: 10,
                    velocity: 20,
                    phase_current: 30,
                    voltage_logic: 40,
                    timestamp: 1,
                })
                .await
        );

        let samples = assert_ok!(coordinator.session_samples(session.id).await);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].velocity, 20);

        let err = assert_err!(coordinator.session_samples(Uuid::new_v4()).await);
        assert!(matches!(err, CoordinatorError::NotFound(_)));
    }
}
