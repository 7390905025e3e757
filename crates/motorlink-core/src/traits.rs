//! Collaborator traits for persistence and the device link.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::types::{Session, SessionId, TelemetrySample, UserId};

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Session is not active: {0}")]
    Inactive(SessionId),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for session and telemetry storage backends.
///
/// Implementations must keep the "at most one active session per user"
/// invariant inside [`PersistenceStore::activate_session`]: deactivating the
/// previous session and creating the new one is a single atomic step.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Atomically end any active session of `user` and create a new active one.
    async fn activate_session(&self, user: &UserId) -> Result<Session, StorageError>;

    /// End a session. Ending an inactive session returns it unchanged.
    async fn end_session(&self, id: SessionId) -> Result<Session, StorageError>;

    /// Get a session by ID.
    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, StorageError>;

    /// Get the active session of a user, if any.
    async fn active_session(&self, user: &UserId) -> Result<Option<Session>, StorageError>;

    /// List all sessions of a user, newest first.
    async fn sessions_for_user(&self, user: &UserId) -> Result<Vec<Session>, StorageError>;

    /// Append a sample to its session.
    ///
    /// Fails with [`StorageError::Inactive`] if the session has ended.
    async fn append_sample(&self, sample: TelemetrySample) -> Result<(), StorageError>;

    /// Get all samples of a session ordered by timestamp.
    async fn samples(&self, session: SessionId) -> Result<Vec<TelemetrySample>, StorageError>;
}

/// One frame received from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(pub Bytes);

impl Frame {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Frame {
    fn from(value: &str) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

/// Driver error.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Device unreachable at {address}: {reason}")]
    Unreachable { address: String, reason: String },
    #[error("Link is not connected")]
    NotConnected,
    #[error("Link closed")]
    Closed,
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
    #[error("Bring-up failed: {0}")]
    BringUp(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Trait for the component owning the physical link to the motor controller.
///
/// Methods take `&self`; a driver is shared between the response listener
/// and every writer. Writers are serialized by the caller, so implementations
/// only need to guard against torn state, not interleaving.
#[async_trait]
pub trait ProtocolDriver: Send + Sync {
    /// Open the link.
    async fn connect(&self, address: &str, port: u16) -> Result<(), DriverError>;

    /// Write one encoded frame.
    async fn send(&self, frame: Bytes) -> Result<(), DriverError>;

    /// Wait for the next frame.
    ///
    /// Must be cancel-safe: dropping the future loses no frame.
    async fn receive(&self) -> Result<Frame, DriverError>;

    /// Close the link. Closing twice is not an error.
    async fn close(&self) -> Result<(), DriverError>;

    /// Run the link-layer bring-up sequence on the given network adapter.
    async fn bring_up(&self, adapter: &str) -> Result<(), DriverError>;
}
