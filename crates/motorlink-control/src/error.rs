//! Control error taxonomy.

use motorlink_core::ConfigError;
use motorlink_driver::{CodecError, LinkError};
use motorlink_session::CoordinatorError;
use thiserror::Error;

/// Category of a failure reported to an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Protocol,
    Validation,
    State,
}

impl ErrorKind {
    /// Wire name of the category.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Protocol => "protocol",
            Self::Validation => "validation",
            Self::State => "state",
        }
    }
}

/// Control error.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The device link could not be opened or is gone.
    #[error("Connection error: {0}")]
    Connection(String),
    /// The device sent something unusable or rejected a request.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// A command payload was malformed.
    #[error("Validation error: {0}")]
    Validation(String),
    /// The request is not allowed in the current state.
    #[error("State error: {0}")]
    State(String),
    /// Shutdown is in progress.
    #[error("Cancelled")]
    Cancelled,
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Session(#[from] CoordinatorError),
}

impl ControlError {
    /// Category reported to the observer.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) | Self::Cancelled => ErrorKind::Connection,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Validation(_) | Self::Config(_) => ErrorKind::Validation,
            Self::State(_) | Self::Session(_) => ErrorKind::State,
        }
    }
}

impl From<LinkError> for ControlError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Driver(e) => Self::Connection(e.to_string()),
            LinkError::Codec(CodecError::InvalidRequest(reason)) => Self::Validation(reason),
            LinkError::Codec(e) => Self::Protocol(e.to_string()),
            LinkError::Closed => Self::Connection("device link closed".to_string()),
            LinkError::Cancelled => Self::Cancelled,
        }
    }
}
