//! Routing of observer commands.

use std::sync::Arc;

use motorlink_core::SessionId;
use motorlink_driver::Request;

use crate::{
    Sessions,
    connection::Connection,
    error::{ControlError, ErrorKind},
};

/// A command sent by one observer.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Forward a named controller command verbatim.
    Named { name: String },
    SetVelocity { velocity: f64 },
    SetCurrent { current: f64 },
    /// Link-layer bring-up on the configured adapter.
    Boot,
    /// Record telemetry against the caller's active session.
    StartLogging { session_id: Option<SessionId> },
    StopLogging,
}

impl Command {
    /// Wire name of the command.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Named { .. } => "command",
            Self::SetVelocity { .. } => "set_velocity",
            Self::SetCurrent { .. } => "set_current",
            Self::Boot => "boot",
            Self::StartLogging { .. } => "start_logging",
            Self::StopLogging => "stop_logging",
        }
    }
}

/// Outcome of `start_logging`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoggingStatus {
    Started { session_id: SessionId },
    Failed { reason: String },
}

/// Reply to the observer that sent a command. Never broadcast.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ack { command: &'static str },
    LoggingStatus(LoggingStatus),
    Error { kind: ErrorKind, message: String },
}

impl From<ControlError> for Reply {
    fn from(err: ControlError) -> Self {
        Self::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Validates commands and routes them to the device link or the
/// connection's logging toggle.
pub struct CommandDispatcher {
    sessions: Arc<Sessions>,
}

impl CommandDispatcher {
    #[must_use]
    pub const fn new(sessions: Arc<Sessions>) -> Self {
        Self { sessions }
    }

    /// Handle one command from `connection`.
    pub async fn dispatch(&self, connection: &Connection, command: Command) -> Reply {
        let kind = command.kind();
        let result = match command {
            Command::Named { name } => {
                let name = name.trim();
                if name.is_empty() {
                    Err(ControlError::Validation("command name is empty".to_string()))
                } else {
                    connection.supervisor().send(&Request::Named(name)).await
                }
            }
            Command::SetVelocity { velocity } => match finite("velocity", velocity) {
                Ok(v) => connection.supervisor().send(&Request::SetVelocity(v)).await,
                Err(e) => Err(e),
            },
            Command::SetCurrent { current } => match finite("current", current) {
                Ok(c) => connection.supervisor().send(&Request::SetCurrent(c)).await,
                Err(e) => Err(e),
            },
            Command::Boot => connection.supervisor().bring_up().await,
            Command::StartLogging { session_id } => {
                return self.start_logging(connection, session_id).await;
            }
            Command::StopLogging => {
                if let Some(session) = connection.logging().disable() {
                    tracing::info!(connection = %connection.id(), %session, "Logging stopped");
                }
                Ok(())
            }
        };

        match result {
            Ok(()) => Reply::Ack { command: kind },
            Err(ControlError::Cancelled) => {
                tracing::debug!(command = kind, "Command abandoned during shutdown");
                Reply::from(ControlError::Cancelled)
            }
            Err(e) => {
                tracing::warn!(connection = %connection.id(), command = kind, "Command failed: {e}");
                Reply::from(e)
            }
        }
    }

    async fn start_logging(&self, connection: &Connection, requested: Option<SessionId>) -> Reply {
        let active = match self.sessions.get_active_session(connection.user()).await {
            Ok(active) => active,
            Err(e) => return Reply::from(ControlError::from(e)),
        };

        let status = match (active, requested) {
            (None, _) => LoggingStatus::Failed {
                reason: "No active session".to_string(),
            },
            (Some(active), Some(requested)) if active.id != requested => LoggingStatus::Failed {
                reason: "Session is not active".to_string(),
            },
            (Some(active), _) => {
                connection.logging().enable(active.id);
                tracing::info!(connection = %connection.id(), session = %active.id, "Logging started");
                LoggingStatus::Started {
                    session_id: active.id,
                }
            }
        };
        Reply::LoggingStatus(status)
    }
}

fn finite(what: &str, value: f64) -> Result<f64, ControlError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ControlError::Validation(format!("{what} must be a finite number")))
    }
}
