//! JSON wire protocol between observers and the server.

use motorlink_control::{Command, LoggingStatus, Outbound, Reply};
use motorlink_core::SessionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message from an observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Named controller command, forwarded verbatim.
    Command { command: String },
    SetVelocity { velocity: f64 },
    SetCurrent { current: f64 },
    /// Link-layer bring-up.
    Boot,
    StartLogging {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    StopLogging,
}

impl ClientMessage {
    /// Every `type` tag this protocol understands.
    pub const KINDS: [&'static str; 6] = [
        "command",
        "set_velocity",
        "set_current",
        "boot",
        "start_logging",
        "stop_logging",
    ];
}

impl From<ClientMessage> for Command {
    fn from(message: ClientMessage) -> Self {
        match message {
            ClientMessage::Command { command } => Self::Named { name: command },
            ClientMessage::SetVelocity { velocity } => Self::SetVelocity { velocity },
            ClientMessage::SetCurrent { current } => Self::SetCurrent { current },
            ClientMessage::Boot => Self::Boot,
            ClientMessage::StartLogging { session_id } => Self::StartLogging { session_id },
            ClientMessage::StopLogging => Self::StopLogging,
        }
    }
}

/// Result of parsing one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(ClientMessage),
    /// A well-formed message of a kind this protocol does not know.
    Unknown(String),
    /// Not JSON, no `type`, or a known kind with a malformed payload.
    Invalid(String),
}

/// Parse one inbound text frame.
#[must_use]
pub fn parse_client_message(text: &str) -> Inbound {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return Inbound::Invalid(format!("Message is not valid JSON: {e}")),
    };
    let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_string) else {
        return Inbound::Invalid("Message has no string `type` field".to_string());
    };
    if !ClientMessage::KINDS.contains(&kind.as_str()) {
        return Inbound::Unknown(kind);
    }
    match serde_json::from_value(value) {
        Ok(message) => Inbound::Message(message),
        Err(e) => Inbound::Invalid(format!("Invalid `{kind}` message: {e}")),
    }
}

/// Broadcast telemetry value, serialized as `{"type": <key>, "value": <v>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryMessage {
    #[serde(rename = "type")]
    pub key: String,
    pub value: i64,
}

/// `status` field of a logging status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Started,
    Failed,
}

/// Replies and link-level notices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Ack {
        command: &'static str,
    },
    Error {
        kind: &'static str,
        message: String,
    },
    LoggingStatus {
        status: Status,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    ConnectionLost {
        reason: String,
    },
}

/// Message from the server to an observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Telemetry(TelemetryMessage),
    Control(ControlMessage),
}

impl ServerMessage {
    /// Error reply outside of any command, e.g. a rejected connection.
    #[must_use]
    pub fn error(kind: &'static str, message: impl Into<String>) -> Self {
        Self::Control(ControlMessage::Error {
            kind,
            message: message.into(),
        })
    }
}

impl From<Reply> for ControlMessage {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::Ack { command } => Self::Ack { command },
            Reply::Error { kind, message } => Self::Error {
                kind: kind.as_str(),
                message,
            },
            Reply::LoggingStatus(LoggingStatus::Started { session_id }) => Self::LoggingStatus {
                status: Status::Started,
                reason: None,
                session_id: Some(session_id),
            },
            Reply::LoggingStatus(LoggingStatus::Failed { reason }) => Self::LoggingStatus {
                status: Status::Failed,
                reason: Some(reason),
                session_id: None,
            },
        }
    }
}

impl From<Outbound> for ServerMessage {
    fn from(outbound: Outbound) -> Self {
        match outbound {
            Outbound::Telemetry { key, value } => Self::Telemetry(TelemetryMessage { key, value }),
            Outbound::Reply(reply) => Self::Control(reply.into()),
            Outbound::ConnectionLost { reason } => Self::Control(ControlMessage::ConnectionLost { reason }),
        }
    }
}
