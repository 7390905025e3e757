//! Persisted domain records.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session identifier.
pub type SessionId = Uuid;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Telemetry keys persisted into [`TelemetrySample`]s.
pub mod keys {
    pub const ACTUAL_POSITION: &str = "actual_position";
    pub const ACTUAL_VELOCITY: &str = "actual_velocity";
    pub const PHASE_CURRENT: &str = "phase_current";
    pub const VOLTAGE_LOGIC: &str = "voltage_logic";

    /// All keys a sample is assembled from.
    pub const SAMPLED: [&str; 4] = [ACTUAL_POSITION, ACTUAL_VELOCITY, PHASE_CURRENT, VOLTAGE_LOGIC];

    /// Names taken by control messages on the observer wire. Telemetry
    /// shares the `type` field with them, so no key may use one.
    pub const RESERVED: [&str; 4] = ["ack", "error", "logging_status", "connection_lost"];

    /// Whether `key` collides with a control message name.
    #[must_use]
    pub fn is_reserved(key: &str) -> bool {
        RESERVED.contains(&key)
    }
}

/// External user identity.
///
/// Authentication happens elsewhere; this crate only relies on identity
/// being stable and comparable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A bounded interval during which one user operates the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    /// Owning user.
    pub user: UserId,
    /// Start timestamp.
    pub start_time: Timestamp,
    /// End timestamp, set when the session is stopped or superseded.
    pub end_time: Option<Timestamp>,
    /// Whether this is the user's active session.
    pub is_active: bool,
}

impl Session {
    /// Create a new active session starting at `start_time`.
    #[must_use]
    pub fn begin(user: UserId, start_time: Timestamp) -> Self {
        Self {
            id: Uuid::new_v4(),
            user,
            start_time,
            end_time: None,
            is_active: true,
        }
    }

    /// Mark the session as ended at `at`. No-op if already inactive.
    pub fn end(&mut self, at: Timestamp) {
        if self.is_active {
            self.is_active = false;
            self.end_time = Some(at);
        }
    }
}

/// One timestamped snapshot of device state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub session: Option<SessionId>,
    pub position: i64,
    pub velocity: i64,
    pub phase_current: i64,
    pub voltage_logic: i64,
    pub timestamp: Timestamp,
}

/// Current wall-clock time in milliseconds.
#[must_use]
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
