//! Core abstractions for motor control sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `Session` / `TelemetrySample` - Persisted domain records
//! - `PersistenceStore` and `ProtocolDriver` - Collaborator traits
//! - `TelemetryBroadcaster` - Latest-value snapshot + bounded live fan-out
//! - `LinkConfig` - Device link and polling configuration

pub mod config;
pub mod telemetry;
pub mod traits;
pub mod types;

pub use config::{ConfigError, LinkConfig};
pub use telemetry::{TelemetryBroadcaster, TelemetryEvent, TelemetrySubscription};
pub use traits::{DriverError, Frame, PersistenceStore, ProtocolDriver, StorageError};
pub use types::{Session, SessionId, TelemetrySample, UserId};
