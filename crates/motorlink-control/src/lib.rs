//! Coordination of one shared motor link and its observers.
//!
//! Provides:
//! - `TaskSupervisor` - Listener and pollers bound to one device link
//! - `DeviceHub` - One supervisor per device, shared by its observers
//! - `Connection` - Per-observer context: telemetry pump and logging toggle
//! - `CommandDispatcher` - Validate and route observer commands

pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod recorder;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use connection::{Connection, Outbound};
pub use dispatcher::{Command, CommandDispatcher, LoggingStatus, Reply};
pub use error::{ControlError, ErrorKind};
pub use hub::{DeviceHub, DriverFactory};
pub use supervisor::TaskSupervisor;

/// Session coordinator over a type-erased store.
pub type Sessions = motorlink_session::SessionCoordinator<dyn motorlink_core::PersistenceStore>;
