//! Session coordination and storage for motor control.
//!
//! Provides:
//! - `SessionCoordinator` - Enforce one active session per user
//! - Storage implementations (memory)

pub mod coordinator;
pub mod storage;

pub use coordinator::{CoordinatorError, SessionCoordinator};
