//! Transport layer for motor observers.
//!
//! Provides:
//! - Wire protocol (JSON, `type`-tagged)
//! - WebSocket transport (feature: server)
//! - HTTP session routes (feature: server)

pub mod protocol;

#[cfg(feature = "server")]
pub mod http;
#[cfg(feature = "server")]
pub mod state;
#[cfg(feature = "server")]
pub mod websocket;

pub use protocol::{ClientMessage, Inbound, ServerMessage, parse_client_message};

#[cfg(feature = "server")]
pub use http::router;
#[cfg(feature = "server")]
pub use state::AppState;
