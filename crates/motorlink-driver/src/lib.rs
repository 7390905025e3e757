//! Motor controller link.
//!
//! Provides:
//! - `MotorCodec` - Request encoding and frame decoding (`LineCodec` built in)
//! - `DeviceLink` - Shared link handle serializing every write
//! - `TcpDriver` - Raw TCP link (feature: tcp)
//! - `RecordingDriver` - In-process driver double (feature: mock)

pub mod codec;
pub mod link;

#[cfg(feature = "tcp")]
pub mod tcp;

#[cfg(feature = "mock")]
pub mod mock;

pub use codec::{CodecError, Decoded, LineCodec, MotorCodec, Request};
pub use link::{DeviceLink, LinkError};

#[cfg(feature = "tcp")]
pub use tcp::TcpDriver;

#[cfg(feature = "mock")]
pub use mock::{RecordedWrite, RecordingDriver};
