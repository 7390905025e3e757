//! Shared link handle serializing every write to the device.

use std::sync::Arc;

use motorlink_core::{DriverError, Frame, ProtocolDriver};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::codec::{CodecError, Decoded, MotorCodec, Request};

/// Link error.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Link closed")]
    Closed,
    #[error("Cancelled")]
    Cancelled,
}

impl LinkError {
    /// Whether this error comes from the driver itself, as opposed to a bad
    /// request, a bad frame, or shutdown.
    #[must_use]
    pub const fn is_driver_fault(&self) -> bool {
        matches!(self, Self::Driver(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Open,
    /// A write was abandoned part-way; the device may hold half a frame.
    Torn,
    Closed,
}

/// One open connection to a motor controller.
///
/// Every frame written, by any poller or command handler, passes through
/// one async gate. The gate is held for exactly one frame write; encoding
/// happens before it is taken. A write still in flight when the caller's
/// token fires is abandoned and leaves the gate refusing writes, as does
/// [`DeviceLink::close`].
pub struct DeviceLink {
    driver: Arc<dyn ProtocolDriver>,
    codec: Arc<dyn MotorCodec>,
    gate: Mutex<Gate>,
}

impl DeviceLink {
    /// Connect `driver` and wrap it.
    ///
    /// # Errors
    /// Returns the driver's error if the device is unreachable.
    pub async fn open(
        driver: Arc<dyn ProtocolDriver>,
        codec: Arc<dyn MotorCodec>,
        address: &str,
        port: u16,
    ) -> Result<Self, LinkError> {
        driver.connect(address, port).await?;
        tracing::info!("Device link open at {address}:{port}");
        Ok(Self {
            driver,
            codec,
            gate: Mutex::new(Gate::Open),
        })
    }

    /// Encode and write one request.
    ///
    /// Both the wait for the gate and the write itself are abandoned when
    /// `cancel` fires.
    ///
    /// # Errors
    /// Returns error if encoding fails, the link is closed, the operation
    /// was cancelled, or the driver fails.
    pub async fn request(&self, request: &Request<'_>, cancel: &CancellationToken) -> Result<(), LinkError> {
        let frame = self.codec.encode(request)?;
        let mut gate = self.acquire(cancel).await?;

        tracing::trace!(kind = request.kind(), "Writing frame");
        let sent = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            sent = self.driver.send(frame) => Some(sent),
        };
        Self::settle(&mut gate, sent, request.kind())
    }

    /// Run link-layer bring-up on `adapter` while holding the write gate.
    ///
    /// # Errors
    /// Returns error if the link is closed, the operation was cancelled, or
    /// the driver fails.
    pub async fn bring_up(&self, adapter: &str, cancel: &CancellationToken) -> Result<(), LinkError> {
        let mut gate = self.acquire(cancel).await?;

        tracing::info!("Starting link bring-up on adapter {adapter}");
        let done = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            done = self.driver.bring_up(adapter) => Some(done),
        };
        Self::settle(&mut gate, done, "bring_up")?;
        tracing::info!("Link bring-up completed");
        Ok(())
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<MutexGuard<'_, Gate>, LinkError> {
        let gate = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(LinkError::Cancelled),
            gate = self.gate.lock() => gate,
        };
        if *gate == Gate::Open {
            Ok(gate)
        } else {
            Err(LinkError::Closed)
        }
    }

    /// `None` means the write was cut off by cancellation.
    fn settle(gate: &mut Gate, outcome: Option<Result<(), DriverError>>, kind: &str) -> Result<(), LinkError> {
        match outcome {
            Some(result) => Ok(result?),
            None => {
                tracing::warn!(kind, "Write abandoned on cancellation, link no longer writable");
                *gate = Gate::Torn;
                Err(LinkError::Cancelled)
            }
        }
    }

    /// Wait for the next frame, or until `cancel` fires.
    ///
    /// # Errors
    /// Returns error if cancelled or the driver fails.
    pub async fn receive(&self, cancel: &CancellationToken) -> Result<Frame, LinkError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(LinkError::Cancelled),
            frame = self.driver.receive() => Ok(frame?),
        }
    }

    /// Decode a received frame.
    ///
    /// # Errors
    /// Returns error if the frame is malformed or reports a rejection.
    pub fn decode(&self, frame: &Frame) -> Result<Decoded, LinkError> {
        Ok(self.codec.decode(frame)?)
    }

    /// Whether the link still accepts writes.
    pub async fn is_open(&self) -> bool {
        *self.gate.lock().await == Gate::Open
    }

    /// Close the link. Later writes fail with [`LinkError::Closed`].
    ///
    /// # Errors
    /// Returns the driver's error if closing fails; the link counts as
    /// closed either way.
    pub async fn close(&self) -> Result<(), LinkError> {
        let mut gate = self.gate.lock().await;
        if *gate == Gate::Closed {
            return Ok(());
        }
        *gate = Gate::Closed;
        self.driver.close().await?;
        tracing::info!("Device link closed");
        Ok(())
    }
}
