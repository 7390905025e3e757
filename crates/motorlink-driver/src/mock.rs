//! In-process driver double that records every write.

use std::{
    io,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future;
use motorlink_core::{DriverError, Frame, ProtocolDriver};
use tokio::{sync::mpsc, time::Instant};

/// One frame written to a [`RecordingDriver`].
#[derive(Debug, Clone)]
pub struct RecordedWrite {
    /// When the write started.
    pub at: Instant,
    /// Frame contents.
    pub frame: Bytes,
}

impl RecordedWrite {
    /// Frame contents as text, without the trailing newline.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.frame).trim_end().to_string()
    }
}

#[derive(Default)]
struct State {
    connected: bool,
    closed: bool,
    refuse_connections: bool,
    failing_sends: usize,
    stalled: bool,
    writes: Vec<RecordedWrite>,
    writes_after_close: usize,
    overlapping_writes: usize,
    bring_ups: Vec<String>,
}

type Inbound = Result<Frame, String>;

/// Driver double for tests and demos.
///
/// Frames pushed with [`RecordingDriver::push_frame`] are returned by
/// `receive` in order. Every `send` is recorded along with whether it
/// overlapped another `send` in flight or happened after `close`.
pub struct RecordingDriver {
    state: Mutex<State>,
    writing: AtomicBool,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
}

impl Default for RecordingDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingDriver {
    /// Create a new driver double.
    #[must_use]
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(State::default()),
            writing: AtomicBool::new(false),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every later `connect` fail.
    pub fn refuse_connections(&self) {
        self.state().refuse_connections = true;
    }

    /// Make the next `count` sends fail with an I/O error.
    pub fn fail_sends(&self, count: usize) {
        self.state().failing_sends = count;
    }

    /// Make every later `connect`, `send` and `bring_up` hang, like a peer
    /// that stopped responding.
    pub fn stall(&self) {
        self.state().stalled = true;
    }

    /// Queue a frame for `receive`.
    pub fn push_frame(&self, frame: &str) {
        let _ = self.inbound_tx.send(Ok(Frame::from(frame)));
    }

    /// Queue a receive failure.
    pub fn push_error(&self, reason: &str) {
        let _ = self.inbound_tx.send(Err(reason.to_string()));
    }

    /// All successful writes, in order.
    #[must_use]
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state().writes.clone()
    }

    /// Successful writes whose text starts with `prefix`.
    #[must_use]
    pub fn count_writes(&self, prefix: &str) -> usize {
        self.state()
            .writes
            .iter()
            .filter(|w| w.text().starts_with(prefix))
            .count()
    }

    /// Writes attempted after `close`.
    #[must_use]
    pub fn writes_after_close(&self) -> usize {
        self.state().writes_after_close
    }

    /// Writes that started while another write was in flight.
    #[must_use]
    pub fn overlapping_writes(&self) -> usize {
        self.state().overlapping_writes
    }

    /// Adapters bring-up ran on.
    #[must_use]
    pub fn bring_ups(&self) -> Vec<String> {
        self.state().bring_ups.clone()
    }

    /// Whether `close` has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

#[async_trait]
impl ProtocolDriver for RecordingDriver {
    async fn connect(&self, address: &str, port: u16) -> Result<(), DriverError> {
        let stalled = {
            let mut state = self.state();
            if state.refuse_connections {
                return Err(DriverError::Unreachable {
                    address: format!("{address}:{port}"),
                    reason: "connection refused".to_string(),
                });
            }
            if !state.stalled {
                state.connected = true;
                state.closed = false;
            }
            state.stalled
        };
        if stalled {
            return future::pending().await;
        }
        Ok(())
    }

    async fn send(&self, frame: Bytes) -> Result<(), DriverError> {
        let at = Instant::now();
        let stalled = {
            let mut state = self.state();
            if state.closed {
                state.writes_after_close += 1;
                return Err(DriverError::Closed);
            }
            if !state.connected {
                return Err(DriverError::NotConnected);
            }
            if !state.stalled && self.writing.swap(true, Ordering::SeqCst) {
                state.overlapping_writes += 1;
            }
            state.stalled
        };
        if stalled {
            return future::pending().await;
        }

        // A real write may suspend part-way through a frame.
        tokio::task::yield_now().await;

        let mut state = self.state();
        self.writing.store(false, Ordering::SeqCst);
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(DriverError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated send failure",
            )));
        }
        state.writes.push(RecordedWrite { at, frame });
        Ok(())
    }

    async fn receive(&self) -> Result<Frame, DriverError> {
        let mut inbound = self.inbound_rx.lock().await;
        match inbound.recv().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(reason)) => Err(DriverError::Io(io::Error::other(reason))),
            None => Err(DriverError::Closed),
        }
    }

    async fn close(&self) -> Result<(), DriverError> {
        let mut state = self.state();
        state.closed = true;
        state.connected = false;
        Ok(())
    }

    async fn bring_up(&self, adapter: &str) -> Result<(), DriverError> {
        let stalled = {
            let mut state = self.state();
            if !state.connected {
                return Err(DriverError::NotConnected);
            }
            if !state.stalled {
                state.bring_ups.push(adapter.to_string());
            }
            state.stalled
        };
        if stalled {
            return future::pending().await;
        }
        Ok(())
    }
}
