//! Supervisor of the loops bound to one device link.
//!
//! ```text
//! start():
//!   DeviceLink::open()  ── fails ──► ControlError::Connection (nothing spawned)
//!        │
//!        ├─► listener      receive ─► decode ─► TelemetryBroadcaster::publish
//!        ├─► low poller    every P1: GET <low-priority params>
//!        ├─► high poller   every P2: GET <high-priority params>
//!        └─► INIT
//!
//! shutdown():
//!   token.cancel() ─► join listener, low poller, high poller ─► DeviceLink::close()
//!
//! escalation:
//!   error_threshold consecutive driver errors ─► connection_lost broadcast ─► token.cancel()
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use motorlink_core::{LinkConfig, ProtocolDriver, TelemetryBroadcaster, types::keys};
use motorlink_driver::{Decoded, DeviceLink, LinkError, MotorCodec, Request};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::ControlError;

/// Counts consecutive driver errors and escalates past the threshold.
struct LinkHealth {
    consecutive_errors: AtomicU32,
    threshold: u32,
    broadcaster: Arc<TelemetryBroadcaster>,
    token: CancellationToken,
}

impl LinkHealth {
    fn success(&self) {
        self.consecutive_errors.store(0, Ordering::Relaxed);
    }

    fn failure(&self, source: &str, err: &LinkError) {
        let count = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(source, count, "Driver error: {err}");

        if count >= self.threshold && !self.token.is_cancelled() {
            let reason = format!("{count} consecutive driver errors, last: {err}");
            tracing::error!("Device link lost: {reason}");
            self.broadcaster.connection_lost(reason);
            self.token.cancel();
        }
    }
}

struct Loops {
    listener: JoinHandle<()>,
    low_poller: JoinHandle<()>,
    high_poller: JoinHandle<()>,
}

/// Owns the response listener and both pollers of one device link.
pub struct TaskSupervisor {
    device: String,
    adapter: String,
    link: Arc<DeviceLink>,
    broadcaster: Arc<TelemetryBroadcaster>,
    health: Arc<LinkHealth>,
    token: CancellationToken,
    loops: Mutex<Option<Loops>>,
}

impl TaskSupervisor {
    /// Open the device link, spawn the loops, and send the init request.
    ///
    /// # Errors
    /// Returns [`ControlError::Config`] for an unusable configuration and
    /// [`ControlError::Connection`] if the device is unreachable. Nothing is
    /// spawned in either case.
    pub async fn start(
        config: &LinkConfig,
        driver: Arc<dyn ProtocolDriver>,
        codec: Arc<dyn MotorCodec>,
    ) -> Result<Arc<Self>, ControlError> {
        config.validate()?;

        let link = DeviceLink::open(driver, codec, &config.address, config.port)
            .await
            .map_err(|e| ControlError::Connection(e.to_string()))?;
        let link = Arc::new(link);
        let broadcaster = Arc::new(TelemetryBroadcaster::new(config.broadcast_capacity));
        let token = CancellationToken::new();
        let health = Arc::new(LinkHealth {
            consecutive_errors: AtomicU32::new(0),
            threshold: config.error_threshold,
            broadcaster: Arc::clone(&broadcaster),
            token: token.clone(),
        });

        let loops = Loops {
            listener: tokio::spawn(listen(
                Arc::clone(&link),
                Arc::clone(&broadcaster),
                Arc::clone(&health),
                token.clone(),
            )),
            low_poller: tokio::spawn(poll(
                "low_priority",
                config.low_priority_period(),
                config.low_priority_params.clone(),
                Arc::clone(&link),
                Arc::clone(&health),
                token.clone(),
            )),
            high_poller: tokio::spawn(poll(
                "high_priority",
                config.high_priority_period(),
                config.high_priority_params.clone(),
                Arc::clone(&link),
                Arc::clone(&health),
                token.clone(),
            )),
        };

        let supervisor = Arc::new(Self {
            device: config.device_key(),
            adapter: config.adapter.clone(),
            link,
            broadcaster,
            health,
            token,
            loops: Mutex::new(Some(loops)),
        });

        if let Err(e) = supervisor.send(&Request::Init).await {
            tracing::warn!("Init request failed: {e}");
        }

        tracing::info!(device = %supervisor.device, "Supervisor started");
        Ok(supervisor)
    }

    /// Key of the device this supervisor is bound to.
    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Telemetry fan-out of this device.
    #[must_use]
    pub const fn broadcaster(&self) -> &Arc<TelemetryBroadcaster> {
        &self.broadcaster
    }

    /// Whether the loops have been told to stop.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once the loops have been told to stop.
    pub fn terminated(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Write one request on behalf of an observer.
    ///
    /// # Errors
    /// Returns [`ControlError::Connection`] once the supervisor has
    /// terminated, otherwise the mapped link error.
    pub async fn send(&self, request: &Request<'_>) -> Result<(), ControlError> {
        if self.token.is_cancelled() {
            return Err(ControlError::Connection("device link lost".to_string()));
        }
        match self.link.request(request, &self.token).await {
            Ok(()) => {
                self.health.success();
                Ok(())
            }
            Err(e) => {
                if e.is_driver_fault() {
                    self.health.failure(request.kind(), &e);
                }
                Err(e.into())
            }
        }
    }

    /// Run link-layer bring-up on the configured adapter.
    ///
    /// # Errors
    /// Same as [`TaskSupervisor::send`].
    pub async fn bring_up(&self) -> Result<(), ControlError> {
        if self.token.is_cancelled() {
            return Err(ControlError::Connection("device link lost".to_string()));
        }
        self.link
            .bring_up(&self.adapter, &self.token)
            .await
            .map_err(ControlError::from)
    }

    /// Stop the loops, wait for all of them, then close the link.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        self.token.cancel();

        let Some(loops) = self.loops.lock().await.take() else {
            return;
        };
        for (name, handle) in [
            ("listener", loops.listener),
            ("low_priority", loops.low_poller),
            ("high_priority", loops.high_poller),
        ] {
            if let Err(e) = handle.await {
                tracing::warn!(task = name, "Loop ended abnormally: {e}");
            }
        }

        if let Err(e) = self.link.close().await {
            tracing::warn!(device = %self.device, "Closing device link failed: {e}");
        }
        tracing::info!(device = %self.device, "Supervisor stopped");
    }
}

async fn listen(
    link: Arc<DeviceLink>,
    broadcaster: Arc<TelemetryBroadcaster>,
    health: Arc<LinkHealth>,
    token: CancellationToken,
) {
    loop {
        let frame = match link.receive(&token).await {
            Ok(frame) => frame,
            Err(LinkError::Cancelled) => break,
            Err(e) => {
                health.failure("listener", &e);
                continue;
            }
        };
        health.success();

        match link.decode(&frame) {
            Ok(Decoded::Values(values)) => {
                for (key, value) in values {
                    if keys::is_reserved(&key) {
                        tracing::warn!(key = %key, "Dropping telemetry value under a reserved name");
                        continue;
                    }
                    broadcaster.publish(key, value);
                }
            }
            Ok(Decoded::Ack(what)) => tracing::debug!("Device acknowledged {what}"),
            Err(e) => tracing::warn!("Protocol error, frame dropped: {e}"),
        }
    }
    tracing::debug!("Response listener stopped");
}

async fn poll(
    name: &'static str,
    period: Duration,
    params: Vec<String>,
    link: Arc<DeviceLink>,
    health: Arc<LinkHealth>,
    token: CancellationToken,
) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match link.request(&Request::Parameters(&params), &token).await {
            Ok(()) => health.success(),
            Err(LinkError::Cancelled) => break,
            Err(e) if e.is_driver_fault() => health.failure(name, &e),
            Err(e) => tracing::warn!(poller = name, "Poll request lost: {e}"),
        }
    }
    tracing::debug!(poller = name, "Poller stopped");
}
