//! Per-observer connection context.

use std::sync::Arc;

use futures::{StreamExt, stream::BoxStream};
use motorlink_core::{LinkConfig, PersistenceStore, TelemetryEvent, UserId};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    dispatcher::Reply,
    error::ControlError,
    hub::DeviceHub,
    recorder::{LoggingState, SampleRecorder},
    supervisor::TaskSupervisor,
};

/// Message queued for one observer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Broadcast telemetry value.
    Telemetry { key: String, value: i64 },
    /// Result of one of this observer's commands.
    Reply(Reply),
    /// The device link is gone. Nothing follows.
    ConnectionLost { reason: String },
}

/// One observer of a device.
///
/// Owns the telemetry pump feeding its outbound queue and its own logging
/// toggle. The device link itself is shared through the [`DeviceHub`].
pub struct Connection {
    id: Uuid,
    user: UserId,
    supervisor: Arc<TaskSupervisor>,
    logging: Arc<LoggingState>,
    stop: CancellationToken,
    pump: Option<JoinHandle<()>>,
}

impl Connection {
    /// Join the configured device and start forwarding its telemetry to
    /// `outbound`.
    ///
    /// # Errors
    /// Returns [`ControlError::Connection`] if the device is unreachable.
    pub async fn accept(
        hub: &DeviceHub,
        config: &LinkConfig,
        user: UserId,
        store: Arc<dyn PersistenceStore>,
        outbound: mpsc::Sender<Outbound>,
    ) -> Result<Self, ControlError> {
        let supervisor = hub.acquire(config).await?;
        let id = Uuid::new_v4();
        let logging = Arc::new(LoggingState::new());
        let stop = CancellationToken::new();

        let events = supervisor.broadcaster().subscribe().into_stream();
        let recorder = SampleRecorder::new(store, Arc::clone(&logging));
        let pump = tokio::spawn(pump(events, recorder, outbound, stop.clone()));

        tracing::info!(connection = %id, %user, device = supervisor.device(), "Connection accepted");
        Ok(Self {
            id,
            user,
            supervisor,
            logging,
            stop,
            pump: Some(pump),
        })
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Identity of the observer.
    #[must_use]
    pub const fn user(&self) -> &UserId {
        &self.user
    }

    /// Supervisor of the shared device link.
    #[must_use]
    pub const fn supervisor(&self) -> &Arc<TaskSupervisor> {
        &self.supervisor
    }

    /// Logging toggle of this connection.
    #[must_use]
    pub const fn logging(&self) -> &Arc<LoggingState> {
        &self.logging
    }

    /// Stop the pump and leave the device. The last observer to leave
    /// closes the device link.
    pub async fn close(mut self, hub: &DeviceHub) {
        self.stop.cancel();
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.await {
                tracing::warn!(connection = %self.id, "Telemetry pump ended abnormally: {e}");
            }
        }
        self.logging.disable();
        hub.release(&self.supervisor).await;
        tracing::info!(connection = %self.id, user = %self.user, "Connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn pump(
    mut events: BoxStream<'static, TelemetryEvent>,
    mut recorder: SampleRecorder,
    outbound: mpsc::Sender<Outbound>,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            event = events.next() => event,
        };

        let (message, last) = match event {
            Some(TelemetryEvent::Value { key, value }) => {
                recorder.observe(&key, value).await;
                (Outbound::Telemetry { key, value }, false)
            }
            Some(TelemetryEvent::ConnectionLost { reason }) => (Outbound::ConnectionLost { reason }, true),
            None => break,
        };

        let delivered = tokio::select! {
            biased;
            () = stop.cancelled() => false,
            sent = outbound.send(message) => sent.is_ok(),
        };
        if !delivered || last {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use motorlink_core::types::keys;
    use tokio_test::assert_ok;

    use super::*;
    use crate::testing::Fixture;

    async fn next_telemetry(rx: &mut mpsc::Receiver<Outbound>) -> (String, i64) {
        loop {
            match rx.recv().await {
                Some(Outbound::Telemetry { key, value }) => return (key, value),
                Some(_) => {}
                None => panic!("outbound closed"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_observer_receives_telemetry_in_order() {
        let fixture = Fixture::new();
        let (a, mut a_rx) = fixture.connect("ada").await;
        let (b, mut b_rx) = fixture.connect("bob").await;
        assert!(Arc::ptr_eq(a.supervisor(), b.supervisor()));

        for v in 1..=5 {
            fixture.driver.push_frame(&format!("actual_velocity={v}"));
        }

        for rx in [&mut a_rx, &mut b_rx] {
            for v in 1..=5 {
                assert_eq!(next_telemetry(rx).await, ("actual_velocity".to_string(), v));
            }
        }

        a.close(&fixture.hub).await;
        b.close(&fixture.hub).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_logging_is_per_connection() {
        let fixture = Fixture::new();
        let (a, mut a_rx) = fixture.connect("ada").await;
        let (b, mut b_rx) = fixture.connect("bob").await;
        let ada = assert_ok!(fixture.sessions.start_session(a.user()).await);
        let bob = assert_ok!(fixture.sessions.start_session(b.user()).await);
        a.logging().enable(ada.id);

        fixture.driver.push_frame("actual_position=1;actual_velocity=2;phase_current=3;voltage_logic=24");
        for rx in [&mut a_rx, &mut b_rx] {
            for _ in keys::SAMPLED {
                next_telemetry(rx).await;
            }
        }

        let samples = assert_ok!(fixture.sessions.session_samples(ada.id).await);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].position, 1);
        assert_eq!(samples[0].voltage_logic, 24);
        assert!(assert_ok!(fixture.sessions.session_samples(bob.id).await).is_empty());

        a.close(&fixture.hub).await;
        b.close(&fixture.hub).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_lost_reaches_observer() {
        let fixture = Fixture::new();
        let (connection, mut rx) = fixture.connect("ada").await;

        fixture.driver.fail_sends(usize::MAX);

        let reason = loop {
            match rx.recv().await {
                Some(Outbound::ConnectionLost { reason }) => break reason,
                Some(_) => {}
                None => panic!("outbound closed before connection lost"),
            }
        };
        assert!(reason.contains("consecutive driver errors"));
        assert!(connection.supervisor().is_terminated());

        connection.close(&fixture.hub).await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_close_stops_device_writes() {
        let fixture = Fixture::new();
        let (a, _a_rx) = fixture.connect("ada").await;
        let (b, _b_rx) = fixture.connect("bob").await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        a.close(&fixture.hub).await;
        assert!(!fixture.driver.is_closed());

        b.close(&fixture.hub).await;
        assert!(fixture.driver.is_closed());
        let written = fixture.driver.writes().len();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fixture.driver.writes().len(), written);
        assert_eq!(fixture.driver.writes_after_close(), 0);
        assert_eq!(fixture.driver.overlapping_writes(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_device_rejects_connection() {
        let fixture = Fixture::new();
        fixture.driver.refuse_connections();

        let (tx, _rx) = mpsc::channel(8);
        let result = Connection::accept(
            &fixture.hub,
            &fixture.config,
            UserId::new("ada"),
            fixture.store(),
            tx,
        )
        .await;
        assert!(matches!(result, Err(ControlError::Connection(_))));
    }
}
