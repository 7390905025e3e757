//! Latest-value snapshot + live fan-out of device telemetry.

use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock},
};

use futures::{StreamExt, stream::BoxStream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

/// Event delivered to every observer of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// A decoded telemetry value.
    Value { key: String, value: i64 },
    /// The device link was lost; no further values will follow.
    ConnectionLost { reason: String },
}

struct Inner {
    latest: BTreeMap<String, i64>,
    lost: Option<String>,
}

/// Fan-out of telemetry to every observer of one device.
///
/// Each subscriber owns a bounded ring buffer of `capacity` events. A
/// subscriber that falls behind loses its oldest events and never slows
/// the producer or other subscribers. New subscribers first receive the
/// latest value of every key, then live updates, with no gap in between.
pub struct TelemetryBroadcaster {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<TelemetryEvent>,
}

impl TelemetryBroadcaster {
    /// Create a broadcaster with a per-subscriber buffer of `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: RwLock::new(Inner {
                latest: BTreeMap::new(),
                lost: None,
            }),
            sender,
        }
    }

    /// Publish a value to every subscriber.
    pub fn publish(&self, key: impl Into<String>, value: i64) {
        let key = key.into();
        // Sending under the write lock keeps subscribe() from observing a
        // snapshot that misses a value the live receiver also misses.
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.latest.insert(key.clone(), value);
        let _ = self.sender.send(TelemetryEvent::Value { key, value });
    }

    /// Tell every subscriber the link is gone.
    pub fn connection_lost(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.lost.is_some() {
            return;
        }
        inner.lost = Some(reason.clone());
        let _ = self.sender.send(TelemetryEvent::ConnectionLost { reason });
    }

    /// Subscribe to snapshot + live updates.
    #[must_use]
    pub fn subscribe(&self) -> TelemetrySubscription {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut backlog: Vec<TelemetryEvent> = inner
            .latest
            .iter()
            .map(|(key, value)| TelemetryEvent::Value {
                key: key.clone(),
                value: *value,
            })
            .collect();
        if let Some(reason) = &inner.lost {
            backlog.push(TelemetryEvent::ConnectionLost {
                reason: reason.clone(),
            });
        }
        TelemetrySubscription {
            backlog,
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// One observer's view of a [`TelemetryBroadcaster`].
pub struct TelemetrySubscription {
    backlog: Vec<TelemetryEvent>,
    receiver: broadcast::Receiver<TelemetryEvent>,
}

impl TelemetrySubscription {
    /// Stream that yields the snapshot first, then live updates.
    ///
    /// Events dropped because this subscriber lagged are skipped and logged.
    #[must_use]
    pub fn into_stream(self) -> BoxStream<'static, TelemetryEvent> {
        let backlog = futures::stream::iter(self.backlog);
        let live = BroadcastStream::new(self.receiver).filter_map(|res| async move {
            match res {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Telemetry observer lagged, dropped oldest values");
                    None
                }
            }
        });
        backlog.chain(live).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(key: &str, value: i64) -> TelemetryEvent {
        TelemetryEvent::Value {
            key: key.to_string(),
            value,
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_every_value() {
        let broadcaster = TelemetryBroadcaster::new(16);
        let mut a = broadcaster.subscribe().into_stream();
        let mut b = broadcaster.subscribe().into_stream();

        broadcaster.publish("actual_velocity", 1);
        broadcaster.publish("actual_velocity", 2);

        for stream in [&mut a, &mut b] {
            assert_eq!(stream.next().await, Some(value("actual_velocity", 1)));
            assert_eq!(stream.next().await, Some(value("actual_velocity", 2)));
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_snapshot_then_live() {
        let broadcaster = TelemetryBroadcaster::new(16);
        broadcaster.publish("phase_current", 7);
        broadcaster.publish("phase_current", 9);

        let mut stream = broadcaster.subscribe().into_stream();
        broadcaster.publish("phase_current", 11);

        assert_eq!(stream.next().await, Some(value("phase_current", 9)));
        assert_eq!(stream.next().await, Some(value("phase_current", 11)));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_keeps_newest_in_order() {
        let broadcaster = TelemetryBroadcaster::new(4);
        let mut slow = broadcaster.subscribe().into_stream();
        let mut fast = broadcaster.subscribe().into_stream();

        for v in 0..10 {
            broadcaster.publish("actual_position", v);
            assert_eq!(fast.next().await, Some(value("actual_position", v)));
        }

        let mut seen = Vec::new();
        for _ in 0..4 {
            if let Some(TelemetryEvent::Value { value, .. }) = slow.next().await {
                seen.push(value);
            }
        }
        assert_eq!(seen, vec![6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn test_connection_lost_is_sticky() {
        let broadcaster = TelemetryBroadcaster::new(4);
        broadcaster.connection_lost("driver failed");
        broadcaster.connection_lost("again");

        let mut stream = broadcaster.subscribe().into_stream();
        assert_eq!(
            stream.next().await,
            Some(TelemetryEvent::ConnectionLost {
                reason: "driver failed".to_string()
            })
        );
    }
}
