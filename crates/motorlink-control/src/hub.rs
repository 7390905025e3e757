//! One supervisor per device, shared by every observer of that device.

use std::{collections::HashMap, sync::Arc};

use motorlink_core::{LinkConfig, ProtocolDriver};
use motorlink_driver::MotorCodec;
use tokio::sync::Mutex;

use crate::{error::ControlError, supervisor::TaskSupervisor};

/// Creates a fresh, unconnected driver for a device.
pub trait DriverFactory: Send + Sync {
    fn create(&self) -> Arc<dyn ProtocolDriver>;
}

impl<F> DriverFactory for F
where
    F: Fn() -> Arc<dyn ProtocolDriver> + Send + Sync,
{
    fn create(&self) -> Arc<dyn ProtocolDriver> {
        self()
    }
}

struct DeviceEntry {
    supervisor: Arc<TaskSupervisor>,
    observers: usize,
}

/// One device's entry. Its lock is held while the device starts or stops,
/// so only observers of that device wait on it.
type Slot = Arc<Mutex<Option<DeviceEntry>>>;

/// Registry of running supervisors keyed by device address.
///
/// The first observer of a device opens the link; the last one to leave
/// shuts it down. A supervisor that terminated on its own is replaced on
/// the next [`DeviceHub::acquire`].
pub struct DeviceHub {
    factory: Arc<dyn DriverFactory>,
    codec: Arc<dyn MotorCodec>,
    /// Held for bookkeeping only, never across a device start or stop.
    devices: Mutex<HashMap<String, Slot>>,
}

impl DeviceHub {
    #[must_use]
    pub fn new(factory: Arc<dyn DriverFactory>, codec: Arc<dyn MotorCodec>) -> Self {
        Self {
            factory,
            codec,
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Join the supervisor of the configured device, starting it if needed.
    ///
    /// # Errors
    /// Returns error if a new supervisor has to be started and fails to.
    pub async fn acquire(&self, config: &LinkConfig) -> Result<Arc<TaskSupervisor>, ControlError> {
        let key = config.device_key();
        loop {
            let slot = Arc::clone(self.devices.lock().await.entry(key.clone()).or_default());
            let mut entry = slot.lock().await;
            if !self.holds(&key, &slot).await {
                // The device was torn down while we waited
                continue;
            }

            if let Some(current) = entry.as_mut() {
                if !current.supervisor.is_terminated() {
                    current.observers += 1;
                    tracing::debug!(device = %key, observers = current.observers, "Observer joined");
                    return Ok(Arc::clone(&current.supervisor));
                }
            }

            if let Some(stale) = entry.take() {
                tracing::info!(device = %key, "Replacing terminated supervisor");
                stale.supervisor.shutdown().await;
            }

            return match TaskSupervisor::start(config, self.factory.create(), Arc::clone(&self.codec)).await {
                Ok(supervisor) => {
                    *entry = Some(DeviceEntry {
                        supervisor: Arc::clone(&supervisor),
                        observers: 1,
                    });
                    Ok(supervisor)
                }
                Err(e) => {
                    self.forget(&key, &slot).await;
                    Err(e)
                }
            };
        }
    }

    /// Leave `supervisor`. The last observer to leave shuts it down.
    pub async fn release(&self, supervisor: &Arc<TaskSupervisor>) {
        let key = supervisor.device().to_string();
        let slot = self.devices.lock().await.get(&key).cloned();
        let Some(slot) = slot else {
            supervisor.shutdown().await;
            return;
        };

        let mut entry = slot.lock().await;
        let Some(current) = entry
            .as_mut()
            .filter(|current| Arc::ptr_eq(&current.supervisor, supervisor))
        else {
            // Already reaped and replaced; the stale one only needs to stop.
            drop(entry);
            supervisor.shutdown().await;
            return;
        };

        current.observers = current.observers.saturating_sub(1);
        if current.observers > 0 {
            tracing::debug!(device = %key, observers = current.observers, "Observer left");
            return;
        }
        *entry = None;
        supervisor.shutdown().await;
        self.forget(&key, &slot).await;
    }

    /// Number of devices registered, including ones starting or stopping.
    pub async fn device_count(&self) -> usize {
        self.devices.lock().await.len()
    }

    /// Shut every supervisor down.
    pub async fn shutdown(&self) {
        let slots: Vec<_> = self.devices.lock().await.drain().collect();
        for (key, slot) in slots {
            if let Some(entry) = slot.lock().await.take() {
                tracing::info!(device = %key, observers = entry.observers, "Shutting down device");
                entry.supervisor.shutdown().await;
            }
        }
    }

    async fn holds(&self, key: &str, slot: &Slot) -> bool {
        self.devices
            .lock()
            .await
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    async fn forget(&self, key: &str, slot: &Slot) {
        let mut devices = self.devices.lock().await;
        if devices.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            devices.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use motorlink_driver::{LineCodec, RecordingDriver};
    use tokio::time;
    use tokio_test::assert_ok;

    use super::*;

    type Drivers = Arc<std::sync::Mutex<Vec<Arc<RecordingDriver>>>>;

    fn hub(drivers: Drivers) -> DeviceHub {
        let factory = move || {
            let driver = Arc::new(RecordingDriver::new());
            drivers.lock().unwrap().push(Arc::clone(&driver));
            driver as Arc<dyn ProtocolDriver>
        };
        DeviceHub::new(Arc::new(factory), Arc::new(LineCodec))
    }

    fn config() -> LinkConfig {
        LinkConfig {
            address: "127.0.0.1".to_string(),
            error_threshold: 2,
            ..LinkConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_observers_share_one_supervisor() {
        let drivers = Drivers::default();
        let hub = hub(Arc::clone(&drivers));

        let first = assert_ok!(hub.acquire(&config()).await);
        let second = assert_ok!(hub.acquire(&config()).await);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(drivers.lock().unwrap().len(), 1);

        hub.release(&first).await;
        assert!(!second.is_terminated());
        assert_eq!(hub.device_count().await, 1);

        hub.release(&second).await;
        assert!(second.is_terminated());
        assert_eq!(hub.device_count().await, 0);
        assert!(drivers.lock().unwrap()[0].is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminated_supervisor_is_replaced() {
        let drivers = Drivers::default();
        let hub = hub(Arc::clone(&drivers));

        let first = assert_ok!(hub.acquire(&config()).await);
        drivers.lock().unwrap()[0].fail_sends(usize::MAX);
        first.terminated().await;

        let second = assert_ok!(hub.acquire(&config()).await);
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_terminated());
        assert_eq!(drivers.lock().unwrap().len(), 2);
        assert!(drivers.lock().unwrap()[0].is_closed());

        // The stale observer leaving must not touch the replacement.
        hub.release(&first).await;
        assert!(!second.is_terminated());

        hub.release(&second).await;
        assert_eq!(hub.device_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_device_does_not_block_others() {
        let created = Arc::new(AtomicUsize::new(0));
        let factory = move || {
            let driver = RecordingDriver::new();
            if created.fetch_add(1, Ordering::SeqCst) == 0 {
                driver.stall();
            }
            Arc::new(driver) as Arc<dyn ProtocolDriver>
        };
        let hub = Arc::new(DeviceHub::new(Arc::new(factory), Arc::new(LineCodec)));

        let stuck = LinkConfig {
            address: "10.0.0.1".to_string(),
            ..config()
        };
        let pending = tokio::spawn({
            let hub = Arc::clone(&hub);
            async move { hub.acquire(&stuck).await.is_ok() }
        });
        time::sleep(Duration::from_millis(100)).await;
        assert!(!pending.is_finished());

        let other = assert_ok!(assert_ok!(time::timeout(Duration::from_secs(30), hub.acquire(&config())).await));
        assert_eq!(assert_ok!(time::timeout(Duration::from_secs(30), hub.device_count()).await), 2);

        assert_ok!(time::timeout(Duration::from_secs(30), hub.release(&other)).await);
        assert!(other.is_terminated());
        assert_eq!(hub.device_count().await, 1);

        pending.abort();
    }

    #[tokio::test]
    async fn test_failed_start_registers_nothing() {
        let factory = || {
            let driver = RecordingDriver::new();
            driver.refuse_connections();
            Arc::new(driver) as Arc<dyn ProtocolDriver>
        };
        let hub = DeviceHub::new(Arc::new(factory), Arc::new(LineCodec));

        let result = hub.acquire(&config()).await;
        assert!(matches!(result, Err(ControlError::Connection(_))));
        assert_eq!(hub.device_count().await, 0);
    }
}
