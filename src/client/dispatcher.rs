//! Command dispatcher
//!
//! Every GATT transaction on a link goes through here. The radio only
//! supports one outstanding transaction, so calls are queued FIFO behind a
//! fair lock. Each call races the transport against the command deadline
//! and against link loss; once the link is lost it stays lost.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::Level;
use tokio::sync::{watch, Mutex};

use super::IO_TARGET;
use crate::ble::transport::{GattLink, NotifyCallback, TransportSubscription};
use crate::ble::BleError;
use crate::config::ClientConfig;
use crate::error::F1Error;
use crate::protocol::codec::{self, FeatureValue, FromFeatureValue};
use crate::protocol::registry::{AddressMap, Feature, Operation};

/// Per-link dispatch parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Deadline for one call, queue wait included.
    pub command_timeout: Duration,
    /// Calls allowed to wait or run at once before new ones get `Busy`.
    pub max_pending: usize,
    pub write_with_response: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for DispatchSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            command_timeout: config.command_timeout,
            max_pending: config.max_pending_commands,
            write_with_response: config.write_with_response,
        }
    }
}

/// Decrements the pending counter when a call finishes, however it ends.
struct PendingSlot<'a>(&'a AtomicUsize);

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct CommandDispatcher {
    link: Arc<dyn GattLink>,
    addresses: AddressMap,
    settings: DispatchSettings,
    /// Tokio's mutex is fair, which gives FIFO ordering of queued calls.
    queue: Mutex<()>,
    pending: AtomicUsize,
    alive: watch::Sender<bool>,
}

impl CommandDispatcher {
    pub fn new(link: Arc<dyn GattLink>, addresses: AddressMap, settings: DispatchSettings) -> Self {
        let (alive, _) = watch::channel(true);
        Self {
            link,
            addresses,
            settings,
            queue: Mutex::new(()),
            pending: AtomicUsize::new(0),
            alive,
        }
    }

    pub fn link(&self) -> &Arc<dyn GattLink> {
        &self.link
    }

    pub fn addresses(&self) -> &AddressMap {
        &self.addresses
    }

    pub fn settings(&self) -> DispatchSettings {
        self.settings
    }

    pub fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    /// Liveness of the link; flips to `false` exactly once.
    pub fn link_state(&self) -> watch::Receiver<bool> {
        self.alive.subscribe()
    }

    /// Mark the link dead. Queued and in-flight calls fail with `LinkLost`.
    pub fn mark_lost(&self) {
        let was_alive = self.alive.send_replace(false);
        if was_alive {
            log::warn!("link to {} marked lost", self.link.address());
        }
    }

    /// Number of calls queued or in flight.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub async fn read(&self, feature: Feature) -> Result<FeatureValue, F1Error> {
        self.read_logged(feature, Level::Debug).await
    }

    /// Read logged at trace only, for tight poll loops.
    pub async fn read_quiet(&self, feature: Feature) -> Result<FeatureValue, F1Error> {
        self.read_logged(feature, Level::Trace).await
    }

    /// Read and convert to the type the caller expects.
    pub async fn read_as<T: FromFeatureValue>(&self, feature: Feature) -> Result<T, F1Error> {
        let value = self.read(feature).await?;
        T::from_feature_value(feature, value)
    }

    pub async fn read_as_quiet<T: FromFeatureValue>(
        &self,
        feature: Feature,
    ) -> Result<T, F1Error> {
        let value = self.read_quiet(feature).await?;
        T::from_feature_value(feature, value)
    }

    async fn read_logged(&self, feature: Feature, level: Level) -> Result<FeatureValue, F1Error> {
        feature.descriptor().require(Operation::Read)?;
        let uuid = self.addresses.uuid_for(feature);
        let link = Arc::clone(&self.link);
        let bytes = self
            .transact(format!("read {}", feature), move || async move {
                link.read_characteristic(uuid).await
            })
            .await?;
        log::log!(target: IO_TARGET, level, "read {} <- {}", feature, hex::encode(&bytes));
        codec::decode(feature, &bytes)
    }

    /// Encode and write a value.
    pub async fn write(&self, feature: Feature, value: &FeatureValue) -> Result<(), F1Error> {
        feature.descriptor().require(Operation::Write)?;
        let payload = codec::encode(feature, value)?;
        self.write_raw(feature, payload).await
    }

    /// Write an already encoded payload.
    pub async fn write_raw(&self, feature: Feature, payload: Vec<u8>) -> Result<(), F1Error> {
        feature.descriptor().require(Operation::Write)?;
        let uuid = self.addresses.uuid_for(feature);
        let link = Arc::clone(&self.link);
        let with_response = self.settings.write_with_response;
        log::debug!(target: IO_TARGET, "write {} -> {}", feature, hex::encode(&payload));
        self.transact(format!("write {}", feature), move || async move {
            link.write_characteristic(uuid, &payload, with_response).await
        })
        .await
    }

    /// Open a transport notify registration for a feature.
    pub(crate) async fn open_notifications(
        &self,
        feature: Feature,
        on_value: NotifyCallback,
    ) -> Result<TransportSubscription, F1Error> {
        feature.descriptor().require(Operation::Notify)?;
        let uuid = self.addresses.uuid_for(feature);
        let link = Arc::clone(&self.link);
        log::debug!(target: IO_TARGET, "enable notifications on {} ({})", feature, uuid);
        self.transact(format!("subscribe {}", feature), move || async move {
            link.subscribe(uuid, on_value).await
        })
        .await
    }

    pub(crate) async fn close_notifications(
        &self,
        subscription: TransportSubscription,
    ) -> Result<(), F1Error> {
        let link = Arc::clone(&self.link);
        log::debug!(
            target: IO_TARGET,
            "disable notifications on {}",
            subscription.characteristic
        );
        self.transact(
            format!("unsubscribe {}", subscription.characteristic),
            move || async move { link.unsubscribe(subscription).await },
        )
        .await
    }

    /// Run one transport call in queue order, under the command deadline,
    /// aborting if the link is lost meanwhile.
    async fn transact<T, F, Fut>(&self, operation: String, call: F) -> Result<T, F1Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BleError>>,
    {
        if !self.is_alive() {
            return Err(F1Error::LinkLost);
        }
        if !self.link.is_connected() {
            self.mark_lost();
            return Err(F1Error::LinkLost);
        }

        let depth = self.pending.fetch_add(1, Ordering::SeqCst);
        let _slot = PendingSlot(&self.pending);
        if depth >= self.settings.max_pending {
            log::warn!("{} rejected: {} commands already queued", operation, depth);
            return Err(F1Error::Busy(depth));
        }

        let mut alive = self.alive.subscribe();
        let work = async {
            let _turn = self.queue.lock().await;
            if !self.is_alive() {
                return Err(F1Error::LinkLost);
            }
            call().await.map_err(F1Error::from)
        };

        let timeout = self.settings.command_timeout;
        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, work) => match result {
                Ok(outcome) => outcome,
                Err(_) => {
                    log::warn!("{} timed out after {:?}", operation, timeout);
                    Err(F1Error::Timeout { operation, timeout })
                }
            },
            _ = alive.wait_for(|alive| !*alive) => Err(F1Error::LinkLost),
        };

        if matches!(outcome, Err(F1Error::LinkLost)) {
            self.mark_lost();
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::simulated::SimulatedF1;
    use crate::ble::transport::GattCentral;
    use crate::ble::simulated::SimCentral;
    use crate::protocol::MotorSpeeds;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    async fn dispatcher_with(settings: DispatchSettings) -> (SimulatedF1, Arc<CommandDispatcher>) {
        let device = SimulatedF1::new(ADDRESS);
        let central = SimCentral::with_devices(vec![device.clone()]);
        let link = central.connect(ADDRESS, Duration::from_secs(1)).await.unwrap();
        let addresses = AddressMap::resolve(&link.characteristics());
        (device, Arc::new(CommandDispatcher::new(link, addresses, settings)))
    }

    async fn dispatcher() -> (SimulatedF1, Arc<CommandDispatcher>) {
        dispatcher_with(DispatchSettings::default()).await
    }

    #[tokio::test]
    async fn test_read_decodes_through_registry() {
        let (_device, dispatcher) = dispatcher().await;
        let battery: u8 = dispatcher.read_as(Feature::BatteryLevel).await.unwrap();
        assert_eq!(battery, 87);
        let model: String = dispatcher.read_as(Feature::ModelNumber).await.unwrap();
        assert_eq!(model, "F1s");
    }

    #[tokio::test]
    async fn test_write_encodes_payload() {
        let (device, dispatcher) = dispatcher().await;
        let speeds = MotorSpeeds { main: 40, vibration: 60 };
        dispatcher
            .write(Feature::MotorSpeed, &FeatureValue::MotorSpeeds(speeds))
            .await
            .unwrap();
        assert_eq!(device.value(0xfff1), Some(vec![0x01, 40, 60]));
        let back: MotorSpeeds = dispatcher.read_as(Feature::MotorSpeed).await.unwrap();
        assert_eq!(back, speeds);
    }

    #[tokio::test]
    async fn test_access_mode_is_enforced_before_transport() {
        let (device, dispatcher) = dispatcher().await;
        let err = dispatcher.read(Feature::Shutdown).await.unwrap_err();
        assert!(matches!(err, F1Error::AccessDenied { operation: Operation::Read, .. }));

        let err = dispatcher
            .write(Feature::BatteryLevel, &FeatureValue::Percent(10))
            .await
            .unwrap_err();
        assert!(matches!(err, F1Error::AccessDenied { operation: Operation::Write, .. }));

        // Read-only features without an encoder still report the access mode.
        let err = dispatcher
            .write(Feature::ModelNumber, &FeatureValue::Text("F2".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, F1Error::AccessDenied { operation: Operation::Write, .. }));
        assert_eq!(device.write_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_performs_no_write() {
        let (device, dispatcher) = dispatcher().await;
        let err = dispatcher
            .write(
                Feature::MotorSpeed,
                &FeatureValue::MotorSpeeds(MotorSpeeds { main: 120, vibration: 0 }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, F1Error::OutOfRange { value: 120, .. }));
        assert_eq!(device.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_device_times_out() {
        let (device, dispatcher) = dispatcher().await;
        device.set_unresponsive(true);

        let err = dispatcher.read(Feature::BatteryLevel).await.unwrap_err();
        assert!(matches!(err, F1Error::Timeout { .. }));
        assert!(err.is_retryable());
        // A timeout does not kill the link.
        assert!(dispatcher.is_alive());
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_complete_in_issue_order() {
        let (device, dispatcher) = dispatcher().await;
        device.set_latency(Duration::from_millis(50));

        let mut handles = Vec::new();
        for main in [10u8, 20, 30, 40] {
            let dispatcher = Arc::clone(&dispatcher);
            handles.push(tokio::spawn(async move {
                dispatcher
                    .write(
                        Feature::MotorSpeed,
                        &FeatureValue::MotorSpeeds(MotorSpeeds { main, vibration: 0 }),
                    )
                    .await
            }));
            // Let each call reach the queue before issuing the next.
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mains: Vec<u8> = device.write_log().iter().map(|(_, bytes)| bytes[1]).collect();
        assert_eq!(mains, vec![10, 20, 30, 40]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_overflow_is_busy() {
        let settings = DispatchSettings {
            max_pending: 1,
            ..DispatchSettings::default()
        };
        let (device, dispatcher) = dispatcher_with(settings).await;
        device.set_latency(Duration::from_millis(100));

        let first = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.read(Feature::BatteryLevel).await })
        };
        tokio::task::yield_now().await;

        let err = dispatcher.read(Feature::BatteryLevel).await.unwrap_err();
        assert_eq!(err, F1Error::Busy(1));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_link_loss_fails_in_flight_call() {
        let (device, dispatcher) = dispatcher().await;
        device.set_unresponsive(true);

        let in_flight = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.read(Feature::BatteryLevel).await })
        };
        tokio::task::yield_now().await;
        dispatcher.mark_lost();

        assert_eq!(in_flight.await.unwrap(), Err(F1Error::LinkLost));
        // And every later call.
        device.set_unresponsive(false);
        assert_eq!(
            dispatcher.read(Feature::BatteryLevel).await,
            Err(F1Error::LinkLost)
        );
    }

    #[tokio::test]
    async fn test_transport_disconnect_marks_link_dead() {
        let (device, dispatcher) = dispatcher().await;
        device.drop_link();

        assert_eq!(dispatcher.read(Feature::ModelNumber).await, Err(F1Error::LinkLost));
        assert!(!dispatcher.is_alive());
    }
}
