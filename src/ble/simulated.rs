//! In-process F1s simulator
//!
//! A simulated F1s peripheral and a central that can find and connect to
//! it, entirely in-process. Used for integration testing without real BLE
//! hardware. The peripheral keeps a value table keyed by characteristic,
//! reacts to the motor and use-count commands the way the firmware does,
//! and records every transport operation so tests can assert on what
//! actually went over the "air".

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::transport::{
    GattCentral, GattLink, LinkEvent, NotifyCallback, PeripheralDescriptor, ScanFilter,
    TransportSubscription,
};
use super::BleError;
use crate::protocol::registry::{base_uuid, Service};

/// Vendor base the simulated firmware exposes its own characteristics under.
const SIM_VENDOR_BASE: u128 = 0x0000_0000_1212_efde_1523_785f_ef13_d123;

/// How long one simulated advertising sweep takes.
const ADVERTISING_INTERVAL: Duration = Duration::from_millis(100);

/// Characteristics that accept notify registrations.
const NOTIFY_CHARACTERISTICS: [u16; 6] = [0x0a0f, 0x0aa3, 0x0a0b, 0x0a0c, 0x0a0a, 0x0aa4];

const MOTOR: u16 = 0xfff1;
const KEY_STATE: u16 = 0x0a0f;
const USE_COUNT: u16 = 0x0a04;
const CRUISE_CONTROL: u16 = 0x0aa5;

/// UUID the simulated firmware uses for a short id. SIG-assigned
/// characteristics stay on the Bluetooth base.
pub fn sim_uuid(short_id: u16) -> Uuid {
    if (0x2a00..=0x2aff).contains(&short_id) {
        base_uuid(short_id)
    } else {
        Uuid::from_u128(SIM_VENDOR_BASE | ((short_id as u128) << 96))
    }
}

fn short_id_of(uuid: &Uuid) -> u16 {
    (uuid.as_u128() >> 96) as u16
}

fn factory_values() -> HashMap<Uuid, Vec<u8>> {
    let table: [(u16, &[u8]); 30] = [
        (KEY_STATE, &[0x00]),
        (MOTOR, &[0x01, 0x00, 0x00]),
        (CRUISE_CONTROL, &[0x00]),
        (0x0a0d, &[10, 20, 30, 40, 50, 60, 70, 80]),
        (0x0aa1, &[0x00]),
        (0x0aa3, &[0x00, 0x00]),
        (0x0a0b, &[0x00, 0x00]),
        (0x0a0c, &[0x00, 0x0a, 0x00, 0xc8, 0x03, 0xe8]),
        (0x0a0a, &[0x00, 0x09, 0x79, 0x00, 0x00, 0x01, 0x81, 0xa3]),
        (0x0aa4, &[0x03]),
        (USE_COUNT, &[0x00, 0x2a]),
        (0x2a29, b"LELO"),
        (0x2a24, b"F1s"),
        (0x2a27, b"1.0"),
        (0x2a26, b"1.3.0"),
        (0x2a28, b"1.3.0"),
        (0x2a25, b"F1S0000001"),
        (0x2a00, b"F1s"),
        (0x0a06, &[0xc4, 0x64, 0xe3, 0x00, 0x45, 0x5b]),
        (0x0a05, &[0x00, 0x00, 0x00, 0x01]),
        (0x0a07, &[0x4e, 0x52, 0x46, 0x35]),
        (0x2a23, &[0x5b, 0x45, 0x00, 0xfe, 0xff, 0xe3, 0x64, 0xc4]),
        (0x2a2a, &[0xfe, 0x00, 0x65, 0x78, 0x70, 0x65, 0x72, 0x69]),
        (0x2a50, &[0x01, 0x0d, 0x00, 0x00, 0x00, 0x10, 0x01]),
        (0x2a01, &[0x00, 0x00]),
        (0x2a04, &[0x18, 0x00, 0x28, 0x00, 0x00, 0x00, 0xe8, 0x03]),
        (0x2a19, &[87]),
        // Services are advertised too, so they show up in discovery.
        (Service::Vendor.short_id(), &[]),
        (Service::DeviceInformation.short_id(), &[]),
        (Service::Battery.short_id(), &[]),
    ];
    table
        .iter()
        .map(|(short, value)| (sim_uuid(*short), value.to_vec()))
        .collect()
}

struct SimState {
    values: HashMap<Uuid, Vec<u8>>,
    subscriptions: HashMap<u64, (Uuid, NotifyCallback)>,
    next_subscription: u64,
    /// Bumped on every connect and every drop, so stale links die.
    generation: u64,
    connected: bool,
    powered: bool,
    link_events: Option<broadcast::Sender<LinkEvent>>,
    read_log: Vec<u16>,
    write_log: Vec<(u16, Vec<u8>)>,
    subscribes: usize,
    unsubscribes: usize,
}

struct SimShared {
    address: String,
    name: String,
    state: Mutex<SimState>,
    unresponsive: AtomicBool,
    latency: Mutex<Duration>,
}

/// A simulated F1s. Cheap to clone; clones share the same device.
#[derive(Clone)]
pub struct SimulatedF1 {
    shared: Arc<SimShared>,
}

impl SimulatedF1 {
    /// A powered-on device with factory values.
    pub fn new(address: &str) -> Self {
        Self::with_name(address, "F1s")
    }

    pub fn with_name(address: &str, name: &str) -> Self {
        Self {
            shared: Arc::new(SimShared {
                address: address.to_string(),
                name: name.to_string(),
                state: Mutex::new(SimState {
                    values: factory_values(),
                    subscriptions: HashMap::new(),
                    next_subscription: 1,
                    generation: 0,
                    connected: false,
                    powered: true,
                    link_events: None,
                    read_log: Vec::new(),
                    write_log: Vec::new(),
                    subscribes: 0,
                    unsubscribes: 0,
                }),
                unresponsive: AtomicBool::new(false),
                latency: Mutex::new(Duration::ZERO),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn descriptor(&self) -> PeripheralDescriptor {
        PeripheralDescriptor {
            address: self.shared.address.clone(),
            name: Some(self.shared.name.clone()),
            rssi: Some(-50),
        }
    }

    /// When set, every GATT operation pends forever.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.shared.unresponsive.store(unresponsive, Ordering::SeqCst);
    }

    /// Delay applied to every GATT operation. Uses tokio time, so paused
    /// clocks advance instantly in tests.
    pub fn set_latency(&self, latency: Duration) {
        *self
            .shared
            .latency
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = latency;
    }

    pub fn is_powered(&self) -> bool {
        self.state().powered
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// Current raw value of a characteristic.
    pub fn value(&self, short_id: u16) -> Option<Vec<u8>> {
        self.state().values.get(&sim_uuid(short_id)).cloned()
    }

    /// Overwrite a value without notifying.
    pub fn set_value(&self, short_id: u16, value: &[u8]) {
        self.state().values.insert(sim_uuid(short_id), value.to_vec());
    }

    /// The user presses the central button: key state turns on.
    pub fn press_central_button(&self) {
        self.notify(KEY_STATE, &[0x01]);
    }

    /// Update a value and push it to every notify registration on it.
    pub fn notify(&self, short_id: u16, value: &[u8]) {
        let uuid = sim_uuid(short_id);
        let callbacks: Vec<NotifyCallback> = {
            let mut state = self.state();
            state.values.insert(uuid, value.to_vec());
            if !state.connected {
                return;
            }
            state
                .subscriptions
                .values()
                .filter(|(characteristic, _)| *characteristic == uuid)
                .map(|(_, callback)| Arc::clone(callback))
                .collect()
        };
        for callback in callbacks {
            callback(value);
        }
    }

    /// The radio link drops, as when the device goes out of range.
    pub fn drop_link(&self) {
        let events = {
            let mut state = self.state();
            if !state.connected {
                return;
            }
            state.connected = false;
            state.generation += 1;
            state.subscriptions.clear();
            state.link_events.take()
        };
        log::info!("simulated F1s {} dropped its link", self.shared.address);
        if let Some(events) = events {
            let _ = events.send(LinkEvent::Disconnected);
        }
    }

    /// Number of live reads of a characteristic.
    pub fn read_count(&self, short_id: u16) -> usize {
        self.state().read_log.iter().filter(|s| **s == short_id).count()
    }

    /// Every successful write, oldest first.
    pub fn write_log(&self) -> Vec<(u16, Vec<u8>)> {
        self.state().write_log.clone()
    }

    pub fn write_count(&self) -> usize {
        self.state().write_log.len()
    }

    /// Total notify registrations ever made.
    pub fn subscribe_count(&self) -> usize {
        self.state().subscribes
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.state().unsubscribes
    }

    /// Notify registrations currently open.
    pub fn active_subscriptions(&self) -> usize {
        self.state().subscriptions.len()
    }

    fn open_link(&self) -> Result<SimLink, BleError> {
        let mut state = self.state();
        if !state.powered {
            return Err(BleError::ConnectionError(format!(
                "{} is powered off",
                self.shared.address
            )));
        }
        let (events, _) = broadcast::channel(16);
        state.generation += 1;
        state.connected = true;
        state.subscriptions.clear();
        state.link_events = Some(events.clone());
        Ok(SimLink {
            device: self.clone(),
            generation: state.generation,
            events,
        })
    }

    fn apply_write(&self, state: &mut SimState, uuid: Uuid, data: &[u8]) -> bool {
        let short_id = short_id_of(&uuid);
        match (short_id, data) {
            (MOTOR, [0x01, 0xfa]) => {
                state.powered = false;
                return true;
            }
            (MOTOR, [0x01, _, _]) => {
                state.values.insert(uuid, data.to_vec());
            }
            // Accelerometer self-test: no state change.
            (MOTOR, [0xff, 0xff, 0xff]) => {}
            (USE_COUNT, [0xee]) => {
                state.values.insert(uuid, vec![0x00, 0x00]);
            }
            (CRUISE_CONTROL, [0x02]) => {
                state.values.insert(uuid, vec![0x01]);
                state.values.insert(sim_uuid(MOTOR), vec![0x01, 0x00, 0x00]);
            }
            _ => {
                state.values.insert(uuid, data.to_vec());
            }
        }
        false
    }
}

/// One connection to a [`SimulatedF1`].
pub struct SimLink {
    device: SimulatedF1,
    generation: u64,
    events: broadcast::Sender<LinkEvent>,
}

impl SimLink {
    fn live_state(&self) -> Result<MutexGuard<'_, SimState>, BleError> {
        let state = self.device.state();
        if state.connected && state.generation == self.generation {
            Ok(state)
        } else {
            Err(BleError::Disconnected)
        }
    }

    /// Apply the device's response behavior before an operation.
    async fn respond(&self) {
        if self.device.shared.unresponsive.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let latency = *self
            .device
            .shared
            .latency
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl GattLink for SimLink {
    fn address(&self) -> &str {
        self.device.address()
    }

    fn characteristics(&self) -> Vec<Uuid> {
        let mut uuids: Vec<Uuid> = self.device.state().values.keys().copied().collect();
        uuids.sort();
        uuids
    }

    async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>, BleError> {
        self.respond().await;
        let mut state = self.live_state()?;
        let value = state
            .values
            .get(&uuid)
            .cloned()
            .ok_or(BleError::CharacteristicNotFound(uuid))?;
        state.read_log.push(short_id_of(&uuid));
        Ok(value)
    }

    async fn write_characteristic(
        &self,
        uuid: Uuid,
        data: &[u8],
        _with_response: bool,
    ) -> Result<(), BleError> {
        self.respond().await;
        let powered_off = {
            let mut state = self.live_state()?;
            if !state.values.contains_key(&uuid) {
                return Err(BleError::CharacteristicNotFound(uuid));
            }
            state.write_log.push((short_id_of(&uuid), data.to_vec()));
            self.device.apply_write(&mut state, uuid, data)
        };
        if powered_off {
            log::info!("simulated F1s {} shutting down", self.device.address());
            self.device.drop_link();
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        uuid: Uuid,
        on_value: NotifyCallback,
    ) -> Result<TransportSubscription, BleError> {
        self.respond().await;
        let mut state = self.live_state()?;
        if !state.values.contains_key(&uuid) {
            return Err(BleError::CharacteristicNotFound(uuid));
        }
        if !NOTIFY_CHARACTERISTICS.contains(&short_id_of(&uuid)) {
            return Err(BleError::GattError(format!("{} does not support notify", uuid)));
        }
        if state.subscriptions.values().any(|(c, _)| *c == uuid) {
            return Err(BleError::GattError(format!(
                "notify already registered on {}",
                uuid
            )));
        }
        let id = state.next_subscription;
        state.next_subscription += 1;
        state.subscriptions.insert(id, (uuid, on_value));
        state.subscribes += 1;
        Ok(TransportSubscription {
            id,
            characteristic: uuid,
        })
    }

    async fn unsubscribe(&self, subscription: TransportSubscription) -> Result<(), BleError> {
        let mut state = self.live_state()?;
        if state.subscriptions.remove(&subscription.id).is_some() {
            state.unsubscribes += 1;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        let mut state = self.device.state();
        if state.generation == self.generation && state.connected {
            state.connected = false;
            state.generation += 1;
            state.subscriptions.clear();
            state.link_events = None;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.live_state().is_ok()
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }
}

/// A central that sees a fixed set of simulated devices.
#[derive(Default)]
pub struct SimCentral {
    devices: Mutex<Vec<SimulatedF1>>,
    /// When set, scans never answer.
    silent: AtomicBool,
    failing_connects: AtomicUsize,
    connects: AtomicUsize,
    scans: AtomicUsize,
}

impl SimCentral {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: Vec<SimulatedF1>) -> Self {
        let central = Self::new();
        for device in devices {
            central.add_device(device);
        }
        central
    }

    /// Start advertising a device.
    pub fn add_device(&self, device: SimulatedF1) {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(device);
    }

    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Connection attempts seen so far, failed ones included.
    pub fn connect_attempts(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    fn devices(&self) -> Vec<SimulatedF1> {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl GattCentral for SimCentral {
    async fn scan(
        &self,
        filter: &ScanFilter,
        timeout: Duration,
    ) -> Result<Vec<PeripheralDescriptor>, BleError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if self.silent.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(ADVERTISING_INTERVAL.min(timeout)).await;
        let advertised = [Service::Vendor.uuid()];
        Ok(self
            .devices()
            .into_iter()
            .filter(|d| d.is_powered() && !d.is_connected())
            .filter(|_| {
                filter.services.is_empty() || filter.services.iter().any(|s| advertised.contains(s))
            })
            .map(|d| d.descriptor())
            .collect())
    }

    async fn connect(
        &self,
        address: &str,
        _timeout: Duration,
    ) -> Result<Arc<dyn GattLink>, BleError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(BleError::ConnectionError("simulated connection failure".into()));
        }
        let device = self
            .devices()
            .into_iter()
            .find(|d| d.address() == address)
            .ok_or_else(|| BleError::ConnectionError(format!("No peripheral at {}", address)))?;
        let link = device.open_link()?;
        log::debug!("simulated central connected to {}", address);
        Ok(Arc::new(link))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> (SimulatedF1, Arc<dyn GattLink>) {
        let device = SimulatedF1::new("AA:BB:CC:DD:EE:FF");
        let link: Arc<dyn GattLink> = Arc::new(device.open_link().unwrap());
        (device, link)
    }

    #[tokio::test]
    async fn test_scan_and_connect() {
        let central = SimCentral::with_devices(vec![SimulatedF1::new("AA:BB:CC:DD:EE:FF")]);
        let found = central
            .scan(&ScanFilter::default(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name.as_deref(), Some("F1s"));

        let link = central
            .connect("AA:BB:CC:DD:EE:FF", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(link.is_connected());

        let missing = central.connect("00:00:00:00:00:00", Duration::from_secs(1)).await;
        assert!(matches!(missing, Err(BleError::ConnectionError(_))));
    }

    #[tokio::test]
    async fn test_read_and_write() {
        let (device, link) = connected();
        let model = link.read_characteristic(sim_uuid(0x2a24)).await.unwrap();
        assert_eq!(model, b"F1s");
        assert_eq!(device.read_count(0x2a24), 1);

        link.write_characteristic(sim_uuid(MOTOR), &[0x01, 50, 20], true)
            .await
            .unwrap();
        assert_eq!(device.value(MOTOR), Some(vec![0x01, 50, 20]));
        assert_eq!(device.write_log(), vec![(MOTOR, vec![0x01, 50, 20])]);

        let unknown = link.read_characteristic(sim_uuid(0xbeef)).await;
        assert!(matches!(unknown, Err(BleError::CharacteristicNotFound(_))));
    }

    #[tokio::test]
    async fn test_use_count_reset_command() {
        let (device, link) = connected();
        link.write_characteristic(sim_uuid(USE_COUNT), &[0xee], true)
            .await
            .unwrap();
        assert_eq!(device.value(USE_COUNT), Some(vec![0x00, 0x00]));
    }

    #[tokio::test]
    async fn test_notifications_reach_subscriber() {
        let (device, link) = connected();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        link.subscribe(
            sim_uuid(KEY_STATE),
            Arc::new(move |bytes: &[u8]| sink.lock().unwrap().push(bytes.to_vec())),
        )
        .await
        .unwrap();

        device.press_central_button();
        assert_eq!(*seen.lock().unwrap(), vec![vec![0x01]]);
        assert_eq!(device.value(KEY_STATE), Some(vec![0x01]));
    }

    #[tokio::test]
    async fn test_second_notify_registration_is_rejected() {
        let (device, link) = connected();
        let noop: NotifyCallback = Arc::new(|_: &[u8]| {});
        let first = link.subscribe(sim_uuid(0x0aa4), noop.clone()).await.unwrap();
        let second = link.subscribe(sim_uuid(0x0aa4), noop.clone()).await;
        assert!(matches!(second, Err(BleError::GattError(_))));

        link.unsubscribe(first).await.unwrap();
        assert_eq!(device.active_subscriptions(), 0);
        assert!(link.subscribe(sim_uuid(0x0aa4), noop).await.is_ok());
        assert_eq!(device.subscribe_count(), 2);
        assert_eq!(device.unsubscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_drop_link_emits_event_and_kills_link() {
        let (device, link) = connected();
        let mut events = link.link_events();

        device.drop_link();

        assert_eq!(events.recv().await.unwrap(), LinkEvent::Disconnected);
        assert!(!link.is_connected());
        let result = link.read_characteristic(sim_uuid(0x2a19)).await;
        assert_eq!(result, Err(BleError::Disconnected));
    }

    #[tokio::test]
    async fn test_shutdown_powers_off() {
        let central = SimCentral::with_devices(vec![SimulatedF1::new("AA:BB:CC:DD:EE:FF")]);
        let link = central
            .connect("AA:BB:CC:DD:EE:FF", Duration::from_secs(1))
            .await
            .unwrap();
        link.write_characteristic(sim_uuid(MOTOR), &[0x01, 0xfa], true)
            .await
            .unwrap();

        assert!(!link.is_connected());
        let again = central.connect("AA:BB:CC:DD:EE:FF", Duration::from_secs(1)).await;
        assert!(matches!(again, Err(BleError::ConnectionError(_))));
    }

    #[tokio::test]
    async fn test_reconnect_invalidates_old_link() {
        let device = SimulatedF1::new("AA:BB:CC:DD:EE:FF");
        let old = device.open_link().unwrap();
        let new = device.open_link().unwrap();
        assert!(!old.is_connected());
        assert!(new.is_connected());
    }

    #[tokio::test]
    async fn test_failing_connects() {
        let central = SimCentral::with_devices(vec![SimulatedF1::new("AA:BB:CC:DD:EE:FF")]);
        central.fail_next_connects(1);
        assert!(central.connect("AA:BB:CC:DD:EE:FF", Duration::ZERO).await.is_err());
        assert!(central.connect("AA:BB:CC:DD:EE:FF", Duration::ZERO).await.is_ok());
        assert_eq!(central.connect_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_delays_operations() {
        let (device, link) = connected();
        device.set_latency(Duration::from_millis(100));

        let before = tokio::time::Instant::now();
        link.read_characteristic(sim_uuid(0x2a19)).await.unwrap();
        let elapsed = before.elapsed();

        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_scan_never_answers() {
        let central = SimCentral::with_devices(vec![SimulatedF1::new("AA:BB:CC:DD:EE:FF")]);
        central.set_silent(true);
        let filter = ScanFilter::default();
        let scan = central.scan(&filter, Duration::from_millis(1));
        let result = tokio::time::timeout(Duration::from_secs(60), scan).await;
        assert!(result.is_err());
    }
}
