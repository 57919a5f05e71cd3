//! F1s client
//!
//! [`F1Client`] owns at most one link and composes the dispatcher, the
//! authorization state machine and the notification multiplexer into the
//! session lifecycle:
//!
//! ```text
//! discover → connect → poll get_key_state until true → commands / notify_* → disconnect
//! ```
//!
//! Identity reads, battery, key state and every `notify_*` subscription
//! work straight after connecting. Every other read or write is privileged
//! and fails with `NotAuthorized` until the user has pressed the central
//! button and a key-state read observed it.

pub mod authorization;
pub mod dispatcher;
pub mod notifications;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::ble::transport::{GattCentral, GattLink, LinkEvent, PeripheralDescriptor, ScanFilter};
use crate::ble::BleError;
use crate::config::ClientConfig;
use crate::error::F1Error;
use crate::profile::ConnectionProfile;
use crate::protocol::codec::{self, FeatureValue, FromFeatureValue};
use crate::protocol::registry::{lookup_name, AddressMap, Feature, Operation};
use crate::protocol::{Accelerometer, ButtonState, CruiseControl, MotorSpeeds, TemperaturePressure};

pub use authorization::{AuthorizationState, KeyStateMachine};
pub use dispatcher::{CommandDispatcher, DispatchSettings};
pub use notifications::{NotificationMultiplexer, Subscription};

/// Every read and write payload.
pub(crate) const IO_TARGET: &str = "lelo_f1::io";
/// Subscription bookkeeping.
pub(crate) const NOTIFICATION_TARGET: &str = "lelo_f1::notification";

/// Everything tied to one link.
struct Session {
    dispatcher: Arc<CommandDispatcher>,
    notifications: NotificationMultiplexer,
    auth: Mutex<KeyStateMachine>,
    watcher: JoinHandle<()>,
    profile: ConnectionProfile,
}

impl Session {
    fn auth(&self) -> MutexGuard<'_, KeyStateMachine> {
        self.auth.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

/// Watch for the transport reporting link loss, then fail the dispatcher
/// and silence every listener.
fn spawn_link_watcher(
    link: &Arc<dyn GattLink>,
    dispatcher: Arc<CommandDispatcher>,
    notifications: NotificationMultiplexer,
) -> JoinHandle<()> {
    let mut events = link.link_events();
    let address = link.address().to_string();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(LinkEvent::Disconnected) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(skipped)) => {
                    log::debug!("link watcher for {} skipped {} events", address, skipped);
                }
            }
        }
        log::warn!("link to {} lost", address);
        dispatcher.mark_lost();
        notifications.close();
    })
}

pub struct F1Client {
    central: Arc<dyn GattCentral>,
    config: ClientConfig,
    key_state_check: AtomicBool,
    session: RwLock<Option<Arc<Session>>>,
    /// Held across connect and disconnect so links never overlap.
    lifecycle: tokio::sync::Mutex<()>,
    /// Advertised names seen during discovery, by address.
    seen_names: Mutex<HashMap<String, String>>,
}

impl F1Client {
    pub fn new(central: Arc<dyn GattCentral>, config: ClientConfig) -> Self {
        Self {
            central,
            key_state_check: AtomicBool::new(config.key_state_check),
            config,
            session: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            seen_names: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn current(&self) -> Option<Arc<Session>> {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn session(&self) -> Result<Arc<Session>, F1Error> {
        self.current().ok_or(F1Error::NotConnected)
    }

    fn take_session(&self) -> Option<Arc<Session>> {
        self.session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    // ---- lifecycle ----

    /// Scan for F1s devices. With `address`, only that device matches;
    /// otherwise any device advertising one of the configured names.
    /// Rescans until something matches; returns an empty list once
    /// `timeout` passes, even if the transport never answers.
    pub async fn discover(
        &self,
        timeout: Duration,
        address: Option<&str>,
    ) -> Result<Vec<PeripheralDescriptor>, F1Error> {
        let deadline = Instant::now() + timeout;
        let filter = ScanFilter::default();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::info!("discovery found no F1s within {:?}", timeout);
                return Ok(Vec::new());
            }
            let window = remaining.min(self.config.scan_window);
            let found = match tokio::time::timeout(remaining, self.central.scan(&filter, window))
                .await
            {
                Ok(found) => found?,
                Err(_) => {
                    log::info!("discovery timed out after {:?}", timeout);
                    return Ok(Vec::new());
                }
            };
            let matches: Vec<PeripheralDescriptor> = found
                .into_iter()
                .filter(|p| self.is_target(p, address))
                .collect();
            if !matches.is_empty() {
                let mut seen = self
                    .seen_names
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                for p in &matches {
                    log::info!("discovered {} ({:?}, rssi {:?})", p.address, p.name, p.rssi);
                    if let Some(name) = &p.name {
                        seen.insert(p.address.clone(), name.clone());
                    }
                }
                return Ok(matches);
            }
            let pause = self
                .config
                .connect_retry_interval
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::time::sleep(pause).await;
        }
    }

    fn is_target(&self, peripheral: &PeripheralDescriptor, address: Option<&str>) -> bool {
        match address {
            Some(address) => peripheral.address.eq_ignore_ascii_case(address),
            None => peripheral
                .name
                .as_deref()
                .map(|name| self.config.advertised_names.iter().any(|n| n == name))
                .unwrap_or(false),
        }
    }

    /// Connect to `address`, retrying failed attempts until `timeout`.
    /// A previous link is disconnected first. The new link starts
    /// unauthorized.
    pub async fn connect(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<ConnectionProfile, F1Error> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.current().is_some() {
            log::info!("replacing the current link before connecting to {}", address);
            self.teardown().await?;
        }

        let link = self.establish(address, timeout).await?;
        let addresses = AddressMap::resolve(&link.characteristics());
        log::debug!(
            "{} of the known characteristics found on {}",
            addresses.resolved_count(),
            address
        );

        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&link),
            addresses,
            DispatchSettings::from(&self.config),
        ));
        let notifications = NotificationMultiplexer::new(Arc::clone(&dispatcher));
        let watcher = spawn_link_watcher(&link, Arc::clone(&dispatcher), notifications.clone());
        let name = self
            .seen_names
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(address)
            .cloned();
        let session = Arc::new(Session {
            dispatcher,
            notifications,
            auth: Mutex::new(KeyStateMachine::new()),
            watcher,
            profile: ConnectionProfile::new(address, name),
        });

        if self.config.ping_on_connect {
            if let Err(e) = Self::ping_session(&session).await {
                log::warn!("{} did not answer the connection ping: {}", address, e);
                if let Err(close) = link.disconnect().await {
                    log::warn!("failed to close the link to {}: {}", address, close);
                }
                return Err(e);
            }
        }

        let profile = session.profile.clone();
        *self
            .session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(session);
        log::info!("connected to {}", address);
        Ok(profile)
    }

    async fn establish(&self, address: &str, timeout: Duration) -> Result<Arc<dyn GattLink>, F1Error> {
        let deadline = Instant::now() + timeout;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let last_error = match tokio::time::timeout(
                remaining,
                self.central.connect(address, remaining),
            )
            .await
            {
                Ok(Ok(link)) => return Ok(link),
                Ok(Err(e)) => e,
                Err(_) => BleError::Timeout,
            };
            log::debug!("connection attempt {} to {} failed: {}", attempt, address, last_error);

            if Instant::now() + self.config.connect_retry_interval >= deadline {
                log::warn!("giving up on {} after {} attempts", address, attempt);
                return Err(match last_error {
                    BleError::Timeout => F1Error::Timeout {
                        operation: format!("connect to {}", address),
                        timeout,
                    },
                    other => other.into(),
                });
            }
            tokio::time::sleep(self.config.connect_retry_interval).await;
        }
    }

    /// Reconnect to a saved device.
    pub async fn connect_profile(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<ConnectionProfile, F1Error> {
        if let Some(name) = &profile.name {
            self.seen_names
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(profile.address.clone(), name.clone());
        }
        self.connect(&profile.address, self.config.connect_timeout).await
    }

    /// Cancel every subscription, then tear the link down. A no-op when
    /// not connected.
    pub async fn disconnect(&self) -> Result<(), F1Error> {
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown().await
    }

    async fn teardown(&self) -> Result<(), F1Error> {
        let Some(session) = self.take_session() else {
            log::debug!("disconnect requested while not connected");
            return Ok(());
        };
        session.watcher.abort();
        if let Err(e) = session.notifications.cancel_all().await {
            log::warn!("failed to cancel notifications cleanly: {}", e);
        }
        let link = Arc::clone(session.dispatcher.link());
        let result = link.disconnect().await;
        session.dispatcher.mark_lost();
        session.notifications.close();
        log::info!("disconnected from {}", session.profile.address);
        result.map_err(F1Error::from)
    }

    /// Power the device off and disconnect.
    pub async fn shutdown(&self) -> Result<(), F1Error> {
        let session = self.session()?;
        self.authorize(&session, Feature::Shutdown).await?;
        if let Err(e) = session.notifications.cancel_all().await {
            log::warn!("failed to cancel notifications before shutdown: {}", e);
        }
        match session.dispatcher.write(Feature::Shutdown, &FeatureValue::Trigger).await {
            // The device may drop the link before acknowledging.
            Ok(()) | Err(F1Error::LinkLost) => {}
            Err(e) => return Err(e),
        }
        log::info!("shutdown sent to {}", session.profile.address);
        drop(session);
        self.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.current()
            .map(|s| s.dispatcher.is_alive())
            .unwrap_or(false)
    }

    /// Saved-profile view of the current link.
    pub fn connection_profile(&self) -> Option<ConnectionProfile> {
        self.current().map(|s| s.profile.clone())
    }

    pub fn authorization_state(&self) -> AuthorizationState {
        self.current()
            .map(|s| s.auth().state())
            .unwrap_or(AuthorizationState::Unauthorized)
    }

    // ---- authorization ----

    /// Read the key state. A `silent` call returns the last observed value
    /// without a transport read, once a live read has happened.
    pub async fn get_key_state(&self, silent: bool) -> Result<bool, F1Error> {
        let session = self.session()?;
        Self::key_state(&session, silent).await
    }

    async fn key_state(session: &Session, silent: bool) -> Result<bool, F1Error> {
        if silent {
            if let Some(cached) = session.auth().cached() {
                log::trace!("key state (cached): {}", cached);
                return Ok(cached);
            }
        }
        let key_state: bool = if silent {
            session.dispatcher.read_as_quiet(Feature::KeyState).await?
        } else {
            session.dispatcher.read_as(Feature::KeyState).await?
        };
        session.auth().observe(key_state);
        Ok(key_state)
    }

    /// Connected and the device has granted control.
    pub async fn is_authorized(&self) -> Result<bool, F1Error> {
        let Some(session) = self.current() else {
            return Ok(false);
        };
        if !session.dispatcher.is_alive() {
            return Ok(false);
        }
        if session.auth().is_authorized() {
            return Ok(true);
        }
        Self::key_state(&session, true).await
    }

    pub fn enable_key_state_check(&self) {
        self.key_state_check.store(true, Ordering::SeqCst);
    }

    pub fn disable_key_state_check(&self) {
        log::warn!("key state check disabled; privileged commands are no longer gated");
        self.key_state_check.store(false, Ordering::SeqCst);
    }

    async fn authorize(&self, session: &Session, feature: Feature) -> Result<(), F1Error> {
        let descriptor = feature.descriptor();
        let enforce = self.key_state_check.load(Ordering::SeqCst);
        if descriptor.privileged && enforce {
            let needs_first_look = {
                let auth = session.auth();
                !auth.is_authorized() && auth.cached().is_none()
            };
            if needs_first_look {
                Self::key_state(session, true).await?;
            }
        }
        session.auth().check(descriptor, enforce)
    }

    // ---- generic access ----

    async fn read<T: FromFeatureValue>(&self, feature: Feature) -> Result<T, F1Error> {
        feature.descriptor().require(Operation::Read)?;
        let session = self.session()?;
        self.authorize(&session, feature).await?;
        session.dispatcher.read_as(feature).await
    }

    async fn write(&self, feature: Feature, value: FeatureValue) -> Result<(), F1Error> {
        feature.descriptor().require(Operation::Write)?;
        let session = self.session()?;
        let payload = codec::encode(feature, &value)?;
        self.authorize(&session, feature).await?;
        session.dispatcher.write_raw(feature, payload).await
    }

    /// Read any feature by its registry name.
    pub async fn read_by_name(&self, name: &str) -> Result<FeatureValue, F1Error> {
        let feature = lookup_name(name)?.feature;
        self.read(feature).await
    }

    /// Write any feature by its registry name.
    pub async fn write_by_name(&self, name: &str, value: FeatureValue) -> Result<(), F1Error> {
        let feature = lookup_name(name)?.feature;
        self.write(feature, value).await
    }

    // ---- identity ----

    pub async fn get_manufacturer_name(&self) -> Result<String, F1Error> {
        self.read(Feature::ManufacturerName).await
    }

    pub async fn get_model_number(&self) -> Result<String, F1Error> {
        self.read(Feature::ModelNumber).await
    }

    pub async fn get_hardware_revision(&self) -> Result<String, F1Error> {
        self.read(Feature::HardwareRevision).await
    }

    pub async fn get_firmware_revision(&self) -> Result<String, F1Error> {
        self.read(Feature::FirmwareRevision).await
    }

    pub async fn get_software_revision(&self) -> Result<String, F1Error> {
        self.read(Feature::SoftwareRevision).await
    }

    pub async fn get_serial_number_string(&self) -> Result<String, F1Error> {
        self.read(Feature::SerialNumberString).await
    }

    pub async fn get_device_name(&self) -> Result<String, F1Error> {
        self.read(Feature::DeviceName).await
    }

    pub async fn get_mac_address(&self) -> Result<String, F1Error> {
        self.read(Feature::MacAddress).await
    }

    pub async fn get_serial_number(&self) -> Result<String, F1Error> {
        self.read(Feature::SerialNumber).await
    }

    pub async fn get_chip_id(&self) -> Result<String, F1Error> {
        self.read(Feature::ChipId).await
    }

    pub async fn get_system_id(&self) -> Result<String, F1Error> {
        self.read(Feature::SystemId).await
    }

    pub async fn get_ieee_11073(&self) -> Result<String, F1Error> {
        self.read(Feature::Ieee11073).await
    }

    pub async fn get_pnp_id(&self) -> Result<String, F1Error> {
        self.read(Feature::PnpId).await
    }

    pub async fn get_appearance(&self) -> Result<String, F1Error> {
        self.read(Feature::Appearance).await
    }

    pub async fn get_connection_parameters(&self) -> Result<String, F1Error> {
        self.read(Feature::ConnectionParameters).await
    }

    // ---- sensors ----

    /// Battery charge, 0..=100.
    pub async fn get_battery_level(&self) -> Result<u8, F1Error> {
        self.read(Feature::BatteryLevel).await
    }

    pub async fn get_temperature_and_pressure(&self) -> Result<TemperaturePressure, F1Error> {
        self.read(Feature::TemperaturePressure).await
    }

    /// Internal temperature in °C.
    pub async fn get_temperature(&self) -> Result<f64, F1Error> {
        Ok(self.get_temperature_and_pressure().await?.temperature)
    }

    /// Pressure in mbar.
    pub async fn get_pressure(&self) -> Result<f64, F1Error> {
        Ok(self.get_temperature_and_pressure().await?.pressure)
    }

    pub async fn get_accelerometer(&self) -> Result<Accelerometer, F1Error> {
        self.read(Feature::Accelerometer).await
    }

    pub async fn get_accelerometer_x(&self) -> Result<u16, F1Error> {
        Ok(self.get_accelerometer().await?.x)
    }

    pub async fn get_accelerometer_y(&self) -> Result<u16, F1Error> {
        Ok(self.get_accelerometer().await?.y)
    }

    pub async fn get_accelerometer_z(&self) -> Result<u16, F1Error> {
        Ok(self.get_accelerometer().await?.z)
    }

    /// Insertion depth, 0..=8.
    pub async fn get_depth(&self) -> Result<u16, F1Error> {
        self.read(Feature::Depth).await
    }

    pub async fn get_rotation_speed(&self) -> Result<u16, F1Error> {
        self.read(Feature::RotationSpeed).await
    }

    pub async fn get_use_count(&self) -> Result<u16, F1Error> {
        self.read(Feature::UseCount).await
    }

    pub async fn get_buttons_status(&self) -> Result<ButtonState, F1Error> {
        self.read(Feature::Buttons).await
    }

    // ---- settings ----

    pub async fn get_wake_up(&self) -> Result<bool, F1Error> {
        self.read(Feature::WakeUp).await
    }

    /// Wake the device on a quick motion.
    pub async fn enable_wake_up(&self) -> Result<(), F1Error> {
        self.write(Feature::WakeUp, FeatureValue::Flag(true)).await
    }

    pub async fn disable_wake_up(&self) -> Result<(), F1Error> {
        self.write(Feature::WakeUp, FeatureValue::Flag(false)).await
    }

    pub async fn get_vibration_setting(&self) -> Result<[u8; 8], F1Error> {
        self.read(Feature::VibrationSetting).await
    }

    pub async fn set_vibration_setting(&self, levels: [u8; 8]) -> Result<(), F1Error> {
        self.write(Feature::VibrationSetting, FeatureValue::VibrationPattern(levels))
            .await
    }

    pub async fn get_cruise_control(&self) -> Result<bool, F1Error> {
        self.read(Feature::CruiseControl).await
    }

    /// Turn cruise control on; with `reset`, motor speeds go back to
    /// their defaults.
    pub async fn enable_cruise_control(&self, reset: bool) -> Result<(), F1Error> {
        let mode = if reset {
            CruiseControl::EnableAndReset
        } else {
            CruiseControl::Enabled
        };
        self.write(Feature::CruiseControl, FeatureValue::CruiseControl(mode))
            .await
    }

    pub async fn disable_cruise_control(&self) -> Result<(), F1Error> {
        self.write(
            Feature::CruiseControl,
            FeatureValue::CruiseControl(CruiseControl::Disabled),
        )
        .await
    }

    // ---- motors ----

    pub async fn get_motors_speed(&self) -> Result<MotorSpeeds, F1Error> {
        self.read(Feature::MotorSpeed).await
    }

    pub async fn get_main_motor_speed(&self) -> Result<u8, F1Error> {
        Ok(self.get_motors_speed().await?.main)
    }

    pub async fn get_vibration_speed(&self) -> Result<u8, F1Error> {
        Ok(self.get_motors_speed().await?.vibration)
    }

    pub async fn set_motors_speed(&self, main: u8, vibration: u8) -> Result<(), F1Error> {
        self.write(
            Feature::MotorSpeed,
            FeatureValue::MotorSpeeds(MotorSpeeds { main, vibration }),
        )
        .await
    }

    /// Set the main motor, keeping the vibration motor where it is.
    pub async fn set_main_motor_speed(&self, speed: u8) -> Result<(), F1Error> {
        check_percent(Feature::MotorSpeed, speed)?;
        let current = self.get_motors_speed().await?;
        self.set_motors_speed(speed, current.vibration).await
    }

    /// Set the vibration motor, keeping the main motor where it is.
    pub async fn set_vibration_speed(&self, speed: u8) -> Result<(), F1Error> {
        check_percent(Feature::MotorSpeed, speed)?;
        let current = self.get_motors_speed().await?;
        self.set_motors_speed(current.main, speed).await
    }

    pub async fn stop_motors(&self) -> Result<(), F1Error> {
        self.write(Feature::MotorStop, FeatureValue::Trigger).await
    }

    // ---- commands ----

    /// Start the accelerometer self-test.
    pub async fn verify_accelerometer(&self) -> Result<(), F1Error> {
        self.write(Feature::VerifyAccelerometer, FeatureValue::Trigger)
            .await
    }

    pub async fn reset_use_count(&self) -> Result<(), F1Error> {
        self.write(Feature::UseCountReset, FeatureValue::Trigger).await
    }

    /// Check that the device still answers.
    pub async fn ping(&self) -> Result<(), F1Error> {
        let session = self.session()?;
        Self::ping_session(&session).await
    }

    async fn ping_session(session: &Session) -> Result<(), F1Error> {
        let model: String = session.dispatcher.read_as(Feature::ModelNumber).await?;
        log::debug!("ping answered by model {}", model);
        Ok(())
    }

    // ---- notifications ----

    /// Subscribe to any notifying feature. Subscriptions need a link, not
    /// authorization.
    pub async fn subscribe<T, F>(
        &self,
        feature: Feature,
        distinct_until_changed: bool,
        listener: F,
    ) -> Result<Subscription, F1Error>
    where
        T: FromFeatureValue,
        F: FnMut(T) + Send + 'static,
    {
        let session = self.session()?;
        session
            .notifications
            .subscribe(feature, distinct_until_changed, listener)
            .await
    }

    /// Cancel a subscription made on this client. Idempotent.
    pub async fn unregister(&self, subscription: &Subscription) -> Result<(), F1Error> {
        subscription.cancel().await
    }

    pub async fn notify_key_state<F>(&self, distinct: bool, listener: F) -> Result<Subscription, F1Error>
    where
        F: FnMut(bool) + Send + 'static,
    {
        self.subscribe::<bool, F>(Feature::KeyState, distinct, listener).await
    }

    pub async fn notify_buttons<F>(&self, distinct: bool, listener: F) -> Result<Subscription, F1Error>
    where
        F: FnMut(ButtonState) + Send + 'static,
    {
        self.subscribe::<ButtonState, F>(Feature::Buttons, distinct, listener).await
    }

    pub async fn notify_rotation_speed<F>(
        &self,
        distinct: bool,
        listener: F,
    ) -> Result<Subscription, F1Error>
    where
        F: FnMut(u16) + Send + 'static,
    {
        self.subscribe::<u16, F>(Feature::RotationSpeed, distinct, listener).await
    }

    pub async fn notify_depth<F>(&self, distinct: bool, listener: F) -> Result<Subscription, F1Error>
    where
        F: FnMut(u16) + Send + 'static,
    {
        self.subscribe::<u16, F>(Feature::Depth, distinct, listener).await
    }

    pub async fn notify_accelerometer<F>(
        &self,
        distinct: bool,
        listener: F,
    ) -> Result<Subscription, F1Error>
    where
        F: FnMut(Accelerometer) + Send + 'static,
    {
        self.subscribe::<Accelerometer, F>(Feature::Accelerometer, distinct, listener).await
    }

    pub async fn notify_temperature_and_pressure<F>(
        &self,
        distinct: bool,
        listener: F,
    ) -> Result<Subscription, F1Error>
    where
        F: FnMut(TemperaturePressure) + Send + 'static,
    {
        self.subscribe::<TemperaturePressure, F>(Feature::TemperaturePressure, distinct, listener)
            .await
    }
}

fn check_percent(feature: Feature, value: u8) -> Result<(), F1Error> {
    if value > 100 {
        return Err(F1Error::OutOfRange {
            feature,
            value: value as u32,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::simulated::{SimCentral, SimulatedF1};

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    async fn connected_client() -> (SimulatedF1, F1Client) {
        let device = SimulatedF1::new(ADDRESS);
        let central = Arc::new(SimCentral::with_devices(vec![device.clone()]));
        let client = F1Client::new(central, ClientConfig::default());
        client.connect(ADDRESS, Duration::from_secs(1)).await.unwrap();
        (device, client)
    }

    #[tokio::test]
    async fn test_connect_pings_and_starts_unauthorized() {
        let (device, client) = connected_client().await;
        assert!(client.is_connected());
        assert_eq!(device.read_count(0x2a24), 1);
        assert_eq!(client.authorization_state(), AuthorizationState::Unauthorized);
        assert_eq!(
            client.connection_profile().map(|p| p.address),
            Some(ADDRESS.to_string())
        );
    }

    #[tokio::test]
    async fn test_open_reads_need_no_authorization() {
        let (_device, client) = connected_client().await;
        assert_eq!(client.get_battery_level().await.unwrap(), 87);
        assert_eq!(client.get_manufacturer_name().await.unwrap(), "LELO");
        assert_eq!(client.get_mac_address().await.unwrap(), "C4:64:E3:00:45:5B");
        assert_eq!(client.get_device_name().await.unwrap(), "F1s");
    }

    #[tokio::test]
    async fn test_privileged_read_is_gated() {
        let (device, client) = connected_client().await;
        assert_eq!(client.get_depth().await, Err(F1Error::NotAuthorized));
        // The gate looked at the key state once, live.
        assert_eq!(device.read_count(0x0a0f), 1);
        assert_eq!(device.read_count(0x0a0b), 0);

        device.press_central_button();
        assert!(client.get_key_state(false).await.unwrap());
        assert_eq!(client.get_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_disabled_key_state_check_skips_gate() {
        let (_device, client) = connected_client().await;
        client.disable_key_state_check();
        assert!(client.get_use_count().await.is_ok());
        client.enable_key_state_check();
        assert_eq!(client.get_use_count().await, Err(F1Error::NotAuthorized));
    }

    #[tokio::test]
    async fn test_unknown_name_is_rejected() {
        let (_device, client) = connected_client().await;
        assert!(matches!(
            client.read_by_name("turbo").await,
            Err(F1Error::UnknownFeature(_))
        ));
        assert_eq!(
            client.read_by_name("battery_level").await.unwrap(),
            FeatureValue::Percent(87)
        );
    }

    #[tokio::test]
    async fn test_write_to_read_only_feature_is_access_denied() {
        let (device, client) = connected_client().await;
        for (name, value) in [
            ("model_number", FeatureValue::Text("F2".into())),
            ("key_state", FeatureValue::Flag(true)),
            ("depth", FeatureValue::Count(3)),
        ] {
            let err = client.write_by_name(name, value).await.unwrap_err();
            assert!(
                matches!(err, F1Error::AccessDenied { operation: Operation::Write, .. }),
                "{}: {:?}",
                name,
                err
            );
        }
        assert_eq!(device.write_count(), 0);
        // Rejected before the authorization gate looked at the key state.
        assert_eq!(device.read_count(0x0a0f), 0);
    }

    #[tokio::test]
    async fn test_notifications_need_no_authorization() {
        let (device, client) = connected_client().await;
        let sub = client.notify_depth(false, |_: u16| {}).await.unwrap();
        assert!(sub.is_active());
        assert_eq!(device.subscribe_count(), 1);
        assert_eq!(device.read_count(0x0a0f), 0);
        assert_eq!(client.authorization_state(), AuthorizationState::Unauthorized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_ping_closes_the_link() {
        let device = SimulatedF1::new(ADDRESS);
        let central = Arc::new(SimCentral::with_devices(vec![device.clone()]));
        let client = F1Client::new(central, ClientConfig::default());
        device.set_unresponsive(true);

        let err = client.connect(ADDRESS, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, F1Error::Timeout { .. }));
        assert!(!device.is_connected());
        assert!(!client.is_connected());
        assert_eq!(client.connection_profile(), None);
    }

    /// A central whose scans answer at once with nothing.
    #[derive(Default)]
    struct EmptyCentral {
        scans: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl GattCentral for EmptyCentral {
        async fn scan(
            &self,
            _filter: &ScanFilter,
            _timeout: Duration,
        ) -> Result<Vec<PeripheralDescriptor>, BleError> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        async fn connect(
            &self,
            address: &str,
            _timeout: Duration,
        ) -> Result<Arc<dyn GattLink>, BleError> {
            Err(BleError::ConnectionError(format!("No peripheral at {}", address)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_pauses_between_empty_scans() {
        let central = Arc::new(EmptyCentral::default());
        let client = F1Client::new(central.clone(), ClientConfig::default());

        let found = client.discover(Duration::from_secs(1), None).await.unwrap();
        assert!(found.is_empty());
        // One scan per retry interval (250 ms), not a hot loop.
        let scans = central.scans.load(Ordering::SeqCst);
        assert!((4..=5).contains(&scans), "{} scans", scans);
    }

    #[tokio::test]
    async fn test_calls_without_link_fail_not_connected() {
        let central = Arc::new(SimCentral::new());
        let client = F1Client::new(central, ClientConfig::default());
        assert_eq!(client.get_battery_level().await, Err(F1Error::NotConnected));
        assert!(!client.is_authorized().await.unwrap());
        // Disconnecting an idle client is harmless.
        client.disconnect().await.unwrap();
    }
}
