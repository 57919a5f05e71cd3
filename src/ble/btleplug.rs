//! btleplug-backed transport for real hardware
//!
//! Uses the first Bluetooth adapter the platform reports. Addresses are
//! btleplug peripheral ids (a MAC on Linux, a platform UUID on macOS and
//! Windows); the MAC is accepted too where the platform exposes it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ::btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _,
    ScanFilter as BtScanFilter, WriteType,
};
use ::btleplug::platform::{Adapter, Manager, Peripheral};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::transport::{
    GattCentral, GattLink, LinkEvent, NotifyCallback, PeripheralDescriptor, ScanFilter,
    TransportSubscription,
};
use super::BleError;

fn map_err(err: ::btleplug::Error) -> BleError {
    match err {
        ::btleplug::Error::NotConnected => BleError::Disconnected,
        ::btleplug::Error::TimedOut(_) => BleError::Timeout,
        ::btleplug::Error::DeviceNotFound => BleError::ConnectionError(err.to_string()),
        ::btleplug::Error::PermissionDenied => BleError::AdapterError(err.to_string()),
        other => BleError::GattError(other.to_string()),
    }
}

pub struct BtleplugCentral {
    adapter: Adapter,
}

impl BtleplugCentral {
    pub async fn new() -> Result<Self, BleError> {
        let manager = Manager::new().await.map_err(map_err)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(map_err)?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::AdapterError("no Bluetooth adapter found".into()))?;
        if let Ok(info) = adapter.adapter_info().await {
            log::info!("using Bluetooth adapter {}", info);
        }
        Ok(Self { adapter })
    }

    async fn find(&self, address: &str) -> Result<Peripheral, BleError> {
        for peripheral in self.adapter.peripherals().await.map_err(map_err)? {
            if peripheral.id().to_string().eq_ignore_ascii_case(address)
                || peripheral.address().to_string().eq_ignore_ascii_case(address)
            {
                return Ok(peripheral);
            }
        }
        Err(BleError::ConnectionError(format!(
            "{} has not been seen by the adapter; scan first",
            address
        )))
    }
}

#[async_trait]
impl GattCentral for BtleplugCentral {
    async fn scan(
        &self,
        filter: &ScanFilter,
        timeout: Duration,
    ) -> Result<Vec<PeripheralDescriptor>, BleError> {
        self.adapter
            .start_scan(BtScanFilter {
                services: filter.services.clone(),
            })
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))?;
        tokio::time::sleep(timeout).await;
        let peripherals = self.adapter.peripherals().await;
        if let Err(e) = self.adapter.stop_scan().await {
            log::debug!("failed to stop scan cleanly: {}", e);
        }

        let mut found = Vec::new();
        for peripheral in peripherals.map_err(|e| BleError::ScanError(e.to_string()))? {
            let properties = peripheral.properties().await.map_err(map_err)?;
            found.push(PeripheralDescriptor {
                address: peripheral.id().to_string(),
                name: properties.as_ref().and_then(|p| p.local_name.clone()),
                rssi: properties.and_then(|p| p.rssi),
            });
        }
        Ok(found)
    }

    async fn connect(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn GattLink>, BleError> {
        let peripheral = self.find(address).await?;
        tokio::time::timeout(timeout, async {
            if !peripheral.is_connected().await? {
                peripheral.connect().await?;
            }
            peripheral.discover_services().await
        })
        .await
        .map_err(|_| BleError::Timeout)?
        .map_err(map_err)?;

        let link = BtleplugLink::start(self.adapter.clone(), peripheral, address).await?;
        Ok(Arc::new(link))
    }
}

type Routes = HashMap<u64, (Uuid, NotifyCallback)>;

pub struct BtleplugLink {
    address: String,
    peripheral: Peripheral,
    characteristics: Vec<Characteristic>,
    routes: Arc<Mutex<Routes>>,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    events: broadcast::Sender<LinkEvent>,
    tasks: Vec<JoinHandle<()>>,
}

fn lock_routes(routes: &Mutex<Routes>) -> MutexGuard<'_, Routes> {
    routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lost(connected: &AtomicBool, events: &broadcast::Sender<LinkEvent>) {
    if connected.swap(false, Ordering::SeqCst) {
        let _ = events.send(LinkEvent::Disconnected);
    }
}

impl BtleplugLink {
    async fn start(adapter: Adapter, peripheral: Peripheral, address: &str) -> Result<Self, BleError> {
        let characteristics: Vec<Characteristic> =
            peripheral.characteristics().into_iter().collect();
        let routes: Arc<Mutex<Routes>> = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let (events, _) = broadcast::channel(16);

        // Route every notification to the callbacks registered for its
        // characteristic. The stream ends when the peripheral goes away.
        let mut notifications = peripheral.notifications().await.map_err(map_err)?;
        let pump = {
            let routes = Arc::clone(&routes);
            let connected = Arc::clone(&connected);
            let events = events.clone();
            tokio::spawn(async move {
                while let Some(notification) = notifications.next().await {
                    let callbacks: Vec<NotifyCallback> = lock_routes(&routes)
                        .values()
                        .filter(|(uuid, _)| *uuid == notification.uuid)
                        .map(|(_, callback)| Arc::clone(callback))
                        .collect();
                    for callback in callbacks {
                        callback(&notification.value);
                    }
                }
                lost(&connected, &events);
            })
        };

        let watcher = {
            let connected = Arc::clone(&connected);
            let events = events.clone();
            let id = peripheral.id();
            tokio::spawn(async move {
                let mut adapter_events = match adapter.events().await {
                    Ok(stream) => stream,
                    Err(e) => {
                        log::warn!("could not watch adapter events: {}", e);
                        return;
                    }
                };
                while let Some(event) = adapter_events.next().await {
                    if let CentralEvent::DeviceDisconnected(gone) = event {
                        if gone == id {
                            log::info!("adapter reports {:?} disconnected", gone);
                            lost(&connected, &events);
                            break;
                        }
                    }
                }
            })
        };

        log::debug!(
            "{} exposes {} characteristics",
            address,
            characteristics.len()
        );
        Ok(Self {
            address: address.to_string(),
            peripheral,
            characteristics,
            routes,
            next_id: AtomicU64::new(1),
            connected,
            events,
            tasks: vec![pump, watcher],
        })
    }

    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic, BleError> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .ok_or(BleError::CharacteristicNotFound(uuid))
    }

    fn check_connected(&self) -> Result<(), BleError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BleError::Disconnected)
        }
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl GattLink for BtleplugLink {
    fn address(&self) -> &str {
        &self.address
    }

    fn characteristics(&self) -> Vec<Uuid> {
        self.characteristics.iter().map(|c| c.uuid).collect()
    }

    async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>, BleError> {
        self.check_connected()?;
        let characteristic = self.characteristic(uuid)?;
        self.peripheral.read(characteristic).await.map_err(map_err)
    }

    async fn write_characteristic(
        &self,
        uuid: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), BleError> {
        self.check_connected()?;
        let characteristic = self.characteristic(uuid)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(characteristic, data, write_type)
            .await
            .map_err(map_err)
    }

    async fn subscribe(
        &self,
        uuid: Uuid,
        on_value: NotifyCallback,
    ) -> Result<TransportSubscription, BleError> {
        self.check_connected()?;
        let characteristic = self.characteristic(uuid)?;
        let first = !lock_routes(&self.routes).values().any(|(c, _)| *c == uuid);
        if first {
            self.peripheral.subscribe(characteristic).await.map_err(map_err)?;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock_routes(&self.routes).insert(id, (uuid, on_value));
        Ok(TransportSubscription {
            id,
            characteristic: uuid,
        })
    }

    async fn unsubscribe(&self, subscription: TransportSubscription) -> Result<(), BleError> {
        let uuid = subscription.characteristic;
        let last = {
            let mut routes = lock_routes(&self.routes);
            routes.remove(&subscription.id);
            !routes.values().any(|(c, _)| *c == uuid)
        };
        if last {
            self.check_connected()?;
            let characteristic = self.characteristic(uuid)?;
            self.peripheral
                .unsubscribe(characteristic)
                .await
                .map_err(map_err)?;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.connected.store(false, Ordering::SeqCst);
        lock_routes(&self.routes).clear();
        self.peripheral.disconnect().await.map_err(map_err)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        assert_eq!(map_err(::btleplug::Error::NotConnected), BleError::Disconnected);
        assert_eq!(
            map_err(::btleplug::Error::TimedOut(Duration::from_secs(1))),
            BleError::Timeout
        );
        assert!(matches!(
            map_err(::btleplug::Error::DeviceNotFound),
            BleError::ConnectionError(_)
        ));
        assert!(matches!(
            map_err(::btleplug::Error::NotSupported("indicate".into())),
            BleError::GattError(_)
        ));
    }
}
