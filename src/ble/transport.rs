//! BLE transport trait definitions and core types
//!
//! Defines the GATT capability the client consumes. Both the simulated
//! peripheral and the btleplug backend conform to it; the client never
//! talks to a radio stack directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::BleError;

/// A device seen during discovery. Immutable snapshot of one advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralDescriptor {
    /// Transport-specific address.
    /// • Linux: a Bluetooth MAC address (`AA:BB:CC:DD:EE:FF`)
    /// • macOS / Windows: a platform UUID string
    pub address: String,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Received signal strength indicator (if available).
    pub rssi: Option<i16>,
}

/// Restricts a scan to peripherals advertising any of the given services.
/// An empty filter accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub services: Vec<Uuid>,
}

/// Callback invoked by the transport with the raw bytes of each notification.
pub type NotifyCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Handle for one transport-level notify registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportSubscription {
    pub id: u64,
    pub characteristic: Uuid,
}

/// Out-of-band events about a link's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The peripheral dropped the connection (or powered off).
    Disconnected,
}

/// An established GATT connection to one peripheral.
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Address of the connected peripheral.
    fn address(&self) -> &str;

    /// Characteristic UUIDs discovered on the peripheral.
    fn characteristics(&self) -> Vec<Uuid>;

    /// Read the current value of a characteristic.
    async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>, BleError>;

    /// Write a value to a characteristic.
    async fn write_characteristic(
        &self,
        uuid: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), BleError>;

    /// Enable notifications on a characteristic. `on_value` runs on the
    /// transport's own context for every notification until unsubscribed.
    async fn subscribe(
        &self,
        uuid: Uuid,
        on_value: NotifyCallback,
    ) -> Result<TransportSubscription, BleError>;

    /// Disable a notify registration made with [`GattLink::subscribe`].
    async fn unsubscribe(&self, subscription: TransportSubscription) -> Result<(), BleError>;

    /// Tear down the connection.
    async fn disconnect(&self) -> Result<(), BleError>;

    /// Check whether the connection is still active.
    fn is_connected(&self) -> bool;

    /// Subscribe to link lifetime events.
    fn link_events(&self) -> broadcast::Receiver<LinkEvent>;
}

/// BLE central role: discovering and connecting to peripherals.
#[async_trait]
pub trait GattCentral: Send + Sync {
    /// Scan for up to `timeout` and return every peripheral seen.
    async fn scan(
        &self,
        filter: &ScanFilter,
        timeout: Duration,
    ) -> Result<Vec<PeripheralDescriptor>, BleError>;

    /// Connect to the peripheral at `address` and discover its services.
    async fn connect(&self, address: &str, timeout: Duration)
        -> Result<Arc<dyn GattLink>, BleError>;
}
