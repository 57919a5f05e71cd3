//! BLE transport layer for the F1s client
//!
//! Provides the GATT capability traits the client drives, a simulated
//! F1s peripheral for testing, and (behind `ble-central`) a btleplug
//! backend for real hardware.

#[cfg(feature = "ble-central")]
pub mod btleplug;
pub mod simulated;
pub mod transport;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Adapter error: {0}")]
    AdapterError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("GATT error: {0}")]
    GattError(String),

    #[error("Characteristic {0} not found on peripheral")]
    CharacteristicNotFound(uuid::Uuid),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,
}
