//! Client-level error taxonomy
//!
//! Codec and registry errors are programming errors; `Timeout` and `Busy`
//! are recoverable by retrying; `LinkLost` is terminal for the link it
//! happened on.

use std::time::Duration;

use thiserror::Error;

use crate::ble::BleError;
use crate::protocol::registry::{Feature, Operation};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum F1Error {
    #[error("Unknown feature: {0}")]
    UnknownFeature(String),

    #[error("Feature {feature} does not support {operation}")]
    AccessDenied { feature: Feature, operation: Operation },

    #[error("Client is not authorized (key state is off); press the central button to proceed")]
    NotAuthorized,

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Link busy: {0} commands already queued")]
    Busy(usize),

    #[error("Link to the device was lost")]
    LinkLost,

    #[error("Client is not connected")]
    NotConnected,

    #[error("Malformed payload for {feature}: {reason}")]
    MalformedPayload { feature: Feature, reason: String },

    #[error("Value {value} for {feature} is outside 0..=100")]
    OutOfRange { feature: Feature, value: u32 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Transport error: {0}")]
    Transport(BleError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl F1Error {
    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, F1Error::Timeout { .. } | F1Error::Busy(_))
    }

    /// Whether the link this error came from is gone for good.
    pub fn is_link_lost(&self) -> bool {
        matches!(self, F1Error::LinkLost)
    }
}

impl From<BleError> for F1Error {
    fn from(err: BleError) -> Self {
        match err {
            BleError::Disconnected => F1Error::LinkLost,
            other => F1Error::Transport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_maps_to_link_lost() {
        assert_eq!(F1Error::from(BleError::Disconnected), F1Error::LinkLost);
        assert!(matches!(
            F1Error::from(BleError::GattError("err 2".into())),
            F1Error::Transport(BleError::GattError(_))
        ));
    }

    #[test]
    fn test_retryable_classification() {
        let timeout = F1Error::Timeout {
            operation: "read battery_level".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_retryable());
        assert!(F1Error::Busy(4).is_retryable());
        assert!(!F1Error::LinkLost.is_retryable());
        assert!(!F1Error::NotAuthorized.is_retryable());
        assert!(F1Error::LinkLost.is_link_lost());
    }
}
