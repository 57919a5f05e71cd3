// lelo-f1 - async BLE protocol client for the LELO F1s

pub mod ble;
pub mod client;
pub mod config;
pub mod error;
pub mod profile;
pub mod protocol;

pub use client::{AuthorizationState, F1Client, Subscription};
pub use config::ClientConfig;
pub use error::F1Error;
pub use profile::{ConnectionProfile, ProfileStore};
pub use protocol::{
    Accelerometer, ButtonState, CruiseControl, Feature, FeatureValue, MotorSpeeds,
    TemperaturePressure,
};
