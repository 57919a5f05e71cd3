//! F1s GATT protocol: where each feature lives and how its bytes read.

pub mod codec;
pub mod registry;

pub use codec::{
    Accelerometer, ButtonState, Codec, CruiseControl, FeatureValue, FromFeatureValue, MotorSpeeds,
    TemperaturePressure,
};
pub use registry::{
    AccessMode, AddressMap, CharacteristicDescriptor, Feature, Operation, Service,
};
