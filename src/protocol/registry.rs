//! Characteristic registry
//!
//! Static table mapping every logical feature of the F1s to its GATT
//! address, access mode, codec and authorization requirement. The
//! dispatcher and the notification multiplexer stay generic over this
//! table; adding a feature is a table edit.
//!
//! Characteristics are listed by their 16-bit short id. The firmware
//! exposes vendor characteristics under its own 128-bit base, so the
//! concrete UUIDs are resolved per link from what the peripheral
//! advertises (see [`AddressMap::resolve`]).

use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::codec::Codec;
use crate::error::F1Error;

/// Bluetooth SIG base UUID (`00000000-0000-1000-8000-00805f9b34fb`).
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit short id onto the Bluetooth base UUID.
pub const fn base_uuid(short_id: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short_id as u128) << 96))
}

/// Leading 32 bits of a UUID, where short ids live.
fn short_id_of(uuid: &Uuid) -> u32 {
    (uuid.as_u128() >> 96) as u32
}

/// GATT services exposed by the F1s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Service {
    GenericAccess,
    DeviceInformation,
    Battery,
    Vendor,
}

impl Service {
    pub const fn short_id(self) -> u16 {
        match self {
            Service::GenericAccess => 0x1800,
            Service::DeviceInformation => 0x180a,
            Service::Battery => 0x180f,
            Service::Vendor => 0xfff0,
        }
    }

    pub const fn uuid(self) -> Uuid {
        base_uuid(self.short_id())
    }
}

/// The kind of access an operation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Read,
    Write,
    Notify,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Read => write!(f, "read"),
            Operation::Write => write!(f, "write"),
            Operation::Notify => write!(f, "notify"),
        }
    }
}

/// Set of operations a characteristic supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessMode(u8);

impl AccessMode {
    pub const READ: AccessMode = AccessMode(0b001);
    pub const WRITE: AccessMode = AccessMode(0b010);
    pub const NOTIFY: AccessMode = AccessMode(0b100);

    const fn union(self, other: AccessMode) -> AccessMode {
        AccessMode(self.0 | other.0)
    }

    pub const fn permits(self, operation: Operation) -> bool {
        let bit = match operation {
            Operation::Read => Self::READ.0,
            Operation::Write => Self::WRITE.0,
            Operation::Notify => Self::NOTIFY.0,
        };
        self.0 & bit != 0
    }
}

impl BitOr for AccessMode {
    type Output = AccessMode;

    fn bitor(self, rhs: AccessMode) -> AccessMode {
        self.union(rhs)
    }
}

const R: AccessMode = AccessMode::READ;
const W: AccessMode = AccessMode::WRITE;
const RW: AccessMode = AccessMode::READ.union(AccessMode::WRITE);
const RN: AccessMode = AccessMode::READ.union(AccessMode::NOTIFY);

/// Every logical feature the client can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    KeyState,
    MotorSpeed,
    MotorStop,
    Shutdown,
    VerifyAccelerometer,
    CruiseControl,
    VibrationSetting,
    WakeUp,
    RotationSpeed,
    Depth,
    Accelerometer,
    TemperaturePressure,
    Buttons,
    UseCount,
    UseCountReset,
    ManufacturerName,
    ModelNumber,
    HardwareRevision,
    FirmwareRevision,
    SoftwareRevision,
    SerialNumberString,
    DeviceName,
    MacAddress,
    SerialNumber,
    ChipId,
    SystemId,
    Ieee11073,
    PnpId,
    Appearance,
    ConnectionParameters,
    BatteryLevel,
}

impl Feature {
    pub const ALL: [Feature; 31] = [
        Feature::KeyState,
        Feature::MotorSpeed,
        Feature::MotorStop,
        Feature::Shutdown,
        Feature::VerifyAccelerometer,
        Feature::CruiseControl,
        Feature::VibrationSetting,
        Feature::WakeUp,
        Feature::RotationSpeed,
        Feature::Depth,
        Feature::Accelerometer,
        Feature::TemperaturePressure,
        Feature::Buttons,
        Feature::UseCount,
        Feature::UseCountReset,
        Feature::ManufacturerName,
        Feature::ModelNumber,
        Feature::HardwareRevision,
        Feature::FirmwareRevision,
        Feature::SoftwareRevision,
        Feature::SerialNumberString,
        Feature::DeviceName,
        Feature::MacAddress,
        Feature::SerialNumber,
        Feature::ChipId,
        Feature::SystemId,
        Feature::Ieee11073,
        Feature::PnpId,
        Feature::Appearance,
        Feature::ConnectionParameters,
        Feature::BatteryLevel,
    ];

    /// Stable snake_case name, as accepted by [`lookup_name`].
    pub const fn name(self) -> &'static str {
        match self {
            Feature::KeyState => "key_state",
            Feature::MotorSpeed => "motor_speed",
            Feature::MotorStop => "motor_stop",
            Feature::Shutdown => "shutdown",
            Feature::VerifyAccelerometer => "verify_accelerometer",
            Feature::CruiseControl => "cruise_control",
            Feature::VibrationSetting => "vibration_setting",
            Feature::WakeUp => "wake_up",
            Feature::RotationSpeed => "rotation_speed",
            Feature::Depth => "depth",
            Feature::Accelerometer => "accelerometer",
            Feature::TemperaturePressure => "temperature_pressure",
            Feature::Buttons => "buttons",
            Feature::UseCount => "use_count",
            Feature::UseCountReset => "use_count_reset",
            Feature::ManufacturerName => "manufacturer_name",
            Feature::ModelNumber => "model_number",
            Feature::HardwareRevision => "hardware_revision",
            Feature::FirmwareRevision => "firmware_revision",
            Feature::SoftwareRevision => "software_revision",
            Feature::SerialNumberString => "serial_number_string",
            Feature::DeviceName => "device_name",
            Feature::MacAddress => "mac_address",
            Feature::SerialNumber => "serial_number",
            Feature::ChipId => "chip_id",
            Feature::SystemId => "system_id",
            Feature::Ieee11073 => "ieee_11073",
            Feature::PnpId => "pnp_id",
            Feature::Appearance => "appearance",
            Feature::ConnectionParameters => "connection_parameters",
            Feature::BatteryLevel => "battery_level",
        }
    }

    /// Descriptor for this feature.
    pub fn descriptor(self) -> &'static CharacteristicDescriptor {
        lookup(self)
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Feature {
    type Err = F1Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        lookup_name(s).map(|d| d.feature)
    }
}

/// Addressing and (de)serialization rules for one feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    pub feature: Feature,
    pub service: Service,
    /// 16-bit short id of the characteristic.
    pub short_id: u16,
    pub access: AccessMode,
    pub codec: Codec,
    /// Requires an authorized session (key state on).
    pub privileged: bool,
}

impl CharacteristicDescriptor {
    /// Fallback UUID on the Bluetooth base, used when the link advertises
    /// no characteristic with this short id.
    pub const fn default_uuid(&self) -> Uuid {
        base_uuid(self.short_id)
    }

    /// Fail with `AccessDenied` unless `operation` is supported.
    pub fn require(&self, operation: Operation) -> Result<(), F1Error> {
        if self.access.permits(operation) {
            Ok(())
        } else {
            Err(F1Error::AccessDenied {
                feature: self.feature,
                operation,
            })
        }
    }
}

const fn entry(
    feature: Feature,
    service: Service,
    short_id: u16,
    access: AccessMode,
    codec: Codec,
    privileged: bool,
) -> CharacteristicDescriptor {
    CharacteristicDescriptor {
        feature,
        service,
        short_id,
        access,
        codec,
        privileged,
    }
}

use Service::{Battery, DeviceInformation, GenericAccess, Vendor};

/// Indexed by `Feature as usize`; order must follow the enum.
static REGISTRY: [CharacteristicDescriptor; 31] = [
    entry(Feature::KeyState, Vendor, 0x0a0f, RN, Codec::KeyFlag, false),
    entry(Feature::MotorSpeed, Vendor, 0xfff1, RW, Codec::MotorSpeeds, true),
    entry(Feature::MotorStop, Vendor, 0xfff1, W, Codec::Command(&[0x01, 0x00, 0x00]), true),
    entry(Feature::Shutdown, Vendor, 0xfff1, W, Codec::Command(&[0x01, 0xfa]), true),
    entry(Feature::VerifyAccelerometer, Vendor, 0xfff1, W, Codec::Command(&[0xff, 0xff, 0xff]), true),
    entry(Feature::CruiseControl, Vendor, 0x0aa5, RW, Codec::CruiseControl, true),
    entry(Feature::VibrationSetting, Vendor, 0x0a0d, RW, Codec::VibrationPattern, true),
    entry(Feature::WakeUp, Vendor, 0x0aa1, RW, Codec::Switch, true),
    entry(Feature::RotationSpeed, Vendor, 0x0aa3, RN, Codec::U16, true),
    entry(Feature::Depth, Vendor, 0x0a0b, RN, Codec::U16, true),
    entry(Feature::Accelerometer, Vendor, 0x0a0c, RN, Codec::Accelerometer, true),
    entry(Feature::TemperaturePressure, Vendor, 0x0a0a, RN, Codec::TemperaturePressure, true),
    entry(Feature::Buttons, Vendor, 0x0aa4, RN, Codec::Buttons, true),
    entry(Feature::UseCount, Vendor, 0x0a04, R, Codec::U16, true),
    entry(Feature::UseCountReset, Vendor, 0x0a04, W, Codec::Command(&[0xee]), true),
    entry(Feature::ManufacturerName, DeviceInformation, 0x2a29, R, Codec::Text, false),
    entry(Feature::ModelNumber, DeviceInformation, 0x2a24, R, Codec::Text, false),
    entry(Feature::HardwareRevision, DeviceInformation, 0x2a27, R, Codec::Text, false),
    entry(Feature::FirmwareRevision, DeviceInformation, 0x2a26, R, Codec::Text, false),
    entry(Feature::SoftwareRevision, DeviceInformation, 0x2a28, R, Codec::Text, false),
    entry(Feature::SerialNumberString, DeviceInformation, 0x2a25, R, Codec::Text, false),
    entry(Feature::DeviceName, GenericAccess, 0x2a00, R, Codec::Text, false),
    entry(Feature::MacAddress, Vendor, 0x0a06, R, Codec::HexString, false),
    entry(Feature::SerialNumber, Vendor, 0x0a05, R, Codec::HexString, false),
    entry(Feature::ChipId, Vendor, 0x0a07, R, Codec::HexString, false),
    entry(Feature::SystemId, DeviceInformation, 0x2a23, R, Codec::HexString, false),
    entry(Feature::Ieee11073, DeviceInformation, 0x2a2a, R, Codec::HexString, false),
    entry(Feature::PnpId, DeviceInformation, 0x2a50, R, Codec::HexString, false),
    entry(Feature::Appearance, GenericAccess, 0x2a01, R, Codec::HexString, false),
    entry(Feature::ConnectionParameters, GenericAccess, 0x2a04, R, Codec::HexString, false),
    entry(Feature::BatteryLevel, Battery, 0x2a19, R, Codec::Percent, false),
];

/// Descriptor for a feature.
pub fn lookup(feature: Feature) -> &'static CharacteristicDescriptor {
    &REGISTRY[feature as usize]
}

/// Descriptor for a feature given by name; `UnknownFeature` if absent.
pub fn lookup_name(name: &str) -> Result<&'static CharacteristicDescriptor, F1Error> {
    let wanted = name.trim().to_ascii_lowercase().replace('-', "_");
    REGISTRY
        .iter()
        .find(|d| d.feature.name() == wanted)
        .ok_or_else(|| F1Error::UnknownFeature(name.to_string()))
}

/// All descriptors, in registry order.
pub fn all() -> &'static [CharacteristicDescriptor] {
    &REGISTRY
}

/// Concrete characteristic UUIDs for one link.
#[derive(Debug, Clone, Default)]
pub struct AddressMap {
    resolved: HashMap<u16, Uuid>,
}

impl AddressMap {
    /// Match every registry short id against the characteristics a
    /// peripheral advertises. The first advertised UUID whose leading
    /// 32 bits equal the short id wins.
    pub fn resolve(discovered: &[Uuid]) -> Self {
        let mut resolved = HashMap::new();
        for descriptor in REGISTRY.iter() {
            if resolved.contains_key(&descriptor.short_id) {
                continue;
            }
            if let Some(uuid) = discovered
                .iter()
                .find(|u| short_id_of(u) == descriptor.short_id as u32)
            {
                log::debug!(
                    "resolved {} ({:04x}) to {}",
                    descriptor.feature,
                    descriptor.short_id,
                    uuid
                );
                resolved.insert(descriptor.short_id, *uuid);
            }
        }
        Self { resolved }
    }

    /// UUID to use for a feature on this link.
    pub fn uuid_for(&self, feature: Feature) -> Uuid {
        let descriptor = lookup(feature);
        self.resolved
            .get(&descriptor.short_id)
            .copied()
            .unwrap_or_else(|| descriptor.default_uuid())
    }

    /// Number of registry short ids matched against the peripheral.
    pub fn resolved_count(&self) -> usize {
        self.resolved.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_order_matches_feature_enum() {
        for (index, feature) in Feature::ALL.iter().enumerate() {
            assert_eq!(*feature as usize, index);
            assert_eq!(REGISTRY[index].feature, *feature);
        }
    }

    #[test]
    fn test_lookup_by_name() {
        let d = lookup_name("battery_level").unwrap();
        assert_eq!(d.feature, Feature::BatteryLevel);
        assert_eq!(d.short_id, 0x2a19);

        // Dashes and case are tolerated.
        assert_eq!(lookup_name("Motor-Speed").unwrap().feature, Feature::MotorSpeed);

        let err = lookup_name("warp_drive").unwrap_err();
        assert_eq!(err, F1Error::UnknownFeature("warp_drive".into()));
    }

    #[test]
    fn test_feature_name_round_trip() {
        for feature in Feature::ALL {
            assert_eq!(feature.name().parse::<Feature>().unwrap(), feature);
        }
    }

    #[test]
    fn test_access_modes() {
        let key = lookup(Feature::KeyState);
        assert!(key.access.permits(Operation::Read));
        assert!(key.access.permits(Operation::Notify));
        assert!(!key.access.permits(Operation::Write));

        let stop = lookup(Feature::MotorStop);
        assert!(matches!(
            stop.require(Operation::Read),
            Err(F1Error::AccessDenied { feature: Feature::MotorStop, operation: Operation::Read })
        ));
        assert!(stop.require(Operation::Write).is_ok());
    }

    #[test]
    fn test_notify_characteristics_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for d in all().iter().filter(|d| d.access.permits(Operation::Notify)) {
            assert!(seen.insert(d.short_id), "{} shares a notify characteristic", d.feature);
        }
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn test_base_uuid_expansion() {
        assert_eq!(
            base_uuid(0x2a19).to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            Service::Vendor.uuid().to_string(),
            "0000fff0-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_address_map_prefers_advertised_uuid() {
        let vendor_key_state = Uuid::parse_str("00000a0f-1212-efde-1523-785fef13d123").unwrap();
        let unrelated = Uuid::parse_str("0000beef-1212-efde-1523-785fef13d123").unwrap();
        let map = AddressMap::resolve(&[unrelated, vendor_key_state]);

        assert_eq!(map.uuid_for(Feature::KeyState), vendor_key_state);
        assert_eq!(map.resolved_count(), 1);
        // Unmatched features fall back to the Bluetooth base.
        assert_eq!(map.uuid_for(Feature::BatteryLevel), base_uuid(0x2a19));
    }

    #[test]
    fn test_shared_characteristic_resolves_once() {
        let motor = Uuid::parse_str("0000fff1-1212-efde-1523-785fef13d123").unwrap();
        let map = AddressMap::resolve(&[motor]);
        assert_eq!(map.uuid_for(Feature::MotorSpeed), motor);
        assert_eq!(map.uuid_for(Feature::Shutdown), motor);
        assert_eq!(map.uuid_for(Feature::MotorStop), motor);
    }
}
