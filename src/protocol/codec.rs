//! Value codec
//!
//! Pure functions mapping raw characteristic payloads to typed values and
//! back. Every codec has a fixed payload shape; a payload of the wrong
//! width fails with `MalformedPayload`, and a percentage above 100 fails
//! with `OutOfRange` instead of being clamped.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::registry::{lookup, Feature};
use crate::error::F1Error;

/// Payload shape of a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// UTF-8 text, trailing NULs dropped.
    Text,
    /// Bytes rendered as `AA:BB:CC`.
    HexString,
    /// One byte, bit 0 is the value.
    KeyFlag,
    /// One byte, `0x01` is on and anything else off.
    Switch,
    /// One byte in 0..=100.
    Percent,
    /// Big-endian `u16`.
    U16,
    /// `[0x01, main, vibration]`, both percentages.
    MotorSpeeds,
    /// Eight percentages.
    VibrationPattern,
    /// Three big-endian `u16` axes.
    Accelerometer,
    /// 24-bit temperature and 32-bit pressure, big-endian, both ×100.
    TemperaturePressure,
    /// One byte button state.
    Buttons,
    /// Reads as a switch; writes 0 (off), 1 (on) or 2 (on and reset).
    CruiseControl,
    /// Write-only constant command.
    Command(&'static [u8]),
}

/// Speeds of the two motors, each 0..=100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MotorSpeeds {
    pub main: u8,
    pub vibration: u8,
}

/// Raw accelerometer axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Accelerometer {
    pub x: u16,
    pub y: u16,
    pub z: u16,
}

/// Internal temperature (°C) and pressure (mbar), two decimals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperaturePressure {
    pub temperature: f64,
    pub pressure: f64,
}

/// Which button, if any, is held down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ButtonState {
    Central,
    Plus,
    Minus,
    NonePressed,
}

impl ButtonState {
    pub const fn to_byte(self) -> u8 {
        match self {
            ButtonState::Central => 0x00,
            ButtonState::Plus => 0x01,
            ButtonState::Minus => 0x02,
            ButtonState::NonePressed => 0x03,
        }
    }

    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(ButtonState::Central),
            0x01 => Some(ButtonState::Plus),
            0x02 => Some(ButtonState::Minus),
            0x03 => Some(ButtonState::NonePressed),
            _ => None,
        }
    }
}

/// Cruise control write command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CruiseControl {
    Disabled,
    Enabled,
    /// Enable and reset the motor speeds to their defaults. Write only.
    EnableAndReset,
}

impl CruiseControl {
    pub const fn to_byte(self) -> u8 {
        match self {
            CruiseControl::Disabled => 0x00,
            CruiseControl::Enabled => 0x01,
            CruiseControl::EnableAndReset => 0x02,
        }
    }
}

/// A decoded characteristic value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeatureValue {
    Text(String),
    Flag(bool),
    Percent(u8),
    Count(u16),
    MotorSpeeds(MotorSpeeds),
    VibrationPattern([u8; 8]),
    Accelerometer(Accelerometer),
    TemperaturePressure(TemperaturePressure),
    Buttons(ButtonState),
    CruiseControl(CruiseControl),
    /// Payload of a constant command.
    Trigger,
}

impl FeatureValue {
    fn kind(&self) -> &'static str {
        match self {
            FeatureValue::Text(_) => "text",
            FeatureValue::Flag(_) => "flag",
            FeatureValue::Percent(_) => "percent",
            FeatureValue::Count(_) => "count",
            FeatureValue::MotorSpeeds(_) => "motor speeds",
            FeatureValue::VibrationPattern(_) => "vibration pattern",
            FeatureValue::Accelerometer(_) => "accelerometer",
            FeatureValue::TemperaturePressure(_) => "temperature/pressure",
            FeatureValue::Buttons(_) => "buttons",
            FeatureValue::CruiseControl(_) => "cruise control",
            FeatureValue::Trigger => "trigger",
        }
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Text(s) => write!(f, "{}", s),
            FeatureValue::Flag(b) => write!(f, "{}", b),
            FeatureValue::Percent(p) => write!(f, "{}%", p),
            FeatureValue::Count(c) => write!(f, "{}", c),
            FeatureValue::MotorSpeeds(m) => write!(f, "main={} vibration={}", m.main, m.vibration),
            FeatureValue::VibrationPattern(levels) => write!(f, "{:?}", levels),
            FeatureValue::Accelerometer(a) => write!(f, "x={} y={} z={}", a.x, a.y, a.z),
            FeatureValue::TemperaturePressure(tp) => {
                write!(f, "{:.2} °C, {:.2} mbar", tp.temperature, tp.pressure)
            }
            FeatureValue::Buttons(b) => write!(f, "{:?}", b),
            FeatureValue::CruiseControl(c) => write!(f, "{:?}", c),
            FeatureValue::Trigger => write!(f, "trigger"),
        }
    }
}

fn malformed(feature: Feature, reason: impl Into<String>) -> F1Error {
    F1Error::MalformedPayload {
        feature,
        reason: reason.into(),
    }
}

fn expect_len(feature: Feature, bytes: &[u8], width: usize) -> Result<(), F1Error> {
    if bytes.len() == width {
        Ok(())
    } else {
        Err(malformed(
            feature,
            format!("expected {} bytes, got {}", width, bytes.len()),
        ))
    }
}

fn percent(feature: Feature, value: u8) -> Result<u8, F1Error> {
    if value <= 100 {
        Ok(value)
    } else {
        Err(F1Error::OutOfRange {
            feature,
            value: value as u32,
        })
    }
}

fn be_u16(hi: u8, lo: u8) -> u16 {
    u16::from_be_bytes([hi, lo])
}

/// Render bytes as upper-case hex pairs joined by colons.
pub fn hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(":")
}

/// Decode a raw payload read or notified for `feature`.
pub fn decode(feature: Feature, bytes: &[u8]) -> Result<FeatureValue, F1Error> {
    match lookup(feature).codec {
        Codec::Text => {
            let trimmed = match bytes.iter().rposition(|b| *b != 0) {
                Some(last) => &bytes[..=last],
                None => &bytes[..0],
            };
            String::from_utf8(trimmed.to_vec())
                .map(FeatureValue::Text)
                .map_err(|e| malformed(feature, e.to_string()))
        }
        Codec::HexString => Ok(FeatureValue::Text(hex_string(bytes))),
        Codec::KeyFlag => {
            expect_len(feature, bytes, 1)?;
            Ok(FeatureValue::Flag(bytes[0] & 0x01 != 0))
        }
        Codec::Switch | Codec::CruiseControl => {
            expect_len(feature, bytes, 1)?;
            Ok(FeatureValue::Flag(bytes[0] == 0x01))
        }
        Codec::Percent => {
            expect_len(feature, bytes, 1)?;
            Ok(FeatureValue::Percent(bytes[0]))
        }
        Codec::U16 => {
            expect_len(feature, bytes, 2)?;
            Ok(FeatureValue::Count(be_u16(bytes[0], bytes[1])))
        }
        Codec::MotorSpeeds => {
            expect_len(feature, bytes, 3)?;
            Ok(FeatureValue::MotorSpeeds(MotorSpeeds {
                main: bytes[1],
                vibration: bytes[2],
            }))
        }
        Codec::VibrationPattern => {
            expect_len(feature, bytes, 8)?;
            let mut levels = [0u8; 8];
            levels.copy_from_slice(bytes);
            Ok(FeatureValue::VibrationPattern(levels))
        }
        Codec::Accelerometer => {
            expect_len(feature, bytes, 6)?;
            Ok(FeatureValue::Accelerometer(Accelerometer {
                x: be_u16(bytes[0], bytes[1]),
                y: be_u16(bytes[2], bytes[3]),
                z: be_u16(bytes[4], bytes[5]),
            }))
        }
        Codec::TemperaturePressure => {
            expect_len(feature, bytes, 8)?;
            let temperature = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);
            let pressure = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
            Ok(FeatureValue::TemperaturePressure(TemperaturePressure {
                temperature: temperature as f64 / 100.0,
                pressure: pressure as f64 / 100.0,
            }))
        }
        Codec::Buttons => {
            expect_len(feature, bytes, 1)?;
            ButtonState::from_byte(bytes[0])
                .map(FeatureValue::Buttons)
                .ok_or_else(|| malformed(feature, format!("unknown button state {:#04x}", bytes[0])))
        }
        Codec::Command(_) => Err(malformed(feature, "command characteristics carry no value")),
    }
}

/// Encode a value to be written to `feature`.
pub fn encode(feature: Feature, value: &FeatureValue) -> Result<Vec<u8>, F1Error> {
    let mismatch = || {
        F1Error::InvalidArgument(format!(
            "{} cannot be written as {}",
            feature,
            value.kind()
        ))
    };
    match (lookup(feature).codec, value) {
        (Codec::Switch, FeatureValue::Flag(on)) => Ok(vec![u8::from(*on)]),
        (Codec::Percent, FeatureValue::Percent(p)) => Ok(vec![percent(feature, *p)?]),
        (Codec::U16, FeatureValue::Count(c)) => Ok(c.to_be_bytes().to_vec()),
        (Codec::MotorSpeeds, FeatureValue::MotorSpeeds(m)) => Ok(vec![
            0x01,
            percent(feature, m.main)?,
            percent(feature, m.vibration)?,
        ]),
        (Codec::VibrationPattern, FeatureValue::VibrationPattern(levels)) => levels
            .iter()
            .map(|level| percent(feature, *level))
            .collect(),
        (Codec::CruiseControl, FeatureValue::CruiseControl(c)) => Ok(vec![c.to_byte()]),
        (Codec::CruiseControl, FeatureValue::Flag(on)) => Ok(vec![u8::from(*on)]),
        (Codec::Command(bytes), FeatureValue::Trigger) => Ok(bytes.to_vec()),
        _ => Err(mismatch()),
    }
}

/// Conversion from a decoded value into the type a caller asked for.
pub trait FromFeatureValue: Sized + Send + 'static {
    fn from_feature_value(feature: Feature, value: FeatureValue) -> Result<Self, F1Error>;
}

fn unexpected(feature: Feature, wanted: &str, value: &FeatureValue) -> F1Error {
    malformed(
        feature,
        format!("expected {}, decoded {}", wanted, value.kind()),
    )
}

macro_rules! from_feature_value {
    ($ty:ty, $wanted:literal, $($pattern:pat => $out:expr),+) => {
        impl FromFeatureValue for $ty {
            fn from_feature_value(feature: Feature, value: FeatureValue) -> Result<Self, F1Error> {
                match value {
                    $($pattern => Ok($out),)+
                    other => Err(unexpected(feature, $wanted, &other)),
                }
            }
        }
    };
}

from_feature_value!(String, "text", FeatureValue::Text(s) => s);
from_feature_value!(bool, "flag", FeatureValue::Flag(b) => b);
from_feature_value!(u8, "percent", FeatureValue::Percent(p) => p);
from_feature_value!(u16, "count", FeatureValue::Count(c) => c);
from_feature_value!(MotorSpeeds, "motor speeds", FeatureValue::MotorSpeeds(m) => m);
from_feature_value!([u8; 8], "vibration pattern", FeatureValue::VibrationPattern(v) => v);
from_feature_value!(Accelerometer, "accelerometer", FeatureValue::Accelerometer(a) => a);
from_feature_value!(
    TemperaturePressure,
    "temperature/pressure",
    FeatureValue::TemperaturePressure(tp) => tp
);
from_feature_value!(ButtonState, "buttons", FeatureValue::Buttons(b) => b);

impl FromFeatureValue for FeatureValue {
    fn from_feature_value(_feature: Feature, value: FeatureValue) -> Result<Self, F1Error> {
        Ok(value)
    }
}
