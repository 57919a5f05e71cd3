//! Client configuration
//!
//! Every field has a default, so a config file only needs the values it
//! changes. Durations are written as whole milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::F1Error;

/// Names the F1s firmware revisions advertise.
pub const DEFAULT_ADVERTISED_NAMES: [&str; 3] = ["F1s", "F1SV2A", "F1SV2X"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Deadline for each read, write or notify registration.
    #[serde(with = "duration_ms")]
    pub command_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Pause between failed connection attempts.
    #[serde(with = "duration_ms")]
    pub connect_retry_interval: Duration,
    #[serde(with = "duration_ms")]
    pub discover_timeout: Duration,
    /// Length of one scan pass during discovery.
    #[serde(with = "duration_ms")]
    pub scan_window: Duration,
    /// Device names accepted by discovery when no address is given.
    pub advertised_names: Vec<String>,
    /// Gate privileged features on the key state.
    pub key_state_check: bool,
    pub write_with_response: bool,
    /// Read the model number right after connecting.
    pub ping_on_connect: bool,
    /// Commands allowed to queue on a link before new ones fail `Busy`.
    pub max_pending_commands: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
            connect_retry_interval: Duration::from_millis(250),
            discover_timeout: Duration::from_secs(10),
            scan_window: Duration::from_secs(5),
            advertised_names: DEFAULT_ADVERTISED_NAMES.iter().map(|n| n.to_string()).collect(),
            key_state_check: true,
            write_with_response: true,
            ping_on_connect: true,
            max_pending_commands: 32,
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> Result<Self, F1Error> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| F1Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, F1Error> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| F1Error::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn to_json_pretty(&self) -> Result<String, F1Error> {
        serde_json::to_string_pretty(self).map_err(|e| F1Error::Config(e.to_string()))
    }

    fn validate(&self) -> Result<(), F1Error> {
        if self.command_timeout.is_zero() {
            return Err(F1Error::Config("command_timeout must be positive".into()));
        }
        if self.max_pending_commands == 0 {
            return Err(F1Error::Config("max_pending_commands must be at least 1".into()));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.command_timeout, Duration::from_secs(5));
        assert_eq!(config.connect_retry_interval, Duration::from_millis(250));
        assert_eq!(config.advertised_names, vec!["F1s", "F1SV2A", "F1SV2X"]);
        assert!(config.key_state_check);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            ClientConfig::from_json_str(r#"{"command_timeout": 1500, "key_state_check": false}"#)
                .unwrap();
        assert_eq!(config.command_timeout, Duration::from_millis(1500));
        assert!(!config.key_state_check);
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_round_trip_through_json() {
        let mut config = ClientConfig::default();
        config.advertised_names = vec!["F1s".into()];
        config.scan_window = Duration::from_millis(750);
        let json = config.to_json_pretty().unwrap();
        assert!(json.contains("\"scan_window\": 750"));
        assert_eq!(ClientConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        assert!(matches!(
            ClientConfig::from_json_str(r#"{"max_pending_commands": 0}"#),
            Err(F1Error::Config(_))
        ));
        assert!(matches!(
            ClientConfig::from_json_str("not json"),
            Err(F1Error::Config(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"ping_on_connect": false}}"#).unwrap();
        let config = ClientConfig::from_json_file(file.path()).unwrap();
        assert!(!config.ping_on_connect);

        let missing = ClientConfig::from_json_file(Path::new("/nonexistent/lelo.json"));
        assert!(matches!(missing, Err(F1Error::Io(_))));
    }
}
