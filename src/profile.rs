//! Saved connection profile
//!
//! Remembers the last device the client connected to, so front-ends can
//! reconnect without scanning.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::F1Error;

pub const PROFILE_FILE_NAME: &str = "last_connection_profile.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub address: String,
    pub name: Option<String>,
}

impl ConnectionProfile {
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
        }
    }
}

/// Profile persistence in one directory.
pub struct ProfileStore {
    directory: PathBuf,
}

impl ProfileStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.directory.join(PROFILE_FILE_NAME)
    }

    /// Write the profile as pretty JSON, creating the directory on demand.
    pub fn save(&self, profile: &ConnectionProfile) -> Result<(), F1Error> {
        std::fs::create_dir_all(&self.directory).map_err(|e| io_error(&self.directory, e))?;
        let json =
            serde_json::to_string_pretty(profile).map_err(|e| F1Error::Config(e.to_string()))?;
        let path = self.path();
        std::fs::write(&path, json).map_err(|e| io_error(&path, e))?;
        log::debug!("saved connection profile for {} to {}", profile.address, path.display());
        Ok(())
    }

    /// `None` when nothing has been saved yet.
    pub fn load(&self) -> Result<Option<ConnectionProfile>, F1Error> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&path).map_err(|e| io_error(&path, e))?;
        let profile = serde_json::from_slice(&data).map_err(|e| F1Error::Config(e.to_string()))?;
        Ok(Some(profile))
    }

    pub fn clear(&self) -> Result<(), F1Error> {
        let path = self.path();
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| io_error(&path, e))?;
        }
        Ok(())
    }
}

fn io_error(path: &Path, e: std::io::Error) -> F1Error {
    F1Error::Io(format!("{}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_profile_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = ProfileStore::new(dir.path());
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = ProfileStore::new(dir.path().join("nested"));
        let profile = ConnectionProfile::new("AA:BB:CC:DD:EE:FF", Some("F1s".into()));

        store.save(&profile).unwrap();
        assert_eq!(store.load().unwrap(), Some(profile));

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_corrupt_profile_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = ProfileStore::new(dir.path());
        std::fs::write(store.path(), b"{ not json").unwrap();
        assert!(matches!(store.load(), Err(F1Error::Config(_))));
    }
}
