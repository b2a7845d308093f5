//! Read-only view of the device settings store.
//!
//! The settings store is a JSON object of string keys to string values,
//! written by the management surface (web UI / provisioning tooling) and
//! read here. The agent never writes to it: connection parameters flow
//! one way, from the store into [`crate::config::BrokerSettings`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Default store location, overridable via `VIGIL_SETTINGS_PATH`.
pub const DEFAULT_SETTINGS_PATH: &str = "./settings.json";

#[derive(Debug, thiserror::Error)]
pub enum SettingsStoreError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings file is not a JSON string map: {0}")]
    Json(#[from] serde_json::Error),
}

/// File-backed key→value settings, cached in memory and reloadable.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl SettingsStore {
    /// Opens the store at the path from `VIGIL_SETTINGS_PATH` (or the default).
    pub fn open_default() -> Result<Self, SettingsStoreError> {
        let path = std::env::var("VIGIL_SETTINGS_PATH")
            .unwrap_or_else(|_| DEFAULT_SETTINGS_PATH.to_string());
        Self::open(path)
    }

    /// Opens the store, loading current values. A missing file is not an
    /// error: the collaborator may not have written any settings yet.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, SettingsStoreError> {
        let store = Self {
            path: path.into(),
            values: Mutex::new(HashMap::new()),
        };
        store.reload()?;
        debug!("settings store opened at {:?}", store.path);
        Ok(store)
    }

    /// Re-reads the backing file, replacing the cached values.
    pub fn reload(&self) -> Result<(), SettingsStoreError> {
        if !self.path.exists() {
            self.values.lock().clear();
            return Ok(());
        }

        let content = fs::read_to_string(&self.path)?;
        let loaded: HashMap<String, String> = serde_json::from_str(&content)?;
        *self.values.lock() = loaded;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    /// Reads a boolean-ish value ("true"/"false" strings, case-insensitive).
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).map(|v| v.trim().eq_ignore_ascii_case("true"))
    }
}
