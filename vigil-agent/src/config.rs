//! Broker connection configuration.
//!
//! Settings are layered: compiled defaults, then process environment, then
//! the device settings store. The store wins whenever a key is present, so
//! operators can repoint a fleet without touching the environment.

use crate::settings::SettingsStore;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Floor for the publish cadence. Anything faster is a misconfiguration.
pub const MIN_PUBLISH_INTERVAL_SECS: u64 = 5;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SettingsError {
    #[error("broker port must be between 1 and 65535")]
    InvalidPort,
    #[error("topic prefix {0:?} must contain a '/' hierarchy separator")]
    InvalidTopicPrefix(String),
    #[error("publish interval {0}s is below the 5s minimum")]
    IntervalTooShort(u64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    #[serde(skip)] // Never serialize passwords
    pub password: Option<String>,
    pub topic_prefix: String,
    pub publish_interval_secs: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            topic_prefix: "iot/device".to_string(),
            publish_interval_secs: 60,
        }
    }
}

impl BrokerSettings {
    /// Builds settings from the process environment, falling back to the
    /// compiled defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Ok(host) = std::env::var("MQTT_BROKER_HOST") {
            if !host.is_empty() {
                settings.host = host;
            }
        }
        if let Ok(port) = std::env::var("MQTT_BROKER_PORT") {
            match port.parse::<u16>() {
                Ok(p) => settings.port = p,
                Err(_) => warn!("ignoring unparseable MQTT_BROKER_PORT {port:?}"),
            }
        }
        settings.username = std::env::var("MQTT_USERNAME").ok().filter(|v| !v.is_empty());
        settings.password = std::env::var("MQTT_PASSWORD").ok().filter(|v| !v.is_empty());
        if let Ok(prefix) = std::env::var("MQTT_TOPIC_PREFIX") {
            if !prefix.is_empty() {
                settings.topic_prefix = prefix;
            }
        }
        if let Ok(interval) = std::env::var("MQTT_PUBLISH_INTERVAL") {
            match interval.parse::<u64>() {
                Ok(secs) => settings.publish_interval_secs = secs,
                Err(_) => warn!("ignoring unparseable MQTT_PUBLISH_INTERVAL {interval:?}"),
            }
        }

        settings
    }

    /// Overlays values from the settings store. Keys the store does not
    /// carry keep their current value; unparseable numbers are ignored
    /// with a warning rather than clobbering a working configuration.
    pub fn apply_store(&mut self, store: &SettingsStore) {
        if let Some(host) = store.get("mqtt_broker_host").filter(|v| !v.is_empty()) {
            self.host = host;
        }
        if let Some(port) = store.get("mqtt_broker_port") {
            match port.parse::<u16>() {
                Ok(p) => self.port = p,
                Err(_) => warn!("ignoring unparseable mqtt_broker_port {port:?} in settings store"),
            }
        }
        if let Some(username) = store.get("mqtt_username").filter(|v| !v.is_empty()) {
            self.username = Some(username);
        }
        if let Some(password) = store.get("mqtt_password").filter(|v| !v.is_empty()) {
            self.password = Some(password);
        }
        if let Some(prefix) = store.get("mqtt_topic_prefix").filter(|v| !v.is_empty()) {
            self.topic_prefix = prefix;
        }
        if let Some(interval) = store.get("mqtt_publish_interval") {
            match interval.parse::<u64>() {
                Ok(secs) => self.publish_interval_secs = secs,
                Err(_) => {
                    warn!("ignoring unparseable mqtt_publish_interval {interval:?} in settings store")
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.port == 0 {
            return Err(SettingsError::InvalidPort);
        }
        if !self.topic_prefix.contains('/') {
            return Err(SettingsError::InvalidTopicPrefix(self.topic_prefix.clone()));
        }
        if self.publish_interval_secs < MIN_PUBLISH_INTERVAL_SECS {
            return Err(SettingsError::IntervalTooShort(self.publish_interval_secs));
        }
        Ok(())
    }
}
