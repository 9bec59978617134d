//! Tunables for the proximity roles
//!
//! Stored as a single JSON document. Every field has a default, so a file
//! only needs the values it overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProximityConfig {
    pub scan: ScanConfig,
    pub broadcast: BroadcastConfig,
    pub sender: SenderConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Observations weaker than this (dBm) are ignored.
    pub min_rssi: i16,
    /// Peers estimated further away than this are ignored.
    pub max_distance_meters: Option<f64>,
    /// Auto-stop after this many milliseconds. 0 scans until stopped.
    pub timeout_ms: u64,
    /// Expected RSSI at one metre.
    pub measured_power: i16,
    pub path_loss_exponent: f64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            min_rssi: -95,
            max_distance_meters: None,
            timeout_ms: 10_000,
            measured_power: -59,
            path_loss_exponent: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Lifetime of REQUEST/ACCEPT announcements.
    pub announce_ttl_ms: u64,
    /// Advertise READY as a bare initial instead of a binary frame.
    pub legacy_ready_payload: bool,
    /// Put a `TravelCard_<label>_xxxx` local name in the advertisement.
    pub include_device_name: bool,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            announce_ttl_ms: 2_000,
            legacy_ready_payload: false,
            include_device_name: true,
        }
    }
}

impl BroadcastConfig {
    pub fn announce_ttl(&self) -> Duration {
        Duration::from_millis(self.announce_ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub cancelled_retry_delay_ms: u64,
    /// Tear down links the sender opened itself once the write is done.
    pub disconnect_after: bool,
    /// Upper bound on a single connect attempt.
    pub connection_timeout_ms: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            cancelled_retry_delay_ms: 250,
            disconnect_after: true,
            connection_timeout_ms: 5_000,
        }
    }
}

impl ProximityConfig {
    /// Load a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        serde_json::from_slice(&data).map_err(|e| ConfigError::DeserializationError(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::IoError(e.to_string()))?;
            }
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| ConfigError::IoError(e.to_string()))
    }
}
