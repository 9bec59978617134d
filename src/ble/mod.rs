//! BLE layer for the card exchange protocol
//!
//! Provides the advertising frame and transfer packet codecs, the
//! well-known GATT identifiers, the radio capability-provider traits,
//! a no-op radio, an in-process simulated radio for testing, and (with
//! the `ble-central` feature) a btleplug-backed central adapter.

pub mod frame;
pub mod gatt;
#[cfg(feature = "ble-central")]
pub mod hardware;
pub mod null;
pub mod packet;
pub mod simulated;
pub mod transport;

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use self::null::NullRadio;
use self::transport::RadioProvider;

#[derive(Error, Debug)]
pub enum BleError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Advertising error: {0}")]
    AdvertisingError(String),

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("GATT error: {0}")]
    GattError(String),

    #[error("Service {0} not found on peer")]
    ServiceNotFound(Uuid),

    #[error("Characteristic {0} not found on peer")]
    CharacteristicNotFound(Uuid),

    #[error("Operation was cancelled")]
    OperationCancelled,

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Peer is already connected")]
    AlreadyConnected,

    #[error("Bluetooth permissions not granted")]
    PermissionDenied,

    #[error("Bluetooth radio is powered off")]
    RadioOff,

    #[error("Not supported on this radio: {0}")]
    Unsupported(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Operation timed out")]
    Timeout,
}

/// Transient link failure categories the central sender knows how to
/// recover from. Everything else is [`LinkFailure::Fatal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkFailure {
    MissingService,
    Cancelled,
    Disconnected,
    Fatal,
}

impl BleError {
    /// Classify a free-text error reported by a platform radio stack.
    ///
    /// Real stacks report most link failures as strings; this keeps the
    /// substring matching in one place so protocol code can match on
    /// variants instead.
    pub fn from_platform_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("already connected") {
            BleError::AlreadyConnected
        } else if lower.contains("characteristic") && lower.contains("not found") {
            BleError::CharacteristicNotFound(Uuid::nil())
        } else if mentions_in_order(&lower, "service", "not found") {
            BleError::ServiceNotFound(Uuid::nil())
        } else if lower.contains("cancelled") || lower.contains("canceled") {
            BleError::OperationCancelled
        } else if lower.contains("disconnected") || lower.contains("not connected") {
            BleError::Disconnected
        } else if lower.contains("powered off") {
            BleError::RadioOff
        } else if lower.contains("permission") {
            BleError::PermissionDenied
        } else if lower.contains("timed out") || lower.contains("timeout") {
            BleError::Timeout
        } else {
            BleError::GattError(message.to_string())
        }
    }

    /// Retry category of this error for the sender's fallback ladder.
    pub fn link_failure(&self) -> LinkFailure {
        match self {
            BleError::ServiceNotFound(_) => LinkFailure::MissingService,
            BleError::OperationCancelled => LinkFailure::Cancelled,
            BleError::Disconnected => LinkFailure::Disconnected,
            _ => LinkFailure::Fatal,
        }
    }

    /// Actionable text suitable for showing to the user.
    pub fn user_message(&self) -> &'static str {
        match self {
            BleError::RadioOff => "Bluetooth is turned off. Please enable Bluetooth.",
            BleError::PermissionDenied => {
                "Bluetooth permissions denied. Please grant permissions."
            }
            BleError::ConnectionError(_) | BleError::AlreadyConnected | BleError::Disconnected => {
                "Failed to connect to device."
            }
            BleError::Timeout => "Scan timeout. No devices found.",
            BleError::InvalidInput(_) => "Invalid data received.",
            BleError::ScanError(_) | BleError::Unsupported(_) | BleError::AdvertisingError(_) => {
                "Bluetooth is not available on this device."
            }
            BleError::GattError(_)
            | BleError::ServiceNotFound(_)
            | BleError::CharacteristicNotFound(_)
            | BleError::OperationCancelled => "Failed to transmit data.",
        }
    }
}

/// Pick the radio provider for this process.
///
/// With the `ble-central` feature the first btleplug adapter is used when
/// one can be opened; otherwise (or on failure) the no-op radio is returned
/// and every proximity feature runs in its degraded mode.
pub async fn select_radio() -> Arc<dyn RadioProvider> {
    #[cfg(feature = "ble-central")]
    {
        match hardware::HardwareRadio::open().await {
            Ok(radio) => {
                log::info!("Using btleplug radio adapter");
                return Arc::new(radio);
            }
            Err(e) => {
                log::warn!("No usable BLE adapter ({}); falling back to null radio", e);
            }
        }
    }
    Arc::new(NullRadio)
}

/// `first` occurs somewhere before `then` in `text`.
fn mentions_in_order(text: &str, first: &str, then: &str) -> bool {
    text.find(first)
        .map(|at| text[at + first.len()..].contains(then))
        .unwrap_or(false)
}
