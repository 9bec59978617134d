//! Radio capability-provider traits and core types
//!
//! Protocol code only ever talks to these traits. A [`RadioProvider`]
//! hands out the central and/or peripheral role it can actually perform;
//! a missing role is how "this platform/build has no such capability" is
//! expressed, so the protocol roles can fall back to their degraded modes
//! without probing for optional native bindings.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::BleError;

/// Platform-assigned transport address of a peer. Stable for dedup within
/// a scan session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerHandle(String);

impl PeerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single advertisement observation delivered by the scan facility.
#[derive(Debug, Clone)]
pub struct RawAdvertisement {
    pub id: PeerHandle,
    /// Local name, if the advertiser included one.
    pub name: Option<String>,
    /// Received signal strength in dBm.
    pub rssi: i16,
    /// Advertised service UUIDs.
    pub service_ids: Vec<Uuid>,
    /// Manufacturer-specific data. Some platforms leave the 2-byte company
    /// identifier in front of the payload, others strip it.
    pub manufacturer_data: Option<Vec<u8>>,
}

/// What a peripheral puts on the air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingData {
    pub local_name: Option<String>,
    pub service_ids: Vec<Uuid>,
    pub manufacturer_id: u16,
    pub manufacturer_data: Vec<u8>,
    pub connectable: bool,
}

/// Raw value of an inbound characteristic write, in whichever form the
/// platform delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundValue {
    /// Text, usually base64 of the written bytes.
    Text(String),
    Bytes(Vec<u8>),
}

/// A write received by a hosted characteristic.
#[derive(Debug, Clone)]
pub struct InboundWrite {
    pub from: Option<PeerHandle>,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub value: InboundValue,
}

/// Normalize an inbound value to the bytes that were written.
///
/// Text values are base64-decoded when they are valid base64 and taken as
/// UTF-8 otherwise.
pub fn normalize_inbound_bytes(value: InboundValue) -> Vec<u8> {
    match value {
        InboundValue::Bytes(bytes) => bytes,
        InboundValue::Text(text) => match base64::engine::general_purpose::STANDARD.decode(&text) {
            Ok(bytes) => bytes,
            Err(_) => text.into_bytes(),
        },
    }
}

/// A GATT service exposed by a connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

impl GattServiceInfo {
    pub fn has_characteristic(&self, characteristic: &Uuid) -> bool {
        self.characteristics.contains(characteristic)
    }
}

/// Power state of the local radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    PoweredOn,
    PoweredOff,
    Unknown,
}

/// BLE central role: scanning for advertisements and writing to peripherals.
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Start scanning for BLE advertisements.
    async fn start_scan(&self) -> Result<(), BleError>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Subscribe to observed advertisements.
    fn advertisements(&self) -> broadcast::Receiver<RawAdvertisement>;

    /// Current radio power state, when the platform exposes it.
    async fn radio_state(&self) -> RadioState {
        RadioState::Unknown
    }

    /// Whether a link to `peer` is currently up.
    async fn is_connected(&self, peer: &PeerHandle) -> Result<bool, BleError>;

    /// Establish a link to `peer` and discover its services.
    async fn connect(&self, peer: &PeerHandle) -> Result<(), BleError>;

    /// Tear down the link to `peer`.
    async fn disconnect(&self, peer: &PeerHandle) -> Result<(), BleError>;

    /// Services discovered on a connected peer.
    async fn services(&self, peer: &PeerHandle) -> Result<Vec<GattServiceInfo>, BleError>;

    /// Write with response to a characteristic of a connected peer.
    async fn write(
        &self,
        peer: &PeerHandle,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), BleError>;
}

/// BLE peripheral role: advertising and hosting writable characteristics.
#[async_trait]
pub trait BlePeripheral: Send + Sync {
    /// Start advertising, replacing any current advertisement.
    async fn start_advertising(&self, data: AdvertisingData) -> Result<(), BleError>;

    /// Stop advertising.
    async fn stop_advertising(&self) -> Result<(), BleError>;

    /// Host `service` with one writable `characteristic`.
    async fn add_service(&self, service: Uuid, characteristic: Uuid) -> Result<(), BleError>;

    /// Remove every hosted service.
    async fn clear_services(&self) -> Result<(), BleError>;

    /// Subscribe to writes received by hosted characteristics.
    fn inbound_writes(&self) -> broadcast::Receiver<InboundWrite>;
}

/// What a radio provider can do on this platform/build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioCapabilities {
    pub central: bool,
    pub peripheral: bool,
}

/// Source of radio roles, selected once at startup.
pub trait RadioProvider: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn central(&self) -> Option<Arc<dyn BleCentral>>;

    fn peripheral(&self) -> Option<Arc<dyn BlePeripheral>>;

    fn capabilities(&self) -> RadioCapabilities {
        RadioCapabilities {
            central: self.central().is_some(),
            peripheral: self.peripheral().is_some(),
        }
    }
}
