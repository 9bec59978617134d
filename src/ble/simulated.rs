//! In-process BLE simulator
//!
//! Provides a simulated BLE network where multiple devices can advertise,
//! scan, connect and write entirely in-process. Used for integration
//! testing and the CLI demo without requiring real BLE hardware.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::transport::{
    AdvertisingData, BleCentral, BlePeripheral, GattServiceInfo, InboundValue, InboundWrite,
    PeerHandle, RadioProvider, RadioState, RawAdvertisement,
};
use super::BleError;

/// Default RSSI of a simulated link, in dBm.
pub const DEFAULT_SIM_RSSI: i16 = -60;

/// How often an advertising device re-broadcasts.
pub const DEFAULT_ADV_INTERVAL: Duration = Duration::from_millis(100);

/// A failure to inject into the next matching central operation of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// `start_scan` fails.
    ScanStartFails,
    /// `connect` fails outright.
    ConnectFails,
    /// `connect` links the peer but reports "already connected".
    ConnectAlreadyConnected,
    /// `write` fails because the link dropped; the link is torn down.
    WriteDisconnect,
    /// `write` fails as cancelled by the radio stack.
    WriteCancelled,
    /// `write` fails with an unclassified GATT error.
    WriteFails,
}

impl SimFault {
    fn is_write(&self) -> bool {
        matches!(
            self,
            SimFault::WriteDisconnect | SimFault::WriteCancelled | SimFault::WriteFails
        )
    }

    fn is_connect(&self) -> bool {
        matches!(self, SimFault::ConnectFails | SimFault::ConnectAlreadyConnected)
    }
}

/// How a simulated peripheral hands inbound write values to its subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimValueEncoding {
    #[default]
    Bytes,
    Base64Text,
}

/// The simulated "air": a shared medium through which all simulated
/// devices communicate.
pub struct SimBleNetwork {
    devices: RwLock<HashMap<PeerHandle, Arc<SimDeviceState>>>,
    /// (observer, advertiser) -> RSSI seen by the observer.
    link_rssi: Mutex<HashMap<(PeerHandle, PeerHandle), i16>>,
    adv_interval: Duration,
}

impl SimBleNetwork {
    /// Create a new simulated BLE network.
    pub fn new() -> Arc<Self> {
        Self::with_adv_interval(DEFAULT_ADV_INTERVAL)
    }

    pub fn with_adv_interval(adv_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            devices: RwLock::new(HashMap::new()),
            link_rssi: Mutex::new(HashMap::new()),
            adv_interval,
        })
    }

    /// Create a new simulated BLE device on this network.
    pub fn create_device(self: &Arc<Self>) -> SimBleDevice {
        let id = Uuid::new_v4().simple().to_string();
        let address = PeerHandle::new(format!("SIM:{}", &id[..12]));
        let (adv_tx, _) = broadcast::channel(256);
        let (write_tx, _) = broadcast::channel(64);
        let state = Arc::new(SimDeviceState {
            address: address.clone(),
            adv_tx,
            write_tx,
            powered: AtomicBool::new(true),
            scanning: AtomicBool::new(false),
            services: Mutex::new(Vec::new()),
            advertiser: Mutex::new(None),
            current_adv: Mutex::new(None),
            links: Mutex::new(HashSet::new()),
            faults: Mutex::new(VecDeque::new()),
            value_encoding: Mutex::new(SimValueEncoding::default()),
            writes_received: AtomicUsize::new(0),
        });
        if let Ok(mut devices) = self.devices.write() {
            devices.insert(address, Arc::clone(&state));
        }
        SimBleDevice {
            state,
            network: Arc::clone(self),
        }
    }

    /// Set the RSSI `observer` measures for advertisements from `advertiser`.
    pub fn set_link_rssi(&self, observer: &PeerHandle, advertiser: &PeerHandle, rssi: i16) {
        if let Ok(mut links) = self.link_rssi.lock() {
            links.insert((observer.clone(), advertiser.clone()), rssi);
        }
    }

    fn rssi_between(&self, observer: &PeerHandle, advertiser: &PeerHandle) -> i16 {
        self.link_rssi
            .lock()
            .ok()
            .and_then(|links| links.get(&(observer.clone(), advertiser.clone())).copied())
            .unwrap_or(DEFAULT_SIM_RSSI)
    }

    fn device(&self, address: &PeerHandle) -> Option<Arc<SimDeviceState>> {
        self.devices.read().ok()?.get(address).cloned()
    }

    /// Put one advertisement on the air. Only powered, scanning devices
    /// other than the advertiser observe it.
    fn deliver_advertisement(&self, from: &PeerHandle, data: &AdvertisingData) {
        let observers: Vec<Arc<SimDeviceState>> = match self.devices.read() {
            Ok(devices) => devices
                .values()
                .filter(|d| &d.address != from && d.is_powered() && d.is_scanning())
                .cloned()
                .collect(),
            Err(_) => return,
        };

        // Android-style raw manufacturer data: company id first.
        let mut manufacturer_data = data.manufacturer_id.to_le_bytes().to_vec();
        manufacturer_data.extend_from_slice(&data.manufacturer_data);

        for observer in observers {
            let adv = RawAdvertisement {
                id: from.clone(),
                name: data.local_name.clone(),
                rssi: self.rssi_between(&observer.address, from),
                service_ids: data.service_ids.clone(),
                manufacturer_data: Some(manufacturer_data.clone()),
            };
            let _ = observer.adv_tx.send(adv);
        }
    }
}

struct SimDeviceState {
    address: PeerHandle,
    /// Advertisements observed by this device.
    adv_tx: broadcast::Sender<RawAdvertisement>,
    /// Writes received by this device's hosted characteristics.
    write_tx: broadcast::Sender<InboundWrite>,
    powered: AtomicBool,
    scanning: AtomicBool,
    services: Mutex<Vec<GattServiceInfo>>,
    advertiser: Mutex<Option<JoinHandle<()>>>,
    current_adv: Mutex<Option<AdvertisingData>>,
    /// Peers this device holds a central link to.
    links: Mutex<HashSet<PeerHandle>>,
    faults: Mutex<VecDeque<SimFault>>,
    value_encoding: Mutex<SimValueEncoding>,
    writes_received: AtomicUsize,
}

impl SimDeviceState {
    fn is_powered(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    fn has_link(&self, peer: &PeerHandle) -> bool {
        self.links.lock().map(|l| l.contains(peer)).unwrap_or(false)
    }

    fn set_link(&self, peer: &PeerHandle, up: bool) {
        if let Ok(mut links) = self.links.lock() {
            if up {
                links.insert(peer.clone());
            } else {
                links.remove(peer);
            }
        }
    }

    /// Pop the next queued fault if it applies to the current operation.
    fn take_fault(&self, applies: impl Fn(&SimFault) -> bool) -> Option<SimFault> {
        let mut faults = self.faults.lock().ok()?;
        if faults.front().map(&applies).unwrap_or(false) {
            faults.pop_front()
        } else {
            None
        }
    }

    fn abort_advertiser(&self) {
        if let Ok(mut advertiser) = self.advertiser.lock() {
            if let Some(handle) = advertiser.take() {
                handle.abort();
            }
        }
    }
}

/// A simulated BLE device that can act as both central and peripheral.
#[derive(Clone)]
pub struct SimBleDevice {
    state: Arc<SimDeviceState>,
    network: Arc<SimBleNetwork>,
}

impl SimBleDevice {
    /// Get this device's BLE address.
    pub fn address(&self) -> &PeerHandle {
        &self.state.address
    }

    /// Power the radio on or off. A powered-off radio cannot scan,
    /// advertise or connect, and is invisible to others.
    pub fn set_powered(&self, powered: bool) {
        self.state.powered.store(powered, Ordering::SeqCst);
        if !powered {
            self.state.scanning.store(false, Ordering::SeqCst);
            self.state.abort_advertiser();
        }
    }

    /// Choose how inbound write values are handed to this device's subscribers.
    pub fn set_value_encoding(&self, encoding: SimValueEncoding) {
        if let Ok(mut current) = self.state.value_encoding.lock() {
            *current = encoding;
        }
    }

    /// Queue a failure for a later central operation of this device.
    pub fn inject_fault(&self, fault: SimFault) {
        if let Ok(mut faults) = self.state.faults.lock() {
            faults.push_back(fault);
        }
    }

    /// Deliver an arbitrary observation to this device's scan subscribers.
    pub fn inject_advertisement(&self, adv: RawAdvertisement) {
        let _ = self.state.adv_tx.send(adv);
    }

    /// Number of writes accepted by this device's hosted characteristics.
    pub fn writes_received(&self) -> usize {
        self.state.writes_received.load(Ordering::SeqCst)
    }

    pub fn is_scanning(&self) -> bool {
        self.state.is_scanning()
    }

    pub fn is_advertising(&self) -> bool {
        self.current_advertisement().is_some()
    }

    /// The advertisement currently on the air, if any.
    pub fn current_advertisement(&self) -> Option<AdvertisingData> {
        self.state.current_adv.lock().ok()?.clone()
    }

    /// Services currently hosted by this device.
    pub fn hosted_services(&self) -> Vec<GattServiceInfo> {
        self.state
            .services
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn target(&self, peer: &PeerHandle) -> Result<Arc<SimDeviceState>, BleError> {
        self.network
            .device(peer)
            .ok_or_else(|| BleError::ConnectionError(format!("No peripheral at {}", peer)))
    }
}

#[async_trait]
impl BleCentral for SimBleDevice {
    async fn start_scan(&self) -> Result<(), BleError> {
        if self.state.take_fault(|f| *f == SimFault::ScanStartFails).is_some() {
            return Err(BleError::ScanError("simulated scan start failure".to_string()));
        }
        if !self.state.is_powered() {
            return Err(BleError::RadioOff);
        }
        self.state.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.state.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn advertisements(&self) -> broadcast::Receiver<RawAdvertisement> {
        self.state.adv_tx.subscribe()
    }

    async fn radio_state(&self) -> RadioState {
        if self.state.is_powered() {
            RadioState::PoweredOn
        } else {
            RadioState::PoweredOff
        }
    }

    async fn is_connected(&self, peer: &PeerHandle) -> Result<bool, BleError> {
        Ok(self.state.has_link(peer) && self.network.device(peer).is_some())
    }

    async fn connect(&self, peer: &PeerHandle) -> Result<(), BleError> {
        if !self.state.is_powered() {
            return Err(BleError::RadioOff);
        }
        let fault = self.state.take_fault(SimFault::is_connect);
        if fault == Some(SimFault::ConnectFails) {
            return Err(BleError::ConnectionError(format!(
                "simulated connect failure to {}",
                peer
            )));
        }
        let target = self.target(peer)?;
        if !target.is_powered() {
            return Err(BleError::ConnectionError(format!("{} is not reachable", peer)));
        }
        self.state.set_link(peer, true);
        if fault == Some(SimFault::ConnectAlreadyConnected) {
            return Err(BleError::AlreadyConnected);
        }
        Ok(())
    }

    async fn disconnect(&self, peer: &PeerHandle) -> Result<(), BleError> {
        self.state.set_link(peer, false);
        Ok(())
    }

    async fn services(&self, peer: &PeerHandle) -> Result<Vec<GattServiceInfo>, BleError> {
        if !self.state.has_link(peer) {
            return Err(BleError::Disconnected);
        }
        let target = self.target(peer)?;
        let services = target
            .services
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        Ok(services)
    }

    async fn write(
        &self,
        peer: &PeerHandle,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), BleError> {
        if !self.state.has_link(peer) {
            return Err(BleError::Disconnected);
        }
        match self.state.take_fault(SimFault::is_write) {
            Some(SimFault::WriteDisconnect) => {
                self.state.set_link(peer, false);
                return Err(BleError::Disconnected);
            }
            Some(SimFault::WriteCancelled) => return Err(BleError::OperationCancelled),
            Some(_) => {
                return Err(BleError::GattError("simulated write failure".to_string()));
            }
            None => {}
        }

        let target = self.target(peer)?;
        {
            let services = target
                .services
                .lock()
                .map_err(|_| BleError::GattError("service table poisoned".to_string()))?;
            let hosted = services
                .iter()
                .find(|s| s.uuid == service)
                .ok_or(BleError::ServiceNotFound(service))?;
            if !hosted.has_characteristic(&characteristic) {
                return Err(BleError::CharacteristicNotFound(characteristic));
            }
        }

        let encoding = target
            .value_encoding
            .lock()
            .map(|e| *e)
            .unwrap_or_default();
        let value = match encoding {
            SimValueEncoding::Bytes => InboundValue::Bytes(data.to_vec()),
            SimValueEncoding::Base64Text => {
                InboundValue::Text(base64::engine::general_purpose::STANDARD.encode(data))
            }
        };
        target.writes_received.fetch_add(1, Ordering::SeqCst);
        let _ = target.write_tx.send(InboundWrite {
            from: Some(self.state.address.clone()),
            service,
            characteristic,
            value,
        });
        Ok(())
    }
}

#[async_trait]
impl BlePeripheral for SimBleDevice {
    async fn start_advertising(&self, data: AdvertisingData) -> Result<(), BleError> {
        if !self.state.is_powered() {
            return Err(BleError::RadioOff);
        }
        self.state.abort_advertiser();
        if let Ok(mut current) = self.state.current_adv.lock() {
            *current = Some(data.clone());
        }

        let network: Weak<SimBleNetwork> = Arc::downgrade(&self.network);
        let from = self.state.address.clone();
        let interval = self.network.adv_interval;
        let handle = tokio::spawn(async move {
            loop {
                match network.upgrade() {
                    Some(net) => net.deliver_advertisement(&from, &data),
                    None => break,
                }
                tokio::time::sleep(interval).await;
            }
        });
        if let Ok(mut advertiser) = self.state.advertiser.lock() {
            *advertiser = Some(handle);
        }
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), BleError> {
        self.state.abort_advertiser();
        if let Ok(mut current) = self.state.current_adv.lock() {
            *current = None;
        }
        Ok(())
    }

    async fn add_service(&self, service: Uuid, characteristic: Uuid) -> Result<(), BleError> {
        let mut services = self
            .state
            .services
            .lock()
            .map_err(|_| BleError::GattError("service table poisoned".to_string()))?;
        match services.iter_mut().find(|s| s.uuid == service) {
            Some(existing) => {
                if !existing.has_characteristic(&characteristic) {
                    existing.characteristics.push(characteristic);
                }
            }
            None => services.push(GattServiceInfo {
                uuid: service,
                characteristics: vec![characteristic],
            }),
        }
        Ok(())
    }

    async fn clear_services(&self) -> Result<(), BleError> {
        if let Ok(mut services) = self.state.services.lock() {
            services.clear();
        }
        Ok(())
    }

    fn inbound_writes(&self) -> broadcast::Receiver<InboundWrite> {
        self.state.write_tx.subscribe()
    }
}

impl RadioProvider for SimBleDevice {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn central(&self) -> Option<Arc<dyn BleCentral>> {
        Some(Arc::new(self.clone()))
    }

    fn peripheral(&self) -> Option<Arc<dyn BlePeripheral>> {
        Some(Arc::new(self.clone()))
    }
}
