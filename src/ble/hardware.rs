//! btleplug-backed central adapter
//!
//! btleplug only implements the central role, so [`HardwareRadio`] offers
//! scanning and writing but no peripheral. Platform quirks (event shapes,
//! error strings) are absorbed here and never reach the protocol roles.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures_util::StreamExt;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::gatt::TEST_MANUFACTURER_ID;
use super::transport::{
    BleCentral, BlePeripheral, GattServiceInfo, PeerHandle, RadioProvider, RawAdvertisement,
};
use super::BleError;

/// RSSI reported for a peripheral whose properties carry none.
const UNKNOWN_RSSI: i16 = -100;

/// Radio provider backed by the first btleplug adapter.
pub struct HardwareRadio {
    central: Arc<HardwareCentral>,
}

impl HardwareRadio {
    pub async fn open() -> Result<Self, BleError> {
        let manager = Manager::new().await.map_err(map_btleplug_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(map_btleplug_error)?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::Unsupported("no BLE adapter found".to_string()))?;
        Ok(Self {
            central: Arc::new(HardwareCentral::new(adapter)),
        })
    }
}

impl RadioProvider for HardwareRadio {
    fn name(&self) -> &'static str {
        "btleplug"
    }

    fn central(&self) -> Option<Arc<dyn BleCentral>> {
        Some(self.central.clone())
    }

    fn peripheral(&self) -> Option<Arc<dyn BlePeripheral>> {
        None
    }
}

pub struct HardwareCentral {
    adapter: Adapter,
    peripherals: Arc<RwLock<HashMap<PeerHandle, Peripheral>>>,
    adv_tx: broadcast::Sender<RawAdvertisement>,
    event_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HardwareCentral {
    fn new(adapter: Adapter) -> Self {
        let (adv_tx, _) = broadcast::channel(256);
        Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            adv_tx,
            event_task: std::sync::Mutex::new(None),
        }
    }

    /// Look up a peer seen while scanning. Peers pruned after a scan are
    /// found again through the adapter's own cache.
    async fn peripheral(&self, peer: &PeerHandle) -> Result<Peripheral, BleError> {
        if let Some(found) = self.peripherals.read().await.get(peer).cloned() {
            return Ok(found);
        }
        let found = self
            .adapter
            .peripherals()
            .await
            .map_err(map_btleplug_error)?
            .into_iter()
            .find(|p| handle_for(&p.id()) == *peer)
            .ok_or_else(|| BleError::ConnectionError(format!("Unknown peer {}", peer)))?;
        self.peripherals
            .write()
            .await
            .insert(peer.clone(), found.clone());
        Ok(found)
    }

    /// Forget every peer without a live link.
    async fn prune_idle(&self) {
        let mut peripherals = self.peripherals.write().await;
        let mut connected = HashSet::new();
        for (handle, peripheral) in peripherals.iter() {
            if peripheral.is_connected().await.unwrap_or(false) {
                connected.insert(handle.clone());
            }
        }
        let before = peripherals.len();
        retain_peers(&mut peripherals, &connected);
        log::debug!("Pruned {} idle peripheral(s)", before - peripherals.len());
    }

    fn abort_event_task(&self) {
        if let Ok(mut task) = self.event_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

fn retain_peers<T>(entries: &mut HashMap<PeerHandle, T>, keep: &HashSet<PeerHandle>) {
    entries.retain(|handle, _| keep.contains(handle));
}

fn handle_for(id: &PeripheralId) -> PeerHandle {
    PeerHandle::new(format!("{:?}", id))
}

/// Turn a discovery/update event into an observation and remember the
/// peripheral so later connects can find it.
async fn observe(
    adapter: &Adapter,
    id: &PeripheralId,
    peripherals: &RwLock<HashMap<PeerHandle, Peripheral>>,
    adv_tx: &broadcast::Sender<RawAdvertisement>,
) -> Result<(), btleplug::Error> {
    let peripheral = adapter.peripheral(id).await?;
    let Some(props) = peripheral.properties().await? else {
        return Ok(());
    };
    let handle = handle_for(id);
    let adv = RawAdvertisement {
        id: handle.clone(),
        name: props.local_name,
        rssi: props.rssi.unwrap_or(UNKNOWN_RSSI),
        service_ids: props.services,
        // btleplug keys manufacturer data by company id, prefix already stripped.
        manufacturer_data: props.manufacturer_data.get(&TEST_MANUFACTURER_ID).cloned(),
    };
    peripherals.write().await.insert(handle, peripheral);
    let _ = adv_tx.send(adv);
    Ok(())
}

#[async_trait]
impl BleCentral for HardwareCentral {
    async fn start_scan(&self) -> Result<(), BleError> {
        let mut events = self.adapter.events().await.map_err(map_btleplug_error)?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(map_btleplug_error)?;

        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();
        let adv_tx = self.adv_tx.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match &event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. }
                    | CentralEvent::ServicesAdvertisement { id, .. } => id.clone(),
                    _ => continue,
                };
                if let Err(e) = observe(&adapter, &id, &peripherals, &adv_tx).await {
                    log::trace!("Dropping observation of {:?}: {}", id, e);
                }
            }
        });

        self.abort_event_task();
        if let Ok(mut slot) = self.event_task.lock() {
            *slot = Some(task);
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.abort_event_task();
        let stopped = self.adapter.stop_scan().await.map_err(map_btleplug_error);
        self.prune_idle().await;
        stopped
    }

    fn advertisements(&self) -> broadcast::Receiver<RawAdvertisement> {
        self.adv_tx.subscribe()
    }

    async fn is_connected(&self, peer: &PeerHandle) -> Result<bool, BleError> {
        let peripheral = self.peripheral(peer).await?;
        peripheral.is_connected().await.map_err(map_btleplug_error)
    }

    async fn connect(&self, peer: &PeerHandle) -> Result<(), BleError> {
        let peripheral = self.peripheral(peer).await?;
        peripheral.connect().await.map_err(map_btleplug_error)?;
        peripheral
            .discover_services()
            .await
            .map_err(map_btleplug_error)
    }

    async fn disconnect(&self, peer: &PeerHandle) -> Result<(), BleError> {
        let peripheral = self.peripheral(peer).await?;
        peripheral.disconnect().await.map_err(map_btleplug_error)
    }

    async fn services(&self, peer: &PeerHandle) -> Result<Vec<GattServiceInfo>, BleError> {
        let peripheral = self.peripheral(peer).await?;
        if peripheral.services().is_empty() {
            peripheral
                .discover_services()
                .await
                .map_err(map_btleplug_error)?;
        }
        Ok(peripheral
            .services()
            .into_iter()
            .map(|service| GattServiceInfo {
                uuid: service.uuid,
                characteristics: service.characteristics.iter().map(|c| c.uuid).collect(),
            })
            .collect())
    }

    async fn write(
        &self,
        peer: &PeerHandle,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), BleError> {
        let peripheral = self.peripheral(peer).await?;
        let target = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic);
        let Some(target) = target else {
            let hosts_service = peripheral.services().iter().any(|s| s.uuid == service);
            return Err(if hosts_service {
                BleError::CharacteristicNotFound(characteristic)
            } else {
                BleError::ServiceNotFound(service)
            });
        };
        peripheral
            .write(&target, data, WriteType::WithResponse)
            .await
            .map_err(map_btleplug_error)
    }
}

fn map_btleplug_error(err: btleplug::Error) -> BleError {
    match err {
        btleplug::Error::PermissionDenied => BleError::PermissionDenied,
        btleplug::Error::NotConnected => BleError::Disconnected,
        btleplug::Error::NotSupported(what) => BleError::Unsupported(what),
        btleplug::Error::TimedOut(_) => BleError::Timeout,
        other => BleError::from_platform_message(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            map_btleplug_error(btleplug::Error::NotConnected),
            BleError::Disconnected
        ));
        assert!(matches!(
            map_btleplug_error(btleplug::Error::PermissionDenied),
            BleError::PermissionDenied
        ));
        assert!(matches!(
            map_btleplug_error(btleplug::Error::TimedOut(Duration::from_secs(5))),
            BleError::Timeout
        ));
        assert!(matches!(
            map_btleplug_error(btleplug::Error::RuntimeError(
                "Operation was cancelled".to_string()
            )),
            BleError::OperationCancelled
        ));
    }

    #[test]
    fn test_retain_peers_keeps_only_connected() {
        let mut entries: HashMap<PeerHandle, u8> = (0..4)
            .map(|i| (PeerHandle::new(format!("peer-{}", i)), i))
            .collect();
        let keep: HashSet<PeerHandle> = [PeerHandle::new("peer-2")].into_iter().collect();

        retain_peers(&mut entries, &keep);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries.get(&PeerHandle::new("peer-2")), Some(&2));
    }
}
