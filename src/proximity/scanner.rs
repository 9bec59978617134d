//! Peer Scanner
//!
//! Turns raw advertisement observations into a ranked table of nearby
//! protocol peers. Each qualifying observation upserts the table and the
//! whole table is re-emitted, strongest signal first, so callers always
//! hold the authoritative current view rather than a diff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};

use crate::ble::frame::{decode, decode_legacy, strip_manufacturer_prefix, AdvFrame};
use crate::ble::gatt::CARD_SERVICE_UUID;
use crate::ble::transport::{BleCentral, PeerHandle, RadioState, RawAdvertisement};
use crate::ble::BleError;
use crate::config::ScanConfig;

use super::capability::CapabilityGate;

#[derive(Debug, Clone, PartialEq)]
pub struct ScanOptions {
    pub min_rssi: i16,
    pub max_distance_meters: Option<f64>,
    /// Stop the session automatically after this long.
    pub timeout: Option<Duration>,
    pub measured_power: i16,
    pub path_loss_exponent: f64,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self::from(&ScanConfig::default())
    }
}

impl From<&ScanConfig> for ScanOptions {
    fn from(config: &ScanConfig) -> Self {
        Self {
            min_rssi: config.min_rssi,
            max_distance_meters: config.max_distance_meters,
            timeout: (config.timeout_ms > 0).then(|| Duration::from_millis(config.timeout_ms)),
            measured_power: config.measured_power,
            path_loss_exponent: config.path_loss_exponent,
        }
    }
}

/// Where a peer's payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSource {
    Frame,
    LegacyLetter,
    LegacyJson,
    /// Nothing decodable, but the peer advertises the card service.
    ServiceId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScannedPeer {
    pub id: PeerHandle,
    pub name: Option<String>,
    pub rssi: i16,
    pub distance_meters: f64,
    pub payload: AdvFrame,
    pub source: PayloadSource,
}

/// Log-distance path-loss estimate in metres. Advisory only.
pub fn estimate_distance(rssi: i16, measured_power: i16, path_loss_exponent: f64) -> f64 {
    let exponent = (f64::from(measured_power) - f64::from(rssi)) / (10.0 * path_loss_exponent);
    10f64.powf(exponent)
}

/// Recognize this protocol in an observation.
pub fn decode_observation(adv: &RawAdvertisement) -> Option<(AdvFrame, PayloadSource)> {
    if let Some(data) = &adv.manufacturer_data {
        let data = strip_manufacturer_prefix(data);
        let decoded = match data {
            [_] => decode_legacy(data).map(|f| (f, PayloadSource::LegacyLetter)),
            [b'{', ..] => decode_legacy(data).map(|f| (f, PayloadSource::LegacyJson)),
            _ => decode(data)
                .filter(AdvFrame::is_supported)
                .map(|f| (f, PayloadSource::Frame)),
        };
        if decoded.is_some() {
            return decoded;
        }
    }
    adv.service_ids
        .contains(&CARD_SERVICE_UUID)
        .then(|| (AdvFrame::ready_placeholder(), PayloadSource::ServiceId))
}

/// Peers visible in one scan session, keyed by transport id.
#[derive(Debug)]
pub struct PeerTable {
    options: ScanOptions,
    peers: HashMap<PeerHandle, ScannedPeer>,
}

impl PeerTable {
    pub fn new(options: ScanOptions) -> Self {
        Self {
            options,
            peers: HashMap::new(),
        }
    }

    /// Apply one observation. Returns whether the table changed.
    pub fn observe(&mut self, adv: RawAdvertisement) -> bool {
        if adv.rssi < self.options.min_rssi {
            log::trace!("{} below RSSI floor ({} dBm)", adv.id, adv.rssi);
            return false;
        }
        let Some((payload, source)) = decode_observation(&adv) else {
            log::trace!("{} does not speak the card protocol", adv.id);
            return false;
        };
        let distance_meters = estimate_distance(
            adv.rssi,
            self.options.measured_power,
            self.options.path_loss_exponent,
        );
        if let Some(max) = self.options.max_distance_meters {
            if distance_meters > max {
                log::trace!("{} too far away ({:.1} m)", adv.id, distance_meters);
                return false;
            }
        }

        self.peers.insert(
            adv.id.clone(),
            ScannedPeer {
                id: adv.id,
                name: adv.name,
                rssi: adv.rssi,
                distance_meters,
                payload,
                source,
            },
        );
        true
    }

    /// All peers, strongest signal first.
    pub fn snapshot(&self) -> Vec<ScannedPeer> {
        let mut peers: Vec<ScannedPeer> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.id.cmp(&b.id)));
        peers
    }

    pub fn get(&self, id: &PeerHandle) -> Option<&ScannedPeer> {
        self.peers.get(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

pub type UpdateCallback = Arc<dyn Fn(Vec<ScannedPeer>) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(BleError) + Send + Sync>;

#[derive(Clone)]
pub struct ScanCallbacks {
    pub on_update: UpdateCallback,
    pub on_error: ErrorCallback,
}

impl ScanCallbacks {
    pub fn new(
        on_update: impl Fn(Vec<ScannedPeer>) + Send + Sync + 'static,
        on_error: impl Fn(BleError) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_update: Arc::new(on_update),
            on_error: Arc::new(on_error),
        }
    }
}

struct ScanSession {
    central: Option<Arc<dyn BleCentral>>,
    stopped: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl ScanSession {
    fn new(central: Option<Arc<dyn BleCentral>>) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            central,
            stopped: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    fn stopped(central: Option<Arc<dyn BleCentral>>) -> Arc<Self> {
        let session = Self::new(central);
        session.stopped.store(true, Ordering::SeqCst);
        session
    }

    /// Returns false if the session was already stopped.
    async fn finish(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.shutdown_tx.send(());
        if let Some(central) = &self.central {
            if let Err(e) = central.stop_scan().await {
                log::warn!("Failed to stop scan: {}", e);
            }
        }
        true
    }
}

/// Handle to a running scan session.
#[derive(Clone)]
pub struct ScanHandle {
    session: Arc<ScanSession>,
}

impl ScanHandle {
    /// Stop the session. Safe to call repeatedly and after the timeout fired.
    pub async fn stop(&self) {
        if self.session.finish().await {
            log::info!("Scan stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        !self.session.stopped.load(Ordering::SeqCst)
    }
}

type OpenedScan = (Arc<dyn BleCentral>, broadcast::Receiver<RawAdvertisement>);

pub struct PeerScanner {
    central: Option<Arc<dyn BleCentral>>,
    gate: Arc<CapabilityGate>,
    active: Mutex<Option<ScanHandle>>,
}

impl PeerScanner {
    pub fn new(central: Option<Arc<dyn BleCentral>>, gate: Arc<CapabilityGate>) -> Arc<Self> {
        Arc::new(Self {
            central,
            gate,
            active: Mutex::new(None),
        })
    }

    /// Start a scan session, stopping any session already running.
    ///
    /// A start failure is reported once through `on_error` and the returned
    /// handle is already inactive; there is no automatic retry.
    pub async fn start(&self, callbacks: ScanCallbacks, options: ScanOptions) -> ScanHandle {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            previous.stop().await;
        }

        let handle = match self.open_session().await {
            Ok((central, adv_rx)) => {
                let session = ScanSession::new(Some(central));
                tokio::spawn(pump(session.clone(), adv_rx, callbacks, options));
                log::info!("Scan started");
                ScanHandle { session }
            }
            Err(e) => {
                log::warn!("Scan could not start: {}", e);
                (callbacks.on_error)(e);
                ScanHandle {
                    session: ScanSession::stopped(None),
                }
            }
        };
        *active = Some(handle.clone());
        handle
    }

    async fn open_session(&self) -> Result<OpenedScan, BleError> {
        if !self.gate.acquire().await {
            return Err(BleError::PermissionDenied);
        }
        let central = self
            .central
            .clone()
            .ok_or_else(|| BleError::Unsupported("no central role on this radio".to_string()))?;
        if central.radio_state().await == RadioState::PoweredOff {
            return Err(BleError::RadioOff);
        }
        // Subscribe first so nothing observed right after the start is lost.
        let adv_rx = central.advertisements();
        central.start_scan().await?;
        Ok((central, adv_rx))
    }

    /// Stop the current session, if any.
    pub async fn stop(&self) {
        if let Some(handle) = self.active.lock().await.take() {
            handle.stop().await;
        }
    }

    pub async fn is_scanning(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .map(ScanHandle::is_active)
            .unwrap_or(false)
    }
}

async fn pump(
    session: Arc<ScanSession>,
    mut adv_rx: broadcast::Receiver<RawAdvertisement>,
    callbacks: ScanCallbacks,
    options: ScanOptions,
) {
    let mut shutdown_rx = session.shutdown_tx.subscribe();
    // Stopped between spawn and subscribe.
    if session.stopped.load(Ordering::SeqCst) {
        return;
    }
    let timeout = options.timeout;
    let deadline = tokio::time::sleep(timeout.unwrap_or(Duration::MAX));
    tokio::pin!(deadline);
    let mut table = PeerTable::new(options);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            _ = &mut deadline, if timeout.is_some() => {
                if session.finish().await {
                    log::info!("Scan timed out after {:?}", timeout);
                }
                break;
            }
            received = adv_rx.recv() => match received {
                Ok(adv) => {
                    if table.observe(adv) && !session.stopped.load(Ordering::SeqCst) {
                        (callbacks.on_update)(table.snapshot());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::debug!("Scanner lagged, {} observations dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
