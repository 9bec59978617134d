//! Broadcaster
//!
//! Owns the device's single advertising set. READY presence runs until
//! stopped; REQUEST/ACCEPT announcements expire on their own so stale
//! frames do not linger on the air.
//!
//! Radio trouble never surfaces to callers: without capability, without a
//! peripheral role, or when the stack rejects the advertisement, the
//! broadcaster still reports itself as advertising and logs a warning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::ble::frame::{letter_for_label, random_nonce, AdvFrame, Opcode};
use crate::ble::gatt::{device_name_for, CARD_SERVICE_UUID, TEST_MANUFACTURER_ID};
use crate::ble::transport::{AdvertisingData, BlePeripheral};
use crate::config::BroadcastConfig;

use super::capability::CapabilityGate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertisingMode {
    Ready,
    Request,
    Accept,
}

impl AdvertisingMode {
    fn opcode(&self) -> Opcode {
        match self {
            AdvertisingMode::Ready => Opcode::Ready,
            AdvertisingMode::Request => Opcode::Request,
            AdvertisingMode::Accept => Opcode::Accept,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcasterState {
    Idle,
    Advertising(AdvertisingMode),
}

struct BroadcastInner {
    state: BroadcasterState,
    frame: Option<AdvFrame>,
    /// Bumped on every start so an expiry timer only stops the mode it was
    /// armed for.
    generation: u64,
    auto_stop: Option<JoinHandle<()>>,
    /// Whether the radio actually accepted the current advertisement.
    on_air: bool,
}

pub struct Broadcaster {
    peripheral: Option<Arc<dyn BlePeripheral>>,
    gate: Arc<CapabilityGate>,
    config: BroadcastConfig,
    advertising: AtomicBool,
    inner: Mutex<BroadcastInner>,
}

impl Broadcaster {
    pub fn new(
        peripheral: Option<Arc<dyn BlePeripheral>>,
        gate: Arc<CapabilityGate>,
        config: BroadcastConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            peripheral,
            gate,
            config,
            advertising: AtomicBool::new(false),
            inner: Mutex::new(BroadcastInner {
                state: BroadcasterState::Idle,
                frame: None,
                generation: 0,
                auto_stop: None,
                on_air: false,
            }),
        })
    }

    /// Advertise READY presence for `label` until stopped.
    pub async fn start_ready(self: &Arc<Self>, label: &str, card_id_short: &str) -> AdvFrame {
        let frame = AdvFrame::new(
            Opcode::Ready,
            letter_for_label(label),
            random_nonce(),
            card_id_short,
        );
        self.start(AdvertisingMode::Ready, frame, label, None).await
    }

    /// Announce a REQUEST. `auto_stop` of `None` uses the configured TTL.
    pub async fn start_request(
        self: &Arc<Self>,
        letter: char,
        nonce: [u8; 4],
        card_id_short: &str,
        auto_stop: Option<Duration>,
    ) -> AdvFrame {
        self.start_announcement(AdvertisingMode::Request, letter, nonce, card_id_short, auto_stop)
            .await
    }

    /// Announce an ACCEPT, echoing the nonce of the REQUEST it answers.
    pub async fn start_accept(
        self: &Arc<Self>,
        letter: char,
        nonce: [u8; 4],
        card_id_short: &str,
        auto_stop: Option<Duration>,
    ) -> AdvFrame {
        self.start_announcement(AdvertisingMode::Accept, letter, nonce, card_id_short, auto_stop)
            .await
    }

    async fn start_announcement(
        self: &Arc<Self>,
        mode: AdvertisingMode,
        letter: char,
        nonce: [u8; 4],
        card_id_short: &str,
        auto_stop: Option<Duration>,
    ) -> AdvFrame {
        let frame = AdvFrame::new(mode.opcode(), letter, nonce, card_id_short);
        let ttl = auto_stop.unwrap_or_else(|| self.config.announce_ttl());
        self.start(mode, frame, &frame_label(letter), Some(ttl)).await
    }

    async fn start(
        self: &Arc<Self>,
        mode: AdvertisingMode,
        frame: AdvFrame,
        label: &str,
        ttl: Option<Duration>,
    ) -> AdvFrame {
        let mut inner = self.inner.lock().await;
        if inner.state != BroadcasterState::Idle {
            log::debug!("Replacing advertising mode {:?} with {:?}", inner.state, mode);
            self.halt(&mut inner).await;
        }

        inner.generation += 1;
        let generation = inner.generation;
        inner.on_air = self.begin(mode, &frame, label).await;
        inner.state = BroadcasterState::Advertising(mode);
        inner.frame = Some(frame.clone());
        self.advertising.store(true, Ordering::SeqCst);

        if let Some(ttl) = ttl {
            let this = Arc::clone(self);
            inner.auto_stop = Some(tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                this.expire(generation).await;
            }));
        }
        frame
    }

    /// Put the frame on the air. Returns whether the radio took it.
    async fn begin(&self, mode: AdvertisingMode, frame: &AdvFrame, label: &str) -> bool {
        if !self.gate.acquire().await {
            log::warn!("Advertising {:?} in degraded mode: radio capability not granted", mode);
            return false;
        }
        let Some(peripheral) = &self.peripheral else {
            log::warn!("Advertising {:?} in degraded mode: no peripheral role on this radio", mode);
            return false;
        };

        let manufacturer_data = if mode == AdvertisingMode::Ready && self.config.legacy_ready_payload
        {
            vec![frame.letter() as u8]
        } else {
            frame.to_bytes()
        };
        let data = AdvertisingData {
            local_name: self
                .config
                .include_device_name
                .then(|| device_name_for(label)),
            service_ids: vec![CARD_SERVICE_UUID],
            manufacturer_id: TEST_MANUFACTURER_ID,
            manufacturer_data,
            connectable: true,
        };

        match peripheral.start_advertising(data).await {
            Ok(()) => {
                log::info!("Advertising {}", frame);
                true
            }
            Err(e) => {
                log::warn!("Advertising {:?} in degraded mode: {}", mode, e);
                false
            }
        }
    }

    async fn expire(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.state == BroadcasterState::Idle {
            return;
        }
        // This task is the timer; detach rather than abort it.
        inner.auto_stop = None;
        log::debug!("Announcement {:?} expired", inner.state);
        self.halt(&mut inner).await;
    }

    /// Stop advertising. Stopping while idle is a no-op.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == BroadcasterState::Idle {
            return;
        }
        self.halt(&mut inner).await;
    }

    async fn halt(&self, inner: &mut BroadcastInner) {
        if let Some(timer) = inner.auto_stop.take() {
            timer.abort();
        }
        if inner.on_air {
            if let Some(peripheral) = &self.peripheral {
                if let Err(e) = peripheral.stop_advertising().await {
                    log::warn!("Failed to stop advertising: {}", e);
                }
            }
        }
        inner.on_air = false;
        inner.state = BroadcasterState::Idle;
        inner.frame = None;
        self.advertising.store(false, Ordering::SeqCst);
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> BroadcasterState {
        self.inner.lock().await.state
    }

    /// Frame of the current mode, if any.
    pub async fn current_frame(&self) -> Option<AdvFrame> {
        self.inner.lock().await.frame.clone()
    }
}

fn frame_label(letter: char) -> String {
    letter.to_ascii_uppercase().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::frame::decode;
    use crate::ble::null::NullRadio;
    use crate::ble::simulated::{SimBleDevice, SimBleNetwork};
    use crate::ble::transport::RadioProvider;
    use crate::proximity::capability::{Capability, FixedGrants, RadioApiGeneration};

    fn broadcaster_on(device: &SimBleDevice, config: BroadcastConfig) -> Arc<Broadcaster> {
        Broadcaster::new(
            device.peripheral(),
            Arc::new(CapabilityGate::unrestricted()),
            config,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_advertises_until_stopped() {
        let network = SimBleNetwork::new();
        let device = network.create_device();
        let broadcaster = broadcaster_on(&device, BroadcastConfig::default());

        let frame = broadcaster.start_ready("jane", "card42").await;
        assert_eq!(frame.letter(), 'J');
        assert!(broadcaster.is_advertising());
        assert_eq!(
            broadcaster.state().await,
            BroadcasterState::Advertising(AdvertisingMode::Ready)
        );

        let adv = device.current_advertisement().unwrap();
        assert_eq!(adv.service_ids, vec![CARD_SERVICE_UUID]);
        assert_eq!(adv.manufacturer_id, TEST_MANUFACTURER_ID);
        assert!(adv.local_name.unwrap().starts_with("TravelCard_jane_"));
        let on_air = decode(&adv.manufacturer_data).unwrap();
        assert_eq!(on_air, frame);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(broadcaster.is_advertising());

        broadcaster.stop().await;
        assert!(!broadcaster.is_advertising());
        assert!(!device.is_advertising());
        // Idempotent.
        broadcaster.stop().await;
        assert_eq!(broadcaster.state().await, BroadcasterState::Idle);
    }

    #[tokio::test]
    async fn test_legacy_ready_payload() {
        let network = SimBleNetwork::new();
        let device = network.create_device();
        let config = BroadcastConfig {
            legacy_ready_payload: true,
            include_device_name: false,
            ..BroadcastConfig::default()
        };
        let broadcaster = broadcaster_on(&device, config);

        broadcaster.start_ready("Kim", "ignored").await;
        let adv = device.current_advertisement().unwrap();
        assert_eq!(adv.manufacturer_data, b"K".to_vec());
        assert_eq!(adv.local_name, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_auto_stops() {
        let network = SimBleNetwork::new();
        let device = network.create_device();
        let broadcaster = broadcaster_on(&device, BroadcastConfig::default());

        let frame = broadcaster
            .start_request('J', [1, 2, 3, 4], "abc123", None)
            .await;
        assert_eq!(frame.opcode(), Some(Opcode::Request));
        assert!(device.is_advertising());

        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert!(broadcaster.is_advertising());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!broadcaster.is_advertising());
        assert!(!device.is_advertising());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_does_not_stop_newer_mode() {
        let network = SimBleNetwork::new();
        let device = network.create_device();
        let broadcaster = broadcaster_on(&device, BroadcastConfig::default());

        broadcaster
            .start_request('J', [9; 4], "abc", Some(Duration::from_millis(500)))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        broadcaster.start_ready("Jane", "abc").await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            broadcaster.state().await,
            BroadcasterState::Advertising(AdvertisingMode::Ready)
        );
        assert!(device.is_advertising());
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_writer_wins() {
        let network = SimBleNetwork::new();
        let device = network.create_device();
        let broadcaster = broadcaster_on(&device, BroadcastConfig::default());

        broadcaster.start_ready("Ann", "card").await;
        let accept = broadcaster
            .start_accept('K', [7, 7, 7, 7], "abc123", Some(Duration::from_secs(5)))
            .await;

        assert_eq!(
            broadcaster.state().await,
            BroadcasterState::Advertising(AdvertisingMode::Accept)
        );
        let adv = device.current_advertisement().unwrap();
        assert_eq!(decode(&adv.manufacturer_data).unwrap(), accept);
        assert_eq!(broadcaster.current_frame().await, Some(accept));
    }

    #[tokio::test]
    async fn test_degraded_without_peripheral() {
        let broadcaster = Broadcaster::new(
            NullRadio.peripheral(),
            Arc::new(CapabilityGate::unrestricted()),
            BroadcastConfig::default(),
        );
        broadcaster.start_ready("Ann", "card").await;
        assert!(broadcaster.is_advertising());
        broadcaster.stop().await;
        assert!(!broadcaster.is_advertising());
    }

    #[tokio::test]
    async fn test_degraded_when_capability_denied() {
        let network = SimBleNetwork::new();
        let device = network.create_device();
        let gate = CapabilityGate::new(
            RadioApiGeneration::Modern,
            Arc::new(FixedGrants::new([Capability::Scan])),
        );
        let broadcaster =
            Broadcaster::new(device.peripheral(), Arc::new(gate), BroadcastConfig::default());

        broadcaster.start_ready("Ann", "card").await;
        assert!(broadcaster.is_advertising());
        assert!(!device.is_advertising());
    }

    #[tokio::test]
    async fn test_degraded_when_radio_rejects() {
        let network = SimBleNetwork::new();
        let device = network.create_device();
        device.set_powered(false);
        let broadcaster = broadcaster_on(&device, BroadcastConfig::default());

        broadcaster.start_ready("Ann", "card").await;
        assert!(broadcaster.is_advertising());
        assert!(!device.is_advertising());
    }
}
