//! Proximity discovery and card exchange
//!
//! The four protocol roles (broadcaster, scanner, listener, sender) share
//! one radio provider and one capability gate. [`ProximityNode`] builds
//! them once per process and hands out references; no role touches
//! another's state.

pub mod broadcaster;
pub mod capability;
pub mod listener;
pub mod scanner;
pub mod sender;

use std::sync::Arc;

use crate::ble::transport::{PeerHandle, RadioCapabilities, RadioProvider};
use crate::ble::BleError;
use crate::config::ProximityConfig;

use self::broadcaster::Broadcaster;
use self::capability::CapabilityGate;
use self::listener::{ListenerEvent, ListenerSubscription, PeripheralListener};
use self::scanner::{PeerScanner, ScanCallbacks, ScanHandle, ScanOptions};
use self::sender::{CentralSender, SendOptions, SendReport};

/// Consumer of received cards, typically an inbox view backed by the card
/// store. Only opaque identifiers cross this boundary.
pub trait CardInbox: Send + Sync {
    fn card_received(&self, sender: &str, doc_id: &str);

    /// A write arrived that was not a transfer packet.
    fn malformed_packet(&self, raw: &str) {
        log::debug!("Inbox ignoring malformed packet {:?}", raw);
    }
}

pub struct ProximityNode {
    radio: Arc<dyn RadioProvider>,
    config: ProximityConfig,
    gate: Arc<CapabilityGate>,
    broadcaster: Arc<Broadcaster>,
    scanner: Arc<PeerScanner>,
    listener: PeripheralListener,
    sender: CentralSender,
}

impl ProximityNode {
    pub fn new(radio: Arc<dyn RadioProvider>, gate: CapabilityGate, config: ProximityConfig) -> Self {
        let gate = Arc::new(gate);
        let caps = radio.capabilities();
        log::info!(
            "Proximity node on {} radio (central: {}, peripheral: {})",
            radio.name(),
            caps.central,
            caps.peripheral
        );

        let broadcaster =
            Broadcaster::new(radio.peripheral(), gate.clone(), config.broadcast.clone());
        let scanner = PeerScanner::new(radio.central(), gate.clone());
        let listener = PeripheralListener::new(radio.peripheral(), gate.clone());
        let sender = CentralSender::new(radio.central(), gate.clone());

        Self {
            radio,
            config,
            gate,
            broadcaster,
            scanner,
            listener,
            sender,
        }
    }

    /// Node on an ungated platform with default settings.
    pub fn with_defaults(radio: Arc<dyn RadioProvider>) -> Self {
        Self::new(radio, CapabilityGate::unrestricted(), ProximityConfig::default())
    }

    pub fn radio_name(&self) -> &'static str {
        self.radio.name()
    }

    pub fn capabilities(&self) -> RadioCapabilities {
        self.radio.capabilities()
    }

    pub fn config(&self) -> &ProximityConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<CapabilityGate> {
        &self.gate
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn scanner(&self) -> &Arc<PeerScanner> {
        &self.scanner
    }

    pub fn listener(&self) -> &PeripheralListener {
        &self.listener
    }

    pub fn sender(&self) -> &CentralSender {
        &self.sender
    }

    /// Start a scan with the configured options.
    pub async fn scan(&self, callbacks: ScanCallbacks) -> ScanHandle {
        self.scanner
            .start(callbacks, ScanOptions::from(&self.config.scan))
            .await
    }

    /// Send a card with the configured sender options.
    pub async fn send_card(
        &self,
        peer: &PeerHandle,
        doc_id: &str,
        sender_label: &str,
    ) -> Result<SendReport, BleError> {
        let options = SendOptions::from(&self.config.sender);
        self.sender.send(peer, doc_id, sender_label, &options).await
    }

    /// Forward listener events to `inbox`.
    pub fn deliver_to(&self, inbox: Arc<dyn CardInbox>) -> ListenerSubscription {
        self.listener.on_event(move |event| match event {
            ListenerEvent::CardReceived { sender, doc_id, .. } => {
                inbox.card_received(sender, doc_id)
            }
            ListenerEvent::MalformedPacket { raw } => inbox.malformed_packet(raw),
        })
    }

    /// Stop every running role.
    pub async fn shutdown(&self) {
        self.broadcaster.stop().await;
        self.scanner.stop().await;
        self.listener.stop().await;
    }
}
