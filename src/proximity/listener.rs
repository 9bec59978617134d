//! Peripheral Listener
//!
//! Hosts the card service with its one writable characteristic and turns
//! inbound writes into [`ListenerEvent`]s for every registered observer.
//! Undecodable writes are reported as [`ListenerEvent::MalformedPacket`]
//! rather than dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::ble::gatt::{CARD_CHAR_UUID, CARD_SERVICE_UUID};
use crate::ble::packet::parse_transfer_packet;
use crate::ble::transport::{
    normalize_inbound_bytes, BlePeripheral, InboundValue, InboundWrite, PeerHandle,
};

use super::capability::CapabilityGate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Running,
    /// Started, but nothing will ever be received (no capability or no
    /// peripheral role).
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    CardReceived {
        sender: String,
        doc_id: String,
        from: Option<PeerHandle>,
    },
    MalformedPacket {
        raw: String,
    },
}

/// Decode one inbound value into the event it produces.
pub fn decode_inbound(value: InboundValue, from: Option<PeerHandle>) -> ListenerEvent {
    let bytes = normalize_inbound_bytes(value);
    let text = String::from_utf8_lossy(&bytes);
    match parse_transfer_packet(&text) {
        Some(packet) => ListenerEvent::CardReceived {
            sender: packet.sender,
            doc_id: packet.doc_id,
            from,
        },
        None => ListenerEvent::MalformedPacket {
            raw: text.into_owned(),
        },
    }
}

type Observer = Arc<dyn Fn(&ListenerEvent) + Send + Sync>;
type ObserverMap = StdMutex<HashMap<u64, Observer>>;

/// Registration returned by [`PeripheralListener::on_event`].
///
/// Dropping it keeps the observer registered; call
/// [`ListenerSubscription::unsubscribe`] to remove it.
pub struct ListenerSubscription {
    id: u64,
    observers: Weak<ObserverMap>,
}

impl ListenerSubscription {
    pub fn unsubscribe(self) {
        if let Some(observers) = self.observers.upgrade() {
            if let Ok(mut map) = observers.lock() {
                map.remove(&self.id);
            }
        }
    }
}

struct ListenerInner {
    state: ListenerState,
    pump: Option<JoinHandle<()>>,
}

pub struct PeripheralListener {
    peripheral: Option<Arc<dyn BlePeripheral>>,
    gate: Arc<CapabilityGate>,
    observers: Arc<ObserverMap>,
    next_observer: AtomicU64,
    inner: Mutex<ListenerInner>,
}

impl PeripheralListener {
    pub fn new(peripheral: Option<Arc<dyn BlePeripheral>>, gate: Arc<CapabilityGate>) -> Self {
        Self {
            peripheral,
            gate,
            observers: Arc::new(StdMutex::new(HashMap::new())),
            next_observer: AtomicU64::new(0),
            inner: Mutex::new(ListenerInner {
                state: ListenerState::Stopped,
                pump: None,
            }),
        }
    }

    /// Register an observer for decoded events.
    pub fn on_event(
        &self,
        observer: impl Fn(&ListenerEvent) + Send + Sync + 'static,
    ) -> ListenerSubscription {
        let id = self.next_observer.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut map) = self.observers.lock() {
            map.insert(id, Arc::new(observer));
        }
        ListenerSubscription {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Host the card service and start decoding writes. Calling it again
    /// while started returns the current state.
    pub async fn start(&self) -> ListenerState {
        let mut inner = self.inner.lock().await;
        if inner.state != ListenerState::Stopped {
            return inner.state;
        }

        inner.state = match self.host().await {
            Some(pump) => {
                inner.pump = Some(pump);
                log::info!("Listening for card transfers on {}", CARD_CHAR_UUID);
                ListenerState::Running
            }
            None => ListenerState::Degraded,
        };
        inner.state
    }

    async fn host(&self) -> Option<JoinHandle<()>> {
        if !self.gate.acquire().await {
            log::warn!("Listener degraded: radio capability not granted");
            return None;
        }
        let Some(peripheral) = &self.peripheral else {
            log::warn!("Listener degraded: no peripheral role on this radio");
            return None;
        };

        let writes = peripheral.inbound_writes();
        if let Err(e) = peripheral.add_service(CARD_SERVICE_UUID, CARD_CHAR_UUID).await {
            log::warn!("Listener degraded: could not host card service: {}", e);
            return None;
        }
        Some(tokio::spawn(pump(writes, self.observers.clone())))
    }

    /// Stop listening and unregister the service. No-op when stopped.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
        if inner.state == ListenerState::Running {
            if let Some(peripheral) = &self.peripheral {
                if let Err(e) = peripheral.clear_services().await {
                    log::warn!("Failed to unregister card service: {}", e);
                }
            }
        }
        inner.state = ListenerState::Stopped;
    }

    pub async fn state(&self) -> ListenerState {
        self.inner.lock().await.state
    }
}

async fn pump(mut writes: broadcast::Receiver<InboundWrite>, observers: Arc<ObserverMap>) {
    loop {
        let write = match writes.recv().await {
            Ok(write) => write,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Listener lagged, {} writes dropped", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if write.characteristic != CARD_CHAR_UUID {
            continue;
        }

        let event = decode_inbound(write.value, write.from);
        match &event {
            ListenerEvent::CardReceived { sender, doc_id, .. } => {
                log::info!("Received card {} from {:?}", doc_id, sender);
            }
            ListenerEvent::MalformedPacket { raw } => {
                log::warn!("Malformed packet received ({} bytes)", raw.len());
            }
        }

        let current: Vec<Observer> = match observers.lock() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => continue,
        };
        for observer in current {
            observer(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::null::NullRadio;
    use crate::ble::packet::create_transfer_packet;
    use crate::ble::simulated::{SimBleDevice, SimBleNetwork, SimValueEncoding};
    use crate::ble::transport::{BleCentral, RadioProvider};
    use base64::Engine as _;
    use tokio::sync::mpsc;

    fn listener_on(device: &SimBleDevice) -> PeripheralListener {
        PeripheralListener::new(device.peripheral(), Arc::new(CapabilityGate::unrestricted()))
    }

    fn collect(listener: &PeripheralListener) -> (ListenerSubscription, mpsc::UnboundedReceiver<ListenerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = listener.on_event(move |event| {
            let _ = tx.send(event.clone());
        });
        (sub, rx)
    }

    #[test]
    fn test_decode_inbound_forms() {
        let packet = create_transfer_packet("doc-1", "Alice");
        let from = Some(PeerHandle::new("peer"));

        let expected = ListenerEvent::CardReceived {
            sender: "Alice".into(),
            doc_id: "doc-1".into(),
            from: from.clone(),
        };
        assert_eq!(
            decode_inbound(InboundValue::Bytes(packet.clone().into_bytes()), from.clone()),
            expected
        );
        let encoded = base64::engine::general_purpose::STANDARD.encode(&packet);
        assert_eq!(decode_inbound(InboundValue::Text(encoded), from.clone()), expected);
        assert_eq!(decode_inbound(InboundValue::Text(packet), from), expected);
    }

    #[test]
    fn test_decode_inbound_malformed() {
        assert_eq!(
            decode_inbound(InboundValue::Bytes(b"hello".to_vec()), None),
            ListenerEvent::MalformedPacket {
                raw: "hello".into()
            }
        );
    }

    #[tokio::test]
    async fn test_start_hosts_service_and_stop_removes_it() {
        let network = SimBleNetwork::new();
        let device = network.create_device();
        let listener = listener_on(&device);

        assert_eq!(listener.start().await, ListenerState::Running);
        let services = device.hosted_services();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].uuid, CARD_SERVICE_UUID);
        assert!(services[0].has_characteristic(&CARD_CHAR_UUID));

        // Idempotent start.
        assert_eq!(listener.start().await, ListenerState::Running);
        assert_eq!(device.hosted_services().len(), 1);

        listener.stop().await;
        listener.stop().await;
        assert_eq!(listener.state().await, ListenerState::Stopped);
        assert!(device.hosted_services().is_empty());
    }

    #[tokio::test]
    async fn test_events_reach_every_observer() {
        let network = SimBleNetwork::new();
        let host = network.create_device();
        let sender = network.create_device();
        host.set_value_encoding(SimValueEncoding::Base64Text);
        let listener = listener_on(&host);
        let (_a, mut rx_a) = collect(&listener);
        let (_b, mut rx_b) = collect(&listener);
        listener.start().await;

        sender.connect(host.address()).await.unwrap();
        let packet = create_transfer_packet("doc-9", "Bob");
        sender
            .write(host.address(), CARD_SERVICE_UUID, CARD_CHAR_UUID, packet.as_bytes())
            .await
            .unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.recv().await.unwrap() {
                ListenerEvent::CardReceived { sender: label, doc_id, from } => {
                    assert_eq!(label, "Bob");
                    assert_eq!(doc_id, "doc-9");
                    assert_eq!(from.as_ref(), Some(sender.address()));
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_malformed_write_keeps_listener_alive() {
        let network = SimBleNetwork::new();
        let host = network.create_device();
        let sender = network.create_device();
        let listener = listener_on(&host);
        let (_sub, mut rx) = collect(&listener);
        listener.start().await;
        sender.connect(host.address()).await.unwrap();

        sender
            .write(host.address(), CARD_SERVICE_UUID, CARD_CHAR_UUID, b"hello")
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            ListenerEvent::MalformedPacket {
                raw: "hello".into()
            }
        );

        let packet = create_transfer_packet("doc-2", "Eve");
        sender
            .write(host.address(), CARD_SERVICE_UUID, CARD_CHAR_UUID, packet.as_bytes())
            .await
            .unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            ListenerEvent::CardReceived { .. }
        ));
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let network = SimBleNetwork::new();
        let host = network.create_device();
        let sender = network.create_device();
        let listener = listener_on(&host);
        let (kept, mut kept_rx) = collect(&listener);
        let (removed, mut removed_rx) = collect(&listener);
        assert_eq!(listener.observer_count(), 2);

        removed.unsubscribe();
        assert_eq!(listener.observer_count(), 1);

        listener.start().await;
        sender.connect(host.address()).await.unwrap();
        sender
            .write(host.address(), CARD_SERVICE_UUID, CARD_CHAR_UUID, b"x")
            .await
            .unwrap();
        assert!(kept_rx.recv().await.is_some());
        assert!(removed_rx.try_recv().is_err());
        kept.unsubscribe();
        assert_eq!(listener.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_degraded_without_peripheral() {
        let listener =
            PeripheralListener::new(NullRadio.peripheral(), Arc::new(CapabilityGate::unrestricted()));
        assert_eq!(listener.start().await, ListenerState::Degraded);
        listener.stop().await;
        assert_eq!(listener.state().await, ListenerState::Stopped);
    }
}
