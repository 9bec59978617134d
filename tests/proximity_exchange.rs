//! End-to-end card exchange over SimBleNetwork
//!
//! Each test wires two or more simulated devices through the proximity
//! roles: broadcast, scan, send and receive.
//!
//! Run with:
//!   cargo test --test proximity_exchange

use std::sync::Arc;
use std::time::Duration;

use cardbeam::ble::frame::{letter_to_code, Opcode};
use cardbeam::ble::gatt::{CARD_CHAR_UUID, CARD_SERVICE_UUID};
use cardbeam::ble::null::NullRadio;
use cardbeam::ble::simulated::{SimBleDevice, SimBleNetwork, SimFault, SimValueEncoding};
use cardbeam::ble::transport::{BleCentral, BlePeripheral, PeerHandle};
use cardbeam::ble::BleError;
use cardbeam::config::ProximityConfig;
use cardbeam::proximity::capability::{
    Capability, CapabilityGate, FixedGrants, RadioApiGeneration,
};
use cardbeam::proximity::listener::{decode_inbound, ListenerEvent, ListenerState};
use cardbeam::proximity::scanner::{PayloadSource, ScanCallbacks, ScanHandle, ScannedPeer};
use cardbeam::ProximityNode;

use tokio::sync::mpsc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn node_on(device: &SimBleDevice) -> ProximityNode {
    ProximityNode::with_defaults(Arc::new(device.clone()))
}

fn node_with_config(device: &SimBleDevice, config: ProximityConfig) -> ProximityNode {
    ProximityNode::new(
        Arc::new(device.clone()),
        CapabilityGate::unrestricted(),
        config,
    )
}

async fn start_scan(node: &ProximityNode) -> (ScanHandle, mpsc::UnboundedReceiver<Vec<ScannedPeer>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = node
        .scan(ScanCallbacks::new(
            move |peers| {
                let _ = tx.send(peers);
            },
            |e| panic!("scan failed: {}", e),
        ))
        .await;
    (handle, rx)
}

/// Wait for the first snapshot satisfying `pred`.
async fn wait_for_snapshot(
    rx: &mut mpsc::UnboundedReceiver<Vec<ScannedPeer>>,
    pred: impl Fn(&[ScannedPeer]) -> bool,
) -> Vec<ScannedPeer> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = rx.recv().await.expect("scan session ended");
            if pred(&snapshot) {
                return snapshot;
            }
        }
    })
    .await
    .expect("timed out waiting for peers")
}

fn collect_events(node: &ProximityNode) -> mpsc::UnboundedReceiver<ListenerEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    // Stays registered for the life of the node.
    let _subscription = node.listener().on_event(move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ListenerEvent>) -> ListenerEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for listener event")
        .expect("listener closed")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_ready_scan_send_receive() {
    init_logging();
    let network = SimBleNetwork::new();
    let alice = network.create_device();
    let bob = network.create_device();
    let alice_node = node_on(&alice);
    let bob_node = node_on(&bob);

    let mut events = collect_events(&bob_node);
    assert_eq!(bob_node.listener().start().await, ListenerState::Running);
    bob_node.broadcaster().start_ready("Bob", "bob-card").await;

    let (scan, mut peers) = start_scan(&alice_node).await;
    let snapshot = wait_for_snapshot(&mut peers, |p| !p.is_empty()).await;
    scan.stop().await;

    let peer = &snapshot[0];
    assert_eq!(&peer.id, bob.address());
    assert_eq!(peer.source, PayloadSource::Frame);
    assert_eq!(peer.payload.opcode(), Some(Opcode::Ready));
    assert_eq!(peer.payload.letter(), 'B');
    assert_eq!(peer.payload.card_id(), "bob-card");
    assert!(peer.name.as_deref().unwrap_or("").starts_with("TravelCard_Bob_"));

    let report = alice_node
        .send_card(&peer.id, "doc-123", "Alice")
        .await
        .unwrap();
    assert_eq!(report.attempts, 1);

    match next_event(&mut events).await {
        ListenerEvent::CardReceived {
            sender,
            doc_id,
            from,
        } => {
            assert_eq!(sender, "Alice");
            assert_eq!(doc_id, "doc-123");
            assert_eq!(from.as_ref(), Some(alice.address()));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(bob.writes_received(), 1);
    assert!(!alice.is_connected(bob.address()).await.unwrap());
}

#[tokio::test]
async fn test_request_accept_nonce_correlation() {
    init_logging();
    let network = SimBleNetwork::new();
    let device_a = network.create_device();
    let device_b = network.create_device();
    let node_a = node_on(&device_a);
    let node_b = node_on(&device_b);
    let nonce = [0x5E, 0xED, 0x00, 0x42];

    let (scan_b, mut seen_by_b) = start_scan(&node_b).await;
    node_a
        .broadcaster()
        .start_request('J', nonce, "abc123", None)
        .await;

    let snapshot = wait_for_snapshot(&mut seen_by_b, |peers| {
        peers
            .iter()
            .any(|p| p.payload.opcode() == Some(Opcode::Request))
    })
    .await;
    let request = &snapshot[0].payload;
    assert_eq!(request.nonce, nonce);
    assert_eq!(request.letter_code, letter_to_code('J'));
    assert_eq!(request.card_id(), "abc123");
    scan_b.stop().await;

    let (scan_a, mut seen_by_a) = start_scan(&node_a).await;
    node_b
        .broadcaster()
        .start_accept('K', request.nonce, "abc123", None)
        .await;

    let snapshot = wait_for_snapshot(&mut seen_by_a, |peers| {
        peers
            .iter()
            .any(|p| p.payload.opcode() == Some(Opcode::Accept))
    })
    .await;
    let accept = &snapshot[0].payload;
    assert_eq!(accept.nonce, nonce);
    assert_eq!(accept.letter(), 'K');
    scan_a.stop().await;
}

#[tokio::test]
async fn test_malformed_write_reported_and_listener_survives() {
    init_logging();
    let network = SimBleNetwork::new();
    let alice = network.create_device();
    let bob = network.create_device();
    let bob_node = node_on(&bob);
    let mut events = collect_events(&bob_node);
    bob_node.listener().start().await;

    alice.connect(bob.address()).await.unwrap();
    alice
        .write(bob.address(), CARD_SERVICE_UUID, CARD_CHAR_UUID, b"hello")
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut events).await,
        ListenerEvent::MalformedPacket {
            raw: "hello".to_string()
        }
    );

    let alice_node = node_on(&alice);
    alice_node
        .send_card(bob.address(), "doc-after", "Alice")
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        ListenerEvent::CardReceived { ref doc_id, .. } if doc_id == "doc-after"
    ));
}

#[tokio::test]
async fn test_mid_write_disconnect_delivers_exactly_once() {
    init_logging();
    let network = SimBleNetwork::new();
    let alice = network.create_device();
    let bob = network.create_device();
    let alice_node = node_on(&alice);
    let bob_node = node_on(&bob);
    let mut events = collect_events(&bob_node);
    bob_node.listener().start().await;

    alice.inject_fault(SimFault::WriteDisconnect);
    let report = alice_node
        .send_card(bob.address(), "doc-retry", "Alice")
        .await
        .unwrap();
    assert_eq!(report.attempts, 2);

    assert!(matches!(
        next_event(&mut events).await,
        ListenerEvent::CardReceived { .. }
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(bob.writes_received(), 1);
}

#[tokio::test]
async fn test_characteristic_hosted_under_other_service() {
    init_logging();
    let network = SimBleNetwork::new();
    let alice = network.create_device();
    let bob = network.create_device();
    let alternate = Uuid::from_u128(0x0000_feed_0000_1000_8000_00805f9b34fb);
    bob.add_service(alternate, CARD_CHAR_UUID).await.unwrap();
    let mut writes = bob.inbound_writes();

    let report = node_on(&alice)
        .send_card(bob.address(), "doc-alt", "Alice")
        .await
        .unwrap();
    assert_eq!(report.service, alternate);

    let write = writes.recv().await.unwrap();
    assert_eq!(write.service, alternate);
    assert!(matches!(
        decode_inbound(write.value, write.from),
        ListenerEvent::CardReceived { ref doc_id, .. } if doc_id == "doc-alt"
    ));
}

#[tokio::test]
async fn test_base64_text_values_are_decoded() {
    init_logging();
    let network = SimBleNetwork::new();
    let alice = network.create_device();
    let bob = network.create_device();
    bob.set_value_encoding(SimValueEncoding::Base64Text);
    let bob_node = node_on(&bob);
    let mut events = collect_events(&bob_node);
    bob_node.listener().start().await;

    node_on(&alice)
        .send_card(bob.address(), "doc-b64", "Alice")
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        ListenerEvent::CardReceived { ref doc_id, .. } if doc_id == "doc-b64"
    ));
}

#[tokio::test]
async fn test_peers_ranked_by_signal() {
    init_logging();
    let network = SimBleNetwork::new();
    let observer = network.create_device();
    let near = network.create_device();
    let mid = network.create_device();
    let far = network.create_device();
    network.set_link_rssi(observer.address(), near.address(), -40);
    network.set_link_rssi(observer.address(), mid.address(), -70);
    network.set_link_rssi(observer.address(), far.address(), -85);

    let observer_node = node_on(&observer);
    let (scan, mut peers) = start_scan(&observer_node).await;
    let broadcasters: Vec<ProximityNode> = [&far, &near, &mid].iter().map(|d| node_on(d)).collect();
    for (node, label) in broadcasters.iter().zip(["Far", "Near", "Mid"]) {
        node.broadcaster().start_ready(label, label).await;
    }

    let snapshot = wait_for_snapshot(&mut peers, |p| p.len() == 3).await;
    let order: Vec<&PeerHandle> = snapshot.iter().map(|p| &p.id).collect();
    assert_eq!(order, vec![near.address(), mid.address(), far.address()]);
    assert!(snapshot[0].distance_meters < snapshot[2].distance_meters);
    scan.stop().await;
}

#[tokio::test]
async fn test_legacy_ready_payload_is_recognized() {
    init_logging();
    let network = SimBleNetwork::new();
    let alice = network.create_device();
    let bob = network.create_device();
    let mut config = ProximityConfig::default();
    config.broadcast.legacy_ready_payload = true;
    let bob_node = node_with_config(&bob, config);
    bob_node.broadcaster().start_ready("bob", "").await;

    let alice_node = node_on(&alice);
    let (scan, mut peers) = start_scan(&alice_node).await;
    let snapshot = wait_for_snapshot(&mut peers, |p| !p.is_empty()).await;
    assert_eq!(snapshot[0].source, PayloadSource::LegacyLetter);
    assert_eq!(snapshot[0].payload.letter(), 'B');
    scan.stop().await;
}

#[tokio::test]
async fn test_null_radio_degrades_everywhere() {
    init_logging();
    let node = ProximityNode::with_defaults(Arc::new(NullRadio));

    node.broadcaster().start_ready("Ann", "card").await;
    assert!(node.broadcaster().is_advertising());
    assert_eq!(node.listener().start().await, ListenerState::Degraded);

    let (tx, mut errors) = mpsc::unbounded_channel();
    let handle = node
        .scan(ScanCallbacks::new(
            |_| panic!("no peers expected"),
            move |e| {
                let _ = tx.send(e);
            },
        ))
        .await;
    assert!(!handle.is_active());
    assert!(matches!(errors.recv().await, Some(BleError::Unsupported(_))));

    node.shutdown().await;
    assert!(!node.broadcaster().is_advertising());
}

#[tokio::test]
async fn test_permission_denied_degrades() {
    init_logging();
    let network = SimBleNetwork::new();
    let device = network.create_device();
    let peer = network.create_device();
    let gate = CapabilityGate::new(
        RadioApiGeneration::Modern,
        Arc::new(FixedGrants::new([Capability::Scan, Capability::Connect])),
    );
    let node = ProximityNode::new(Arc::new(device.clone()), gate, ProximityConfig::default());

    node.broadcaster().start_ready("Ann", "card").await;
    assert!(node.broadcaster().is_advertising());
    assert!(!device.is_advertising());
    assert_eq!(node.listener().start().await, ListenerState::Degraded);

    let (tx, mut errors) = mpsc::unbounded_channel();
    let handle = node
        .scan(ScanCallbacks::new(
            |_| {},
            move |e| {
                let _ = tx.send(e);
            },
        ))
        .await;
    assert!(!handle.is_active());
    assert!(matches!(errors.recv().await, Some(BleError::PermissionDenied)));
    assert!(errors.try_recv().is_err());

    let err = node
        .send_card(peer.address(), "doc", "Ann")
        .await
        .unwrap_err();
    assert!(matches!(err, BleError::PermissionDenied));
    assert_eq!(
        err.user_message(),
        "Bluetooth permissions denied. Please grant permissions."
    );
}
