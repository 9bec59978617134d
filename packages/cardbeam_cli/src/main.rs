// cardbeam - inspect proximity frames and run card exchanges from the shell.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cardbeam::ble::frame::{self, AdvFrame, Opcode};
use cardbeam::ble::packet::create_transfer_packet;
use cardbeam::ble::select_radio;
use cardbeam::ble::simulated::SimBleNetwork;
use cardbeam::proximity::capability::CapabilityGate;
use cardbeam::proximity::listener::ListenerEvent;
use cardbeam::proximity::scanner::ScanCallbacks;
use cardbeam::{ProximityConfig, ProximityNode};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "cardbeam")]
#[command(about = "Proximity card exchange over BLE advertising", long_about = None)]
#[command(version)]
struct Cli {
    /// JSON config file (defaults apply to anything it omits)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode an advertising frame and print it as hex
    Encode {
        #[arg(short, long, value_enum, default_value = "ready")]
        opcode: OpcodeArg,
        #[arg(short, long, default_value = "A")]
        letter: char,
        /// 4-byte nonce as 8 hex digits; random when omitted
        #[arg(short, long)]
        nonce: Option<String>,
        #[arg(long, default_value = "")]
        card: String,
    },
    /// Decode a hex advertising payload (binary or legacy)
    Decode { hex: String },
    /// Print a transfer packet
    Packet {
        doc_id: String,
        #[arg(short, long, default_value = "cardbeam")]
        sender: String,
    },
    /// Run a two-device exchange over the simulated radio
    Demo,
    /// Scan with the platform radio
    Scan {
        #[arg(short, long, default_value = "10")]
        seconds: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OpcodeArg {
    Ready,
    Request,
    Accept,
    Ack,
}

impl From<OpcodeArg> for Opcode {
    fn from(arg: OpcodeArg) -> Self {
        match arg {
            OpcodeArg::Ready => Opcode::Ready,
            OpcodeArg::Request => Opcode::Request,
            OpcodeArg::Accept => Opcode::Accept,
            OpcodeArg::Ack => Opcode::Ack,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ProximityConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ProximityConfig::default(),
    };

    match cli.command {
        Commands::Encode {
            opcode,
            letter,
            nonce,
            card,
        } => cmd_encode(opcode.into(), letter, nonce.as_deref(), &card),
        Commands::Decode { hex } => cmd_decode(&hex),
        Commands::Packet { doc_id, sender } => {
            println!("{}", create_transfer_packet(&doc_id, &sender));
            Ok(())
        }
        Commands::Demo => cmd_demo(config).await,
        Commands::Scan { seconds } => cmd_scan(config, Duration::from_secs(seconds)).await,
    }
}

fn cmd_encode(opcode: Opcode, letter: char, nonce: Option<&str>, card: &str) -> Result<()> {
    let nonce = match nonce {
        Some(text) => {
            let bytes = hex::decode(text).context("nonce is not hex")?;
            let nonce: [u8; 4] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("nonce must be exactly 4 bytes"))?;
            Some(nonce)
        }
        None => None,
    };
    println!("{}", hex::encode(frame::encode(opcode, letter, nonce, card)));
    Ok(())
}

fn cmd_decode(text: &str) -> Result<()> {
    let bytes = hex::decode(text.trim()).context("payload is not hex")?;
    let payload = frame::strip_manufacturer_prefix(&bytes);
    let (decoded, format) = match frame::decode_legacy(payload) {
        Some(f) => (f, "legacy"),
        None => match frame::decode(payload) {
            Some(f) => (f, "frame"),
            None => bail!("payload is shorter than a frame header"),
        },
    };
    println!("{}", serde_json::to_string_pretty(&frame_json(&decoded, format))?);
    Ok(())
}

fn frame_json(frame: &AdvFrame, format: &str) -> serde_json::Value {
    serde_json::json!({
        "format": format,
        "version": frame.version,
        "opcode": frame.opcode().map(|op| op.as_str()),
        "letter": frame.letter().to_string(),
        "nonce": hex::encode(frame.nonce),
        "cardIdShort": frame.card_id(),
        "supported": frame.is_supported(),
    })
}

async fn cmd_demo(config: ProximityConfig) -> Result<()> {
    let network = SimBleNetwork::new();
    let alice = network.create_device();
    let bob = network.create_device();
    network.set_link_rssi(alice.address(), bob.address(), -52);

    let alice_node = ProximityNode::new(
        Arc::new(alice.clone()),
        CapabilityGate::unrestricted(),
        config.clone(),
    );
    let bob_node = ProximityNode::new(Arc::new(bob.clone()), CapabilityGate::unrestricted(), config);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let subscription = bob_node.listener().on_event(move |event| {
        let _ = event_tx.send(event.clone());
    });
    bob_node.listener().start().await;
    let ready = bob_node.broadcaster().start_ready("Bob", "bob-card").await;
    println!("Bob   advertising  {}", ready);

    let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
    let scan = alice_node
        .scan(ScanCallbacks::new(
            move |peers| {
                let _ = peer_tx.send(peers);
            },
            |e| eprintln!("scan failed: {}", e.user_message()),
        ))
        .await;

    let peers = tokio::time::timeout(Duration::from_secs(5), peer_rx.recv())
        .await
        .context("no peer discovered")?
        .context("scan ended before any peer was seen")?;
    scan.stop().await;
    let peer = peers.first().context("empty peer snapshot")?;
    println!(
        "Alice discovered   {} ({} dBm, ~{:.1} m) {}",
        peer.id, peer.rssi, peer.distance_meters, peer.payload
    );

    let report = alice_node
        .send_card(&peer.id, "doc-demo-1", "Alice")
        .await
        .context("send failed")?;
    println!(
        "Alice sent card    via {} in {} attempt(s)",
        report.service, report.attempts
    );

    match tokio::time::timeout(Duration::from_secs(2), event_rx.recv()).await {
        Ok(Some(ListenerEvent::CardReceived { sender, doc_id, .. })) => {
            println!("Bob   received     {} from {}", doc_id, sender);
        }
        Ok(Some(ListenerEvent::MalformedPacket { raw })) => {
            println!("Bob   malformed    {:?}", raw);
        }
        _ => bail!("Bob received nothing"),
    }

    subscription.unsubscribe();
    bob_node.shutdown().await;
    alice_node.shutdown().await;
    Ok(())
}

async fn cmd_scan(config: ProximityConfig, duration: Duration) -> Result<()> {
    let node = ProximityNode::new(select_radio().await, CapabilityGate::unrestricted(), config);
    if !node.capabilities().central {
        bail!("Bluetooth is not available on this device (radio: {})", node.radio_name());
    }

    let handle = node
        .scan(ScanCallbacks::new(
            |peers| {
                println!("--- {} peer(s)", peers.len());
                for peer in peers {
                    println!(
                        "{:>5} dBm  ~{:>5.1} m  {}  {}",
                        peer.rssi,
                        peer.distance_meters,
                        peer.id,
                        peer.payload
                    );
                }
            },
            |e| eprintln!("{}", e.user_message()),
        ))
        .await;

    tokio::time::sleep(duration).await;
    handle.stop().await;
    Ok(())
}
