//! Transfer packet written over a connected GATT link
//!
//! Unlike the advertising frame this is plain JSON: it travels in a
//! characteristic write and is not constrained by the advertising budget.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Discriminator of card transfer packets.
pub const TRANSFER_PACKET_TYPE: &str = "TRAVEL_CARD";

/// Schema tag written into every packet.
pub const TRANSFER_PACKET_VERSION: &str = "1.0";

/// A card reference sent from one device to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferPacket {
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque reference to the full card record.
    pub doc_id: String,
    /// Display label of the sender. Not a credential.
    #[serde(default)]
    pub sender: String,
    /// Epoch milliseconds at encode time.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub version: String,
}

/// Serialize a transfer packet for `doc_id` from `sender`.
pub fn create_transfer_packet(doc_id: &str, sender: &str) -> String {
    serde_json::json!({
        "type": TRANSFER_PACKET_TYPE,
        "docId": doc_id,
        "sender": sender,
        "timestamp": Utc::now().timestamp_millis(),
        "version": TRANSFER_PACKET_VERSION,
    })
    .to_string()
}

/// Parse a transfer packet.
///
/// Returns `None` for anything that is not JSON, is missing a field, carries
/// a different `type`, or has an empty `docId`.
pub fn parse_transfer_packet(packet: &str) -> Option<TransferPacket> {
    match serde_json::from_str::<TransferPacket>(packet) {
        Ok(parsed) if parsed.kind == TRANSFER_PACKET_TYPE && is_valid_doc_id(&parsed.doc_id) => {
            Some(parsed)
        }
        Ok(parsed) => {
            log::debug!("Ignoring transfer packet of type {:?}", parsed.kind);
            None
        }
        Err(e) => {
            log::debug!("Unparseable transfer packet: {}", e);
            None
        }
    }
}

/// Document ids are opaque; the only requirement is that one is present.
pub fn is_valid_doc_id(doc_id: &str) -> bool {
    !doc_id.trim().is_empty()
}
