//! Well-known identifiers of the card exchange service
//!
//! Every participant (broadcaster, scanner, listener and sender) must use
//! the same service and characteristic UUIDs, in the same way every peer
//! of a network protocol agrees on a port number.

use rand::Rng;
use uuid::Uuid;

/// Primary card exchange GATT service UUID.
pub const CARD_SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_1234_1234_123456789abc);

/// Writable characteristic that receives transfer packets.
pub const CARD_CHAR_UUID: Uuid = Uuid::from_u128(0x87654321_4321_4321_4321_cba987654321);

/// Company identifier reserved by the Bluetooth SIG for testing.
pub const TEST_MANUFACTURER_ID: u16 = 0xFFFF;

/// Prefix of the local name advertised by participating devices.
pub const DEVICE_NAME_PREFIX: &str = "TravelCard_";

/// Legacy advertising PDU payload limit, in bytes.
pub const LEGACY_ADV_PAYLOAD_MAX: usize = 31;

/// Bytes of the legacy payload consumed before the frame itself:
/// flags AD structure (3), manufacturer AD length + type (2) and the
/// little-endian company identifier (2).
pub const ADV_OVERHEAD: usize = 3 + 2 + 2;

/// Space left for the advertising frame inside a legacy payload.
pub const ADV_FRAME_BUDGET: usize = LEGACY_ADV_PAYLOAD_MAX - ADV_OVERHEAD;

const NAME_SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Build the advertised local name for a display label:
/// `TravelCard_<label>_<4 random base-36 chars>`.
pub fn device_name_for(label: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..4)
        .map(|_| NAME_SUFFIX_ALPHABET[rng.gen_range(0..NAME_SUFFIX_ALPHABET.len())] as char)
        .collect();
    format!("{}{}_{}", DEVICE_NAME_PREFIX, label, suffix)
}

/// Whether a local name was produced by [`device_name_for`].
pub fn is_card_device_name(name: &str) -> bool {
    name.starts_with(DEVICE_NAME_PREFIX)
}
