//! Advertising frame codec
//!
//! Encodes protocol intent (READY / REQUEST / ACCEPT / ACK) directly into
//! the manufacturer-specific data of a legacy advertisement.
//!
//! Layout: `[version, opcode, letter_code, nonce0..3, card_id_short...]`.
//! Every header field is a single byte so there is no endianness to agree
//! on. The trailing card id is opaque UTF-8, capped at
//! [`CARD_ID_SHORT_MAX`] bytes so the frame always fits the legacy payload.

use std::fmt;

use rand::RngCore;
use serde::Deserialize;

use super::gatt::TEST_MANUFACTURER_ID;

/// Current frame schema version.
pub const FRAME_VERSION: u8 = 1;

/// Size of the fixed header preceding the card id.
pub const FRAME_HEADER_LEN: usize = 7;

/// Maximum number of card id bytes carried in a frame.
pub const CARD_ID_SHORT_MAX: usize = 16;

/// Protocol opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Presence: "I can receive cards". Also the implicit opcode of legacy payloads.
    Ready = 0x00,
    Request = 0x01,
    Accept = 0x02,
    Ack = 0x03,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Opcode::Ready),
            0x01 => Some(Opcode::Request),
            0x02 => Some(Opcode::Accept),
            0x03 => Some(Opcode::Ack),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Opcode::Ready => "READY",
            Opcode::Request => "REQUEST",
            Opcode::Accept => "ACCEPT",
            Opcode::Ack => "ACK",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded advertising frame.
///
/// Fields hold the raw wire values: decoding never rejects a frame with an
/// unknown opcode or an out-of-range letter code, so use [`AdvFrame::opcode`]
/// and [`AdvFrame::letter`] for the interpreted values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvFrame {
    pub version: u8,
    pub opcode: u8,
    pub letter_code: u8,
    pub nonce: [u8; 4],
    pub card_id_short: Vec<u8>,
}

impl AdvFrame {
    /// Build a frame, truncating `card_id_short` to the cap.
    pub fn new(opcode: Opcode, letter: char, nonce: [u8; 4], card_id_short: &str) -> Self {
        Self {
            version: FRAME_VERSION,
            opcode: opcode as u8,
            letter_code: letter_to_code(letter),
            nonce,
            card_id_short: truncate_utf8(card_id_short, CARD_ID_SHORT_MAX).as_bytes().to_vec(),
        }
    }

    /// Minimal READY frame for a peer that is known to speak the protocol
    /// but whose advertisement carried no decodable payload.
    pub fn ready_placeholder() -> Self {
        Self {
            version: FRAME_VERSION,
            opcode: Opcode::Ready as u8,
            letter_code: 0,
            nonce: [0; 4],
            card_id_short: Vec::new(),
        }
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.opcode)
    }

    /// Display initial carried by the frame.
    pub fn letter(&self) -> char {
        code_to_letter(self.letter_code)
    }

    /// Card id as text. Invalid UTF-8 (e.g. from a foreign encoder) is
    /// replaced rather than rejected.
    pub fn card_id(&self) -> String {
        String::from_utf8_lossy(&self.card_id_short).into_owned()
    }

    /// Whether this frame is one this implementation understands.
    pub fn is_supported(&self) -> bool {
        self.version == FRAME_VERSION && self.opcode().is_some()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + self.card_id_short.len());
        buf.push(self.version);
        buf.push(self.opcode);
        buf.push(self.letter_code);
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.card_id_short);
        buf
    }
}

impl fmt::Display for AdvFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let opcode = match self.opcode() {
            Some(op) => op.as_str().to_string(),
            None => format!("0x{:02x}", self.opcode),
        };
        write!(
            f,
            "v{} {} letter={} nonce={} card={:?}",
            self.version,
            opcode,
            self.letter(),
            hex::encode(self.nonce),
            self.card_id()
        )
    }
}

/// Encode a frame. A random nonce is generated when none is supplied and
/// an over-long card id is truncated, never rejected.
pub fn encode(opcode: Opcode, letter: char, nonce: Option<[u8; 4]>, card_id_short: &str) -> Vec<u8> {
    let nonce = nonce.unwrap_or_else(random_nonce);
    AdvFrame::new(opcode, letter, nonce, card_id_short).to_bytes()
}

/// Decode a frame. Returns `None` only when the fixed header is incomplete;
/// any longer input yields a structurally valid frame.
pub fn decode(bytes: &[u8]) -> Option<AdvFrame> {
    if bytes.len() < FRAME_HEADER_LEN {
        return None;
    }
    let mut nonce = [0u8; 4];
    nonce.copy_from_slice(&bytes[3..7]);
    Some(AdvFrame {
        version: bytes[0],
        opcode: bytes[1],
        letter_code: bytes[2],
        nonce,
        card_id_short: bytes[FRAME_HEADER_LEN..].to_vec(),
    })
}

#[derive(Deserialize)]
struct LegacyReadyJson {
    t: String,
    uid: String,
}

/// Decode the older READY payloads still seen in the field:
/// a bare single ASCII letter, or the JSON object
/// `{"t":"READY","uid":...,"ts":...}`.
pub fn decode_legacy(bytes: &[u8]) -> Option<AdvFrame> {
    if let [letter] = bytes {
        if letter.is_ascii_alphabetic() {
            let mut frame = AdvFrame::ready_placeholder();
            frame.letter_code = letter_to_code(*letter as char);
            return Some(frame);
        }
        return None;
    }
    if bytes.first() != Some(&b'{') {
        return None;
    }
    let legacy: LegacyReadyJson = serde_json::from_slice(bytes).ok()?;
    if legacy.t != "READY" {
        return None;
    }
    let mut frame = AdvFrame::ready_placeholder();
    frame.card_id_short = truncate_utf8(&legacy.uid, CARD_ID_SHORT_MAX).as_bytes().to_vec();
    Some(frame)
}

/// Strip the test company identifier some platforms leave in front of
/// manufacturer data. Data without the prefix is returned unchanged.
pub fn strip_manufacturer_prefix(data: &[u8]) -> &[u8] {
    let prefix = TEST_MANUFACTURER_ID.to_le_bytes();
    match data.strip_prefix(&prefix[..]) {
        Some(rest) => rest,
        None => data,
    }
}

/// Map a display initial to its letter code (A=0 .. Z=25).
/// Anything that is not an ASCII letter maps to 0.
pub fn letter_to_code(letter: char) -> u8 {
    let upper = letter.to_ascii_uppercase();
    if upper.is_ascii_uppercase() {
        upper as u8 - b'A'
    } else {
        0
    }
}

/// Map a letter code back to its initial; out-of-range codes map to 'A'.
pub fn code_to_letter(code: u8) -> char {
    if code <= 25 {
        (b'A' + code) as char
    } else {
        'A'
    }
}

/// Initial used to represent a display label.
pub fn letter_for_label(label: &str) -> char {
    label
        .trim()
        .chars()
        .next()
        .filter(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_uppercase())
        .unwrap_or('A')
}

pub fn random_nonce() -> [u8; 4] {
    let mut nonce = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Longest prefix of `s` that is at most `max` bytes and ends on a char boundary.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
