//! Single-frame text codec
//!
//! Encodes server → client text frames (unmasked) and decodes
//! client → server text frames (masked). Only the 7-bit payload
//! length is supported, so a frame carries at most 126 bytes.

use crate::error::ProtocolError;

/// Largest payload a frame may carry
pub const MAX_PAYLOAD: usize = 126;

/// Header bytes plus mask key of a client frame
const CLIENT_HEADER_LEN: usize = 6;

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const OPCODE_MASK: u8 = 0x0F;
const LENGTH_MASK: u8 = 0x7F;

/// Close status codes (RFC6455 section 7.4.1)
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const TOO_BIG: u16 = 1009;
}

/// Frame opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Parse the low nibble of the first header byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }
}

/// A decoded client message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Unmasked text payload
    pub text: String,
    /// Bytes of input the frame occupied
    pub consumed: usize,
}

/// Encode text as a single unmasked text frame
///
/// Output is `[0x81, len]` followed by the raw text bytes.
pub fn encode_text(text: &str) -> Result<Vec<u8>, ProtocolError> {
    let payload = text.as_bytes();
    if payload.len() > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(2 + payload.len());
    frame.push(FIN_BIT | Opcode::Text as u8);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Encode a close frame carrying a status code
pub fn encode_close(code: u16) -> [u8; 4] {
    let [hi, lo] = code.to_be_bytes();
    [FIN_BIT | Opcode::Close as u8, 2, hi, lo]
}

/// Size of the frame at the start of `buf`, once its header is readable
///
/// Returns `Ok(None)` until both header bytes have arrived. Rejects
/// unmasked frames and extended lengths early so a connection never
/// waits on a frame it could not decode anyway.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
    let Some(&second) = buf.get(1) else {
        return Ok(None);
    };

    if second & MASK_BIT == 0 {
        return Err(ProtocolError::Unmasked);
    }

    let len = (second & LENGTH_MASK) as usize;
    if len > MAX_PAYLOAD {
        return Err(ProtocolError::ExtendedLength);
    }

    Ok(Some(CLIENT_HEADER_LEN + len))
}

/// Decode one masked client text frame from the start of `raw`
pub fn decode(raw: &[u8]) -> Result<Decoded, ProtocolError> {
    if raw.len() < CLIENT_HEADER_LEN {
        return Err(ProtocolError::Truncated {
            needed: CLIENT_HEADER_LEN,
            available: raw.len(),
        });
    }

    if raw[0] & FIN_BIT == 0 {
        return Err(ProtocolError::FinNotSet);
    }

    let opcode = raw[0] & OPCODE_MASK;
    if opcode != Opcode::Text as u8 {
        return Err(ProtocolError::UnsupportedOpcode(opcode));
    }

    if raw[1] & MASK_BIT == 0 {
        return Err(ProtocolError::Unmasked);
    }

    let len = (raw[1] & LENGTH_MASK) as usize;
    if len > MAX_PAYLOAD {
        return Err(ProtocolError::ExtendedLength);
    }

    let consumed = CLIENT_HEADER_LEN + len;
    if raw.len() < consumed {
        return Err(ProtocolError::Truncated {
            needed: consumed,
            available: raw.len(),
        });
    }

    let key = &raw[2..CLIENT_HEADER_LEN];
    let payload: Vec<u8> = raw[CLIENT_HEADER_LEN..consumed]
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ key[i % 4])
        .collect();

    let text = String::from_utf8(payload).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok(Decoded { text, consumed })
}

/// Client-side frame builder for tests
#[cfg(test)]
pub(crate) fn masked(first: u8, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
    let mut frame = vec![first, MASK_BIT | payload.len() as u8];
    frame.extend_from_slice(&key);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
    frame
}
