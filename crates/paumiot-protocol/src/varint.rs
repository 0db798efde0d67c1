//! MQTT variable byte integer (Remaining Length, property lengths).

use paumiot_core::{
    constants::MQTT_MAX_REMAINING_LENGTH,
    error::{DecodingErrorKind, ErrorKind, Result},
};

/// Outcome of decoding a variable byte integer from a possibly partial buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarInt {
    /// Fully decoded `value`, occupying `len` bytes.
    Complete {
        /// Decoded integer
        value: usize,
        /// Bytes consumed, 1 to 4
        len: usize,
    },
    /// The buffer ends inside the integer.
    Incomplete,
}

/// Decodes a variable byte integer from the start of `bytes`.
///
/// Fails with `RemainingLength` when a fourth byte still has its continuation bit set.
pub fn decode(bytes: &[u8]) -> Result<VarInt> {
    let mut value = 0usize;
    for (i, byte) in bytes.iter().take(4).enumerate() {
        value |= ((byte & 0x7F) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(VarInt::Complete { value, len: i + 1 });
        }
    }
    if bytes.len() >= 4 {
        Err(ErrorKind::MalformedPacket(DecodingErrorKind::RemainingLength))
    } else {
        Ok(VarInt::Incomplete)
    }
}

/// Like [`decode`] but treats a partial integer as truncation.
pub fn decode_complete(bytes: &[u8]) -> Result<(usize, usize)> {
    match decode(bytes)? {
        VarInt::Complete { value, len } => Ok((value, len)),
        VarInt::Incomplete => Err(ErrorKind::MalformedPacket(DecodingErrorKind::Truncated)),
    }
}

/// Number of bytes needed to encode `value`.
pub fn encoded_len(value: usize) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Appends the encoding of `value` to `out`.
pub fn encode(value: usize, out: &mut Vec<u8>) -> Result<usize> {
    if value > MQTT_MAX_REMAINING_LENGTH {
        return Err(ErrorKind::InvalidParameter("value exceeds variable byte integer range"));
    }
    let mut remaining = value;
    let mut written = 0;
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        written += 1;
        if remaining == 0 {
            return Ok(written);
        }
    }
}
