use crate::{
    pal::mqtt::{flags_valid, PacketType},
    protocol::Transport,
    varint::{self, VarInt},
};

fn plausible_fixed_header(byte: u8) -> bool {
    PacketType::from_nibble(byte >> 4).map_or(false, |kind| flags_valid(kind, byte & 0x0F))
}

pub(super) fn validate(bytes: &[u8], transport: Transport) -> Option<u8> {
    if bytes.len() < 2 || !plausible_fixed_header(bytes[0]) {
        return None;
    }
    let mut confidence: u8 = 60;

    let header_len = match varint::decode(&bytes[1..]).ok()? {
        VarInt::Complete { value, len } => {
            let total = 1 + len + value;
            if total == bytes.len() {
                confidence += 15;
            } else if !frames_tile(bytes, transport) {
                return None;
            }
            1 + len
        }
        // Streaming partial: the length field itself is cut off
        VarInt::Incomplete if transport == Transport::Tcp => return Some(confidence),
        VarInt::Incomplete => return None,
    };

    if bytes[0] >> 4 == PacketType::Connect as u8 {
        match connect_protocol(&bytes[header_len..]) {
            Some(true) => confidence += 15,
            Some(false) => return None,
            None => {}
        }
    }
    if transport == Transport::Tcp {
        confidence += 10;
    }
    Some(confidence.min(100))
}

// Walks consecutive frames; only a stream may end inside one.
fn frames_tile(bytes: &[u8], transport: Transport) -> bool {
    let mut pos = 0;
    while pos < bytes.len() {
        if !plausible_fixed_header(bytes[pos]) {
            return false;
        }
        match varint::decode(&bytes[pos + 1..]) {
            Ok(VarInt::Complete { value, len }) => pos += 1 + len + value,
            Ok(VarInt::Incomplete) => return transport == Transport::Tcp,
            Err(_) => return false,
        }
    }
    pos == bytes.len() || transport == Transport::Tcp
}

// Some(true) for a recognised name and level, Some(false) for a wrong name, None if cut off.
fn connect_protocol(variable: &[u8]) -> Option<bool> {
    let name_len = u16::from_be_bytes([*variable.first()?, *variable.get(1)?]) as usize;
    let name = variable.get(2..2 + name_len)?;
    let level = *variable.get(2 + name_len)?;
    Some(match name {
        b"MQTT" => (4..=5).contains(&level),
        b"MQIsdp" => level == 3,
        _ => false,
    })
}
