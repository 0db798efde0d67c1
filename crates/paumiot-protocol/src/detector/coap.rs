use crate::{pal::coap::CoapPacket, protocol::Transport};

fn is_known_code(class: u8, detail: u8) -> bool {
    match class {
        0 => detail <= 7,
        2 => (1..=5).contains(&detail) || detail == 31,
        4 => matches!(detail, 0..=6 | 8 | 12 | 13 | 15),
        5 => detail <= 5,
        _ => false,
    }
}

pub(super) fn validate(bytes: &[u8], transport: Transport) -> Option<u8> {
    if bytes.len() < 4 {
        return None;
    }
    let version = bytes[0] >> 6;
    let token_len = (bytes[0] & 0x0F) as usize;
    if version != 1 || token_len > 8 || bytes.len() < 4 + token_len {
        return None;
    }
    let class = bytes[1] >> 5;
    if !matches!(class, 0 | 2 | 4 | 5) {
        return None;
    }

    let mut confidence: u8 = 50;
    if CoapPacket::parse(bytes).is_ok() {
        confidence += 15;
    }
    if is_known_code(class, bytes[1] & 0x1F) {
        confidence += 15;
    }
    if transport == Transport::Udp {
        confidence += 15;
    }
    if token_len > 0 {
        confidence += 5;
    }
    Some(confidence.min(100))
}
