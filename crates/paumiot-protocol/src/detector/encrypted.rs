use crate::{
    encrypted::{parse_quic_long_header, parse_tls_record, TLS_HANDSHAKE},
    protocol::Transport,
};

pub(super) fn validate_tls(bytes: &[u8], transport: Transport) -> Option<u8> {
    let record = parse_tls_record(bytes)?;
    let mut confidence: u8 = 80;
    if record.content_type == TLS_HANDSHAKE {
        confidence += 10;
    }
    if transport == Transport::Tcp {
        confidence += 10;
    }
    Some(confidence)
}

pub(super) fn validate_quic(bytes: &[u8], transport: Transport) -> Option<u8> {
    let header = parse_quic_long_header(bytes)?;
    let mut confidence: u8 = 80;
    if header.is_ietf() {
        confidence += 10;
    }
    if transport == Transport::Udp {
        confidence += 10;
    }
    Some(confidence)
}
