use paumiot_core::error::{DecodingErrorKind, ErrorKind, Result};
use paumiot_protocol::{
    encrypted::{
        is_quic_short_header, parse_quic_long_header, parse_tls_record, TLS_CHANGE_CIPHER_SPEC,
        TLS_CLIENT_HELLO,
    },
    Protocol,
};
use tracing::{debug, info};

use crate::{
    connection::{ConnectionRecord, ProtocolData, SessionFlags, SessionState},
    event_types::Action,
};

fn establish(record: &mut ConnectionRecord) {
    if !record.flags.contains(SessionFlags::TLS_ESTABLISHED) {
        info!("[{}] session established with {}", record.protocol(), record.peer());
    }
    record.flags.insert(SessionFlags::TLS_ESTABLISHED | SessionFlags::AUTHENTICATED);
    record.session_state = SessionState::Authenticated;
}

/// Records the cleartext header of a TLS record. Never replies.
pub fn handle_tls(record: &mut ConnectionRecord, frame: &[u8]) -> Result<Vec<Action>> {
    let tls =
        parse_tls_record(frame).ok_or(ErrorKind::MalformedPacket(DecodingErrorKind::Header))?;
    debug!(
        "[TLS] record type {} version {:#06x} length {} from {}",
        tls.content_type,
        tls.version,
        tls.length,
        record.peer()
    );
    if let ProtocolData::Tls(data) = record.data_mut() {
        data.content_type = tls.content_type;
        data.version = tls.version;
        if let Some(kind) = tls.handshake_type {
            data.handshake_type = kind;
        }
        if let Some(cipher) = tls.cipher {
            data.cipher = cipher;
        }
    }
    let hello = tls.handshake_type == Some(TLS_CLIENT_HELLO);
    if hello || tls.content_type == TLS_CHANGE_CIPHER_SPEC {
        establish(record);
    }
    Ok(Vec::new())
}

/// Records the cleartext header of a QUIC packet. Never replies.
pub fn handle_quic(record: &mut ConnectionRecord, frame: &[u8]) -> Result<Vec<Action>> {
    if let Some(header) = parse_quic_long_header(frame) {
        debug!(
            "[QUIC] long header version {:#010x} type {} from {}",
            header.version,
            header.packet_type,
            record.peer()
        );
        if let ProtocolData::Quic(data) = record.data_mut() {
            data.version = header.version;
            data.packet_type = header.packet_type;
            data.cid_len = header.dcid.len() as u8;
            data.cid[..header.dcid.len()].copy_from_slice(&header.dcid);
        }
        return Ok(Vec::new());
    }
    if is_quic_short_header(frame) {
        establish(record);
        return Ok(Vec::new());
    }
    Err(ErrorKind::MalformedPacket(DecodingErrorKind::Header))
}

/// Logs a TLS or QUIC datagram. Never replies.
pub fn inspect_datagram(protocol: Protocol, datagram: &[u8]) -> Result<Vec<Action>> {
    match protocol {
        Protocol::Tls => {
            let tls = parse_tls_record(datagram)
                .ok_or(ErrorKind::MalformedPacket(DecodingErrorKind::Header))?;
            debug!("[TLS] datagram record type {} version {:#06x}", tls.content_type, tls.version);
        }
        _ => match parse_quic_long_header(datagram) {
            Some(header) => debug!(
                "[QUIC] datagram version {:#010x} dcid {} bytes",
                header.version,
                header.dcid.len()
            ),
            None => debug!("[QUIC] datagram of {} bytes", datagram.len()),
        },
    }
    Ok(Vec::new())
}
