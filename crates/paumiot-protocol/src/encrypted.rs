//! Header inspection for encrypted transports (TLS records, QUIC long headers).
//!
//! Nothing here decrypts; the gateway only records what the cleartext headers reveal.

use byteorder::{BigEndian, ByteOrder};

/// TLS record content type: change_cipher_spec.
pub const TLS_CHANGE_CIPHER_SPEC: u8 = 20;
/// TLS record content type: alert.
pub const TLS_ALERT: u8 = 21;
/// TLS record content type: handshake.
pub const TLS_HANDSHAKE: u8 = 22;
/// TLS record content type: application_data.
pub const TLS_APPLICATION_DATA: u8 = 23;
/// Handshake message type: client_hello.
pub const TLS_CLIENT_HELLO: u8 = 1;
/// Highest defined handshake message type (finished).
pub const TLS_FINISHED: u8 = 20;

/// QUIC version 1 (RFC 9000).
pub const QUIC_V1: u32 = 0x0000_0001;
/// QUIC version 2 (RFC 9369).
pub const QUIC_V2: u32 = 0x6b33_43cf;

/// Cleartext fields of a TLS record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsRecord {
    /// Record content type (20..=23)
    pub content_type: u8,
    /// Record protocol version (0x0300..=0x0304)
    pub version: u16,
    /// Length of the record body
    pub length: u16,
    /// Handshake message type for handshake records
    pub handshake_type: Option<u8>,
    /// Cipher suite offered first in a ClientHello, if visible
    pub cipher: Option<u16>,
}

/// Parses and validates a TLS record header at the start of `bytes`.
pub fn parse_tls_record(bytes: &[u8]) -> Option<TlsRecord> {
    if bytes.len() < 5 {
        return None;
    }
    let content_type = bytes[0];
    if !(TLS_CHANGE_CIPHER_SPEC..=TLS_APPLICATION_DATA).contains(&content_type) {
        return None;
    }
    let version = BigEndian::read_u16(&bytes[1..3]);
    if !(0x0300..=0x0304).contains(&version) {
        return None;
    }
    let length = BigEndian::read_u16(&bytes[3..5]);
    if length as usize + 5 > bytes.len() {
        return None;
    }

    let handshake_type = if content_type == TLS_HANDSHAKE { bytes.get(5).copied() } else { None };
    if matches!(handshake_type, Some(kind) if kind > TLS_FINISHED) {
        return None;
    }

    let cipher = match handshake_type {
        Some(TLS_CLIENT_HELLO) => first_offered_cipher(&bytes[5..]),
        _ => None,
    };

    Some(TlsRecord { content_type, version, length, handshake_type, cipher })
}

// handshake header (4) + client_version (2) + random (32) + session id + cipher suites
fn first_offered_cipher(handshake: &[u8]) -> Option<u16> {
    let session_id_len = *handshake.get(38)? as usize;
    let suites = 39 + session_id_len;
    let suites_len = BigEndian::read_u16(handshake.get(suites..suites + 2)?);
    if suites_len < 2 {
        return None;
    }
    Some(BigEndian::read_u16(handshake.get(suites + 2..suites + 4)?))
}

/// Cleartext fields of a QUIC long header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuicHeader {
    /// Version field (0 = version negotiation)
    pub version: u32,
    /// Long packet type (bits 4-5 of the first byte)
    pub packet_type: u8,
    /// Destination connection id
    pub dcid: Vec<u8>,
}

impl QuicHeader {
    /// Returns true for an IETF-standardised version.
    pub fn is_ietf(&self) -> bool {
        self.version == QUIC_V1 || self.version == QUIC_V2
    }
}

/// Returns true if `version` is negotiation, an IETF version, or a gQUIC `Q0xx` tag.
pub fn is_known_quic_version(version: u32) -> bool {
    if version == 0 || version == QUIC_V1 || version == QUIC_V2 {
        return true;
    }
    let tag = version.to_be_bytes();
    tag[0] == b'Q' && tag[1] == b'0' && tag[2].is_ascii_digit() && tag[3].is_ascii_digit()
}

/// Parses and validates a QUIC long header at the start of `bytes`.
pub fn parse_quic_long_header(bytes: &[u8]) -> Option<QuicHeader> {
    if bytes.len() < 6 || bytes[0] & 0x80 == 0 {
        return None;
    }
    let version = BigEndian::read_u32(&bytes[1..5]);
    if !is_known_quic_version(version) {
        return None;
    }
    let dcid_len = bytes[5] as usize;
    if dcid_len > 20 {
        return None;
    }
    let dcid = bytes.get(6..6 + dcid_len)?.to_vec();
    Some(QuicHeader { version, packet_type: (bytes[0] >> 4) & 0x03, dcid })
}

/// Returns true for a QUIC short-header (1-RTT) packet.
pub fn is_quic_short_header(bytes: &[u8]) -> bool {
    bytes.first().map(|b| b & 0xC0 == 0x40).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_hello() -> Vec<u8> {
        let mut body = vec![TLS_CLIENT_HELLO, 0x00, 0x00, 0x2A, 0x03, 0x03];
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one suite: TLS_AES_128_GCM_SHA256
        body.extend_from_slice(&[0x01, 0x00]); // compression
        let mut record = vec![TLS_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(body.len() as u16).to_be_bytes());
        record.extend_from_slice(&body);
        record
    }

    #[test]
    fn test_tls_client_hello() {
        let record = parse_tls_record(&client_hello()).unwrap();
        assert_eq!(record.content_type, TLS_HANDSHAKE);
        assert_eq!(record.version, 0x0301);
        assert_eq!(record.handshake_type, Some(TLS_CLIENT_HELLO));
        assert_eq!(record.cipher, Some(0x1301));
    }

    #[test]
    fn test_tls_rejects_bad_headers() {
        // Wrong content type
        assert!(parse_tls_record(&[0x18, 0x03, 0x03, 0x00, 0x00]).is_none());
        // Version out of range
        assert!(parse_tls_record(&[0x17, 0x02, 0x00, 0x00, 0x00]).is_none());
        // Record longer than buffer
        assert!(parse_tls_record(&[0x17, 0x03, 0x03, 0x00, 0x10, 0xAA]).is_none());
        // Handshake type above finished
        assert!(parse_tls_record(&[0x16, 0x03, 0x03, 0x00, 0x01, 0x30]).is_none());
    }

    #[test]
    fn test_quic_long_header() {
        let packet = [0xC3, 0x00, 0x00, 0x00, 0x01, 0x04, 0xDE, 0xAD, 0xBE, 0xEF, 0x00];
        let header = parse_quic_long_header(&packet).unwrap();
        assert_eq!(header.version, QUIC_V1);
        assert_eq!(header.packet_type, 0);
        assert_eq!(header.dcid, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(header.is_ietf());
    }

    #[test]
    fn test_quic_versions() {
        assert!(is_known_quic_version(0));
        assert!(is_known_quic_version(u32::from_be_bytes(*b"Q046")));
        assert!(!is_known_quic_version(0xFF00_001D));
        assert!(parse_quic_long_header(&[0x40, 0, 0, 0, 1, 0]).is_none());
        assert!(is_quic_short_header(&[0x41, 0x00]));
    }
}
