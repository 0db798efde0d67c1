use std::convert::TryFrom;

use byteorder::{BigEndian, ByteOrder};
use paumiot_core::{
    constants::COAP_MAX_MESSAGE_SIZE,
    error::{DecodingErrorKind, ErrorKind, Result},
};
use tracing::trace;

use super::{Adapter, Capabilities, ControlResponse};
use crate::{
    message::{InternalMessage, QoS},
    protocol::{EnumConverter, Protocol},
};

/// Size of the fixed CoAP header.
pub const HEADER_LEN: usize = 4;
/// Byte separating options from the payload.
pub const PAYLOAD_MARKER: u8 = 0xFF;
/// Longest token allowed.
pub const MAX_TOKEN_LEN: usize = 8;

/// Option number: Observe.
pub const OPTION_OBSERVE: u16 = 6;
/// Option number: Uri-Path.
pub const OPTION_URI_PATH: u16 = 11;
/// Option number: Content-Format.
pub const OPTION_CONTENT_FORMAT: u16 = 12;

/// Code 0.01 GET.
pub const CODE_GET: u8 = 0x01;
/// Code 2.05 Content.
pub const CODE_CONTENT: u8 = 0x45;

const CONTENT_FORMATS: [(u16, &str); 5] = [
    (0, "text/plain"),
    (41, "application/xml"),
    (42, "application/octet-stream"),
    (50, "application/json"),
    (60, "application/cbor"),
];

/// MIME type of a Content-Format number; unknown numbers map to octet-stream.
pub fn content_type_of(format: u16) -> &'static str {
    CONTENT_FORMATS
        .iter()
        .find(|(number, _)| *number == format)
        .map_or("application/octet-stream", |(_, mime)| mime)
}

/// Content-Format number of a MIME type.
pub fn content_format_of(mime: &str) -> Option<u16> {
    CONTENT_FORMATS.iter().find(|(_, known)| *known == mime).map(|(number, _)| *number)
}

/// Message type (bits 4-5 of the first byte).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CoapType {
    /// Confirmable
    Confirmable = 0,
    /// Non-confirmable
    NonConfirmable = 1,
    /// Acknowledgement
    Acknowledgement = 2,
    /// Reset
    Reset = 3,
}

impl EnumConverter for CoapType {
    type Enum = CoapType;

    fn to_u8(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for CoapType {
    type Error = ErrorKind;
    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(CoapType::Confirmable),
            1 => Ok(CoapType::NonConfirmable),
            2 => Ok(CoapType::Acknowledgement),
            3 => Ok(CoapType::Reset),
            _ => Err(ErrorKind::MalformedPacket(DecodingErrorKind::PacketType)),
        }
    }
}

/// One decoded option with its absolute number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    /// Option number (sum of deltas)
    pub number: u16,
    /// Raw option value
    pub value: Vec<u8>,
}

impl CoapOption {
    /// Value read as a big-endian unsigned integer (up to four bytes).
    pub fn as_uint(&self) -> u32 {
        self.value.iter().take(4).fold(0u32, |acc, byte| (acc << 8) | *byte as u32)
    }
}

/// Decoded CoAP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapPacket {
    /// Message type
    pub kind: CoapType,
    /// Code byte (class in the upper three bits)
    pub code: u8,
    /// Message id
    pub message_id: u16,
    /// Token, at most eight bytes
    pub token: Vec<u8>,
    /// Options in wire order
    pub options: Vec<CoapOption>,
    /// Bytes after the payload marker
    pub payload: Vec<u8>,
}

impl CoapPacket {
    /// Parses a complete CoAP message.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(ErrorKind::MalformedPacket(DecodingErrorKind::Truncated));
        }
        if bytes[0] >> 6 != 1 {
            return Err(ErrorKind::MalformedPacket(DecodingErrorKind::Version));
        }
        let token_len = (bytes[0] & 0x0F) as usize;
        if token_len > MAX_TOKEN_LEN {
            return Err(ErrorKind::MalformedPacket(DecodingErrorKind::TokenLength));
        }
        let token = bytes
            .get(HEADER_LEN..HEADER_LEN + token_len)
            .ok_or(ErrorKind::MalformedPacket(DecodingErrorKind::Truncated))?
            .to_vec();

        let mut packet = CoapPacket {
            kind: CoapType::try_from((bytes[0] >> 4) & 0x03)?,
            code: bytes[1],
            message_id: BigEndian::read_u16(&bytes[2..4]),
            token,
            options: Vec::new(),
            payload: Vec::new(),
        };

        let mut pos = HEADER_LEN + token_len;
        let mut number: u32 = 0;
        while pos < bytes.len() {
            let byte = bytes[pos];
            pos += 1;
            if byte == PAYLOAD_MARKER {
                if pos == bytes.len() {
                    // Marker followed by nothing
                    return Err(ErrorKind::MalformedPacket(DecodingErrorKind::Truncated));
                }
                packet.payload = bytes[pos..].to_vec();
                break;
            }

            let delta = read_extended(byte >> 4, bytes, &mut pos)?;
            let len = read_extended(byte & 0x0F, bytes, &mut pos)? as usize;
            number += delta;
            if number > u16::MAX as u32 {
                return Err(ErrorKind::MalformedPacket(DecodingErrorKind::ReservedOptionNibble));
            }
            let value = bytes
                .get(pos..pos + len)
                .ok_or(ErrorKind::MalformedPacket(DecodingErrorKind::Truncated))?;
            packet.options.push(CoapOption { number: number as u16, value: value.to_vec() });
            pos += len;
        }
        Ok(packet)
    }

    /// Code class (0 request, 2 success, 4 client error, 5 server error).
    pub fn code_class(&self) -> u8 {
        self.code >> 5
    }

    /// Code detail.
    pub fn code_detail(&self) -> u8 {
        self.code & 0x1F
    }

    /// True for method codes 0.01 to 0.31.
    pub fn is_request(&self) -> bool {
        self.code_class() == 0 && self.code_detail() != 0
    }

    /// True for the empty message (code 0.00).
    pub fn is_empty(&self) -> bool {
        self.code == 0
    }

    /// First option with the given number.
    pub fn option(&self, number: u16) -> Option<&CoapOption> {
        self.options.iter().find(|option| option.number == number)
    }

    /// Uri-Path options joined as `/a/b`, or `None` without any.
    pub fn uri_path(&self) -> Option<String> {
        let mut path = String::new();
        for option in self.options.iter().filter(|option| option.number == OPTION_URI_PATH) {
            path.push('/');
            path.push_str(&String::from_utf8_lossy(&option.value));
        }
        if path.is_empty() {
            None
        } else {
            Some(path)
        }
    }

    /// Content-Format number, if present.
    pub fn content_format(&self) -> Option<u16> {
        self.option(OPTION_CONTENT_FORMAT)
            .filter(|option| option.value.len() <= 2)
            .map(|option| option.as_uint() as u16)
    }
}

fn read_extended(nibble: u8, bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let truncated = ErrorKind::MalformedPacket(DecodingErrorKind::Truncated);
    match nibble {
        0..=12 => Ok(nibble as u32),
        13 => {
            let ext = *bytes.get(*pos).ok_or(truncated)?;
            *pos += 1;
            Ok(13 + ext as u32)
        }
        14 => {
            let ext = bytes.get(*pos..*pos + 2).ok_or(truncated)?;
            *pos += 2;
            Ok(269 + BigEndian::read_u16(ext) as u32)
        }
        _ => Err(ErrorKind::MalformedPacket(DecodingErrorKind::ReservedOptionNibble)),
    }
}

/// Largest option delta or length the 2-byte extended form can carry.
pub const MAX_OPTION_EXTENDED: usize = 269 + u16::MAX as usize;

fn split_extended(value: usize) -> Result<(u8, Vec<u8>)> {
    match value {
        0..=12 => Ok((value as u8, Vec::new())),
        13..=268 => Ok((13, vec![(value - 13) as u8])),
        269..=MAX_OPTION_EXTENDED => Ok((14, ((value - 269) as u16).to_be_bytes().to_vec())),
        _ => Err(ErrorKind::InvalidParameter("CoAP option longer than 65804 bytes")),
    }
}

/// Appends one option, delta-encoded against `previous`.
///
/// Options must be written in ascending number order.
pub fn write_option(out: &mut Vec<u8>, previous: u16, number: u16, value: &[u8]) -> Result<()> {
    let delta = number
        .checked_sub(previous)
        .ok_or(ErrorKind::InvalidParameter("CoAP options out of order"))?;
    let (delta_nibble, delta_ext) = split_extended(delta as usize)?;
    let (len_nibble, len_ext) = split_extended(value.len())?;
    out.push((delta_nibble << 4) | len_nibble);
    out.extend_from_slice(&delta_ext);
    out.extend_from_slice(&len_ext);
    out.extend_from_slice(value);
    Ok(())
}

/// Adapter for CoAP messages.
#[derive(Debug)]
pub struct CoapAdapter {
    next_message_id: u16,
}

impl Default for CoapAdapter {
    fn default() -> Self {
        Self { next_message_id: 1 }
    }
}

impl CoapAdapter {
    /// Creates an adapter whose message ids start at 1.
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }
}

impl Adapter for CoapAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Coap
    }

    fn name(&self) -> &'static str {
        "CoAP Adapter"
    }

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn decode(&self, bytes: &[u8]) -> Result<InternalMessage> {
        let packet = CoapPacket::parse(bytes)?;
        let qos = if packet.kind == CoapType::Confirmable { QoS::AtLeastOnce } else { QoS::AtMostOnce };

        let mut message =
            InternalMessage::new(Protocol::Coap).with_qos(qos).with_payload(packet.payload.as_slice());
        if let Some(path) = packet.uri_path() {
            message = message.with_destination(path);
        }
        if let Some(format) = packet.content_format() {
            message = message.with_content_type(content_type_of(format));
        }
        Ok(message)
    }

    fn encode(&mut self, message: &InternalMessage, out: &mut [u8]) -> Result<usize> {
        if message.protocol != Protocol::Coap {
            return Err(ErrorKind::ProtocolError("message is not a CoAP message"));
        }
        let kind =
            if message.qos > QoS::AtMostOnce { CoapType::Confirmable } else { CoapType::NonConfirmable };

        let mut packet = Vec::with_capacity(HEADER_LEN + message.payload.len() + 16);
        packet.push((1 << 6) | (kind.to_u8() << 4));
        packet.push(CODE_GET);
        packet.extend_from_slice(&[0, 0]);

        let mut previous = 0;
        let segments = message.destination.as_deref().unwrap_or_default().split('/');
        for segment in segments.filter(|segment| !segment.is_empty()) {
            write_option(&mut packet, previous, OPTION_URI_PATH, segment.as_bytes())?;
            previous = OPTION_URI_PATH;
        }
        if let Some(format) = message.content_type.as_deref().and_then(content_format_of) {
            // Minimal big-endian uint, zero is the empty value
            let value = match format {
                0 => Vec::new(),
                1..=0xFF => vec![format as u8],
                _ => format.to_be_bytes().to_vec(),
            };
            write_option(&mut packet, previous, OPTION_CONTENT_FORMAT, &value)?;
        }
        if !message.payload.is_empty() {
            packet.push(PAYLOAD_MARKER);
            packet.extend_from_slice(&message.payload);
        }

        if packet.len() > COAP_MAX_MESSAGE_SIZE {
            return Err(ErrorKind::InvalidParameter("CoAP message larger than 1152 bytes"));
        }
        if packet.len() > out.len() {
            return Err(ErrorKind::BufferOverflow { needed: packet.len(), available: out.len() });
        }
        let message_id = self.allocate_message_id();
        BigEndian::write_u16(&mut packet[2..4], message_id);
        out[..packet.len()].copy_from_slice(&packet);
        trace!("[PAL] encoded CoAP message {} ({} bytes)", message_id, packet.len());
        Ok(packet.len())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            qos0: true,
            qos1: true,
            qos2: false,
            retain: false,
            wildcards: false,
            max_packet_size: COAP_MAX_MESSAGE_SIZE,
            max_topic_alias: 0,
        }
    }

    fn control(&mut self, command: &str, argument: Option<&str>) -> Result<ControlResponse> {
        match command {
            "reset" => {
                self.next_message_id = 1;
                Ok(ControlResponse::Done)
            }
            "set_version" => match argument {
                Some("1") => Ok(ControlResponse::Done),
                _ => Err(ErrorKind::InvalidParameter("CoAP version must be 1")),
            },
            "get_version" => Ok(ControlResponse::Version("1")),
            _ => Err(ErrorKind::NotSupported("CoAP control command")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get_foo() {
        let packet = CoapPacket::parse(&[0x40, 0x01, 0x12, 0x34, 0xB3, b'f', b'o', b'o']).unwrap();
        assert_eq!(packet.kind, CoapType::Confirmable);
        assert_eq!(packet.code, CODE_GET);
        assert_eq!(packet.message_id, 0x1234);
        assert!(packet.is_request());
        assert_eq!(packet.uri_path().as_deref(), Some("/foo"));
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn test_extended_option_fields() {
        // Delta 13 + 2 = 15 (Uri-Query), length 13 + 0 = 13
        let mut bytes = vec![0x50, 0x01, 0x00, 0x01, 0xDD, 0x02, 0x00];
        bytes.extend_from_slice(b"abcdefghijklm");
        bytes.extend_from_slice(&[PAYLOAD_MARKER, b'!']);
        let packet = CoapPacket::parse(&bytes).unwrap();
        assert_eq!(packet.kind, CoapType::NonConfirmable);
        assert_eq!(packet.options[0].number, 15);
        assert_eq!(packet.options[0].value, b"abcdefghijklm");
        assert_eq!(packet.payload, b"!");
    }

    #[test]
    fn test_parse_rejects() {
        // Version 2
        assert!(CoapPacket::parse(&[0x80, 0x01, 0x00, 0x01]).is_err());
        // Token length 9
        assert!(CoapPacket::parse(&[0x49, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        // Reserved delta nibble
        assert!(CoapPacket::parse(&[0x40, 0x01, 0x00, 0x01, 0xF1, 0x00]).is_err());
        // Option value past the end
        assert!(CoapPacket::parse(&[0x40, 0x01, 0x00, 0x01, 0xB5, b'a']).is_err());
        // Marker without payload
        assert!(CoapPacket::parse(&[0x40, 0x01, 0x00, 0x01, 0xFF]).is_err());
    }

    #[test]
    fn test_decode_content_format() {
        let bytes = [0x50, 0x02, 0x00, 0x07, 0xB1, b'a', 0x11, 50, PAYLOAD_MARKER, b'{', b'}'];
        let message = CoapAdapter::new().decode(&bytes).unwrap();
        assert_eq!(message.destination.as_deref(), Some("/a"));
        assert_eq!(message.content_type.as_deref(), Some("application/json"));
        assert_eq!(message.qos, QoS::AtMostOnce);
        assert_eq!(message.payload, b"{}");
    }

    #[test]
    fn test_encode_path_and_ids() {
        let mut adapter = CoapAdapter::new();
        let message = InternalMessage::new(Protocol::Coap)
            .with_destination("/sensors/temp")
            .with_payload(b"21.5".to_vec())
            .with_qos(QoS::AtLeastOnce);
        let mut out = [0u8; 64];

        let written = adapter.encode(&message, &mut out).unwrap();
        assert_eq!(&out[..4], &[0x40, CODE_GET, 0x00, 0x01]);
        assert_eq!(out[4], 0xB7);
        assert_eq!(&out[5..12], b"sensors");
        assert_eq!(out[12], 0x04);
        assert_eq!(out[written - 5], PAYLOAD_MARKER);

        adapter.encode(&message, &mut out).unwrap();
        assert_eq!(&out[2..4], &[0x00, 0x02]);
    }

    #[test]
    fn test_option_length_boundaries() {
        for (len, header) in [(12, vec![0xBC]), (13, vec![0xBD, 0x00]), (268, vec![0xBD, 0xFF])] {
            let mut out = Vec::new();
            write_option(&mut out, 0, OPTION_URI_PATH, &vec![b's'; len]).unwrap();
            assert_eq!(&out[..header.len()], header.as_slice());
            assert_eq!(out.len(), header.len() + len);
        }

        let mut out = vec![0x40, CODE_GET, 0x00, 0x01];
        write_option(&mut out, 0, OPTION_URI_PATH, &vec![b's'; 269]).unwrap();
        assert_eq!(&out[4..7], &[0xBE, 0x00, 0x00]);
        let packet = CoapPacket::parse(&out).unwrap();
        assert_eq!(packet.options[0].value.len(), 269);

        let mut out = Vec::new();
        write_option(&mut out, 0, OPTION_URI_PATH, &vec![b's'; MAX_OPTION_EXTENDED]).unwrap();
        assert_eq!(&out[..3], &[0xBE, 0xFF, 0xFF]);
        let too_long = vec![b's'; MAX_OPTION_EXTENDED + 1];
        assert!(matches!(
            write_option(&mut Vec::new(), 0, OPTION_URI_PATH, &too_long),
            Err(ErrorKind::InvalidParameter(_))
        ));
        assert!(write_option(&mut Vec::new(), OPTION_CONTENT_FORMAT, OPTION_URI_PATH, b"a").is_err());
    }

    #[test]
    fn test_encode_rejects_oversized_messages() {
        let mut adapter = CoapAdapter::new();
        let mut out = vec![0u8; 80_000];

        let long_path = format!("/{}", "s".repeat(70_000));
        let message = InternalMessage::new(Protocol::Coap).with_destination(long_path);
        assert!(matches!(
            adapter.encode(&message, &mut out).unwrap_err(),
            ErrorKind::InvalidParameter(_)
        ));

        let message = InternalMessage::new(Protocol::Coap).with_payload(vec![0u8; 1200]);
        assert!(matches!(
            adapter.encode(&message, &mut out).unwrap_err(),
            ErrorKind::InvalidParameter(_)
        ));

        let path = format!("/{}", "s".repeat(300));
        let message = InternalMessage::new(Protocol::Coap).with_destination(path.clone());
        let written = adapter.encode(&message, &mut out).unwrap();
        let decoded = adapter.decode(&out[..written]).unwrap();
        assert_eq!(decoded.destination.as_deref(), Some(path.as_str()));
    }

    #[test]
    fn test_encode_overflow() {
        let mut adapter = CoapAdapter::new();
        let message = InternalMessage::new(Protocol::Coap).with_payload(vec![0u8; 32]);
        let mut out = [0u8; 8];
        assert!(matches!(
            adapter.encode(&message, &mut out).unwrap_err(),
            ErrorKind::BufferOverflow { needed: 37, available: 8 }
        ));
        assert!(matches!(
            adapter.encode(&InternalMessage::new(Protocol::Mqtt), &mut out).unwrap_err(),
            ErrorKind::ProtocolError(_)
        ));
    }
}
