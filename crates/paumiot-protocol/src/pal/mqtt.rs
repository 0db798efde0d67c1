use std::convert::TryFrom;

use byteorder::{BigEndian, ByteOrder};
use paumiot_core::{
    constants::MQTT_MAX_REMAINING_LENGTH,
    error::{DecodingErrorKind, ErrorKind, Result},
};
use tracing::trace;

use super::{Adapter, Capabilities, ControlResponse};
use crate::{
    message::{InternalMessage, QoS},
    protocol::{EnumConverter, Protocol},
    varint::{self, VarInt},
};

/// MQTT control packet type (upper nibble of the fixed header).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Client connect request
    Connect = 1,
    /// Connect acknowledgment
    Connack = 2,
    /// Publish message
    Publish = 3,
    /// QoS 1 acknowledgment
    Puback = 4,
    /// QoS 2 received
    Pubrec = 5,
    /// QoS 2 release
    Pubrel = 6,
    /// QoS 2 complete
    Pubcomp = 7,
    /// Subscribe request
    Subscribe = 8,
    /// Subscribe acknowledgment
    Suback = 9,
    /// Unsubscribe request
    Unsubscribe = 10,
    /// Unsubscribe acknowledgment
    Unsuback = 11,
    /// Ping request
    Pingreq = 12,
    /// Ping response
    Pingresp = 13,
    /// Client disconnect
    Disconnect = 14,
}

impl PacketType {
    /// Maps a type nibble to a control packet type; 0 and 15 are rejected.
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        Some(match nibble {
            1 => PacketType::Connect,
            2 => PacketType::Connack,
            3 => PacketType::Publish,
            4 => PacketType::Puback,
            5 => PacketType::Pubrec,
            6 => PacketType::Pubrel,
            7 => PacketType::Pubcomp,
            8 => PacketType::Subscribe,
            9 => PacketType::Suback,
            10 => PacketType::Unsubscribe,
            11 => PacketType::Unsuback,
            12 => PacketType::Pingreq,
            13 => PacketType::Pingresp,
            14 => PacketType::Disconnect,
            _ => return None,
        })
    }
}

impl EnumConverter for PacketType {
    type Enum = PacketType;

    fn to_u8(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = ErrorKind;
    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        PacketType::from_nibble(value).ok_or(ErrorKind::MalformedPacket(DecodingErrorKind::PacketType))
    }
}

/// Returns true if the fixed-header flag nibble is legal for `kind`.
pub fn flags_valid(kind: PacketType, flags: u8) -> bool {
    match kind {
        PacketType::Publish => (flags >> 1) & 0x03 != 3,
        PacketType::Pubrel | PacketType::Subscribe | PacketType::Unsubscribe => flags == 0x02,
        _ => flags == 0,
    }
}

/// Size of the first packet in `bytes`, or `None` while its header is incomplete.
pub fn frame_len(bytes: &[u8]) -> Result<Option<usize>> {
    if bytes.len() < 2 {
        return Ok(None);
    }
    match varint::decode(&bytes[1..])? {
        VarInt::Complete { value, len } => Ok(Some(1 + len + value)),
        VarInt::Incomplete => Ok(None),
    }
}

/// Protocol level negotiated for PUBLISH encoding.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MqttVersion {
    /// Level 4
    V311 = 4,
    /// Level 5, with a properties block after the packet id
    V5 = 5,
}

impl MqttVersion {
    fn as_str(&self) -> &'static str {
        match self {
            MqttVersion::V311 => "3.1.1",
            MqttVersion::V5 => "5",
        }
    }
}

/// Reads a 16-bit-length-prefixed UTF-8 string at `pos`.
pub fn read_string(bytes: &[u8], pos: &mut usize) -> Result<String> {
    let truncated = ErrorKind::MalformedPacket(DecodingErrorKind::Truncated);
    let len_bytes = bytes.get(*pos..*pos + 2).ok_or(truncated)?;
    let len = BigEndian::read_u16(len_bytes) as usize;
    let raw = bytes
        .get(*pos + 2..*pos + 2 + len)
        .ok_or(ErrorKind::MalformedPacket(DecodingErrorKind::Truncated))?;
    let text = std::str::from_utf8(raw).map_err(|_| ErrorKind::MalformedPacket(DecodingErrorKind::Utf8))?;
    *pos += 2 + len;
    Ok(text.to_owned())
}

/// Variable header and client id of a CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    /// Protocol level (3, 4 or 5)
    pub level: u8,
    /// Connect flags byte
    pub flags: u8,
    /// Keep-alive interval in seconds
    pub keep_alive: u16,
    /// Client identifier, when the payload carries a readable one
    pub client_id: Option<String>,
}

impl ConnectPacket {
    /// Parses the body of a CONNECT (everything after the fixed header).
    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let name = read_string(body, &mut pos)?;
        if name != "MQTT" && name != "MQIsdp" {
            return Err(ErrorKind::MalformedPacket(DecodingErrorKind::Protocol));
        }
        let fixed = body
            .get(pos..pos + 4)
            .ok_or(ErrorKind::MalformedPacket(DecodingErrorKind::Truncated))?;
        let level = fixed[0];
        if !(3..=5).contains(&level) {
            return Err(ErrorKind::MalformedPacket(DecodingErrorKind::Version));
        }
        let flags = fixed[1];
        let keep_alive = BigEndian::read_u16(&fixed[2..4]);
        pos += 4;

        if level == MqttVersion::V5 as u8 {
            let properties = varint::decode_complete(body.get(pos..).unwrap_or_default());
            match properties {
                Ok((len, prefix)) => pos += prefix + len,
                Err(_) => pos = body.len(),
            }
        }
        let client_id = read_string(body, &mut pos).ok();

        Ok(Self { level, flags, keep_alive, client_id })
    }

    /// Clean-session (v3.1.1) or clean-start (v5) flag.
    pub fn clean_session(&self) -> bool {
        self.flags & 0x02 != 0
    }
}

/// Reads the packet identifier that opens a packet body.
pub fn packet_id(body: &[u8]) -> Result<u16> {
    body.get(0..2)
        .map(BigEndian::read_u16)
        .ok_or(ErrorKind::MalformedPacket(DecodingErrorKind::Truncated))
}

/// Adapter for MQTT PUBLISH packets.
#[derive(Debug)]
pub struct MqttAdapter {
    version: MqttVersion,
    next_packet_id: u16,
}

impl Default for MqttAdapter {
    fn default() -> Self {
        Self::new(MqttVersion::V311)
    }
}

impl MqttAdapter {
    /// Creates an adapter speaking the given protocol level.
    pub fn new(version: MqttVersion) -> Self {
        Self { version, next_packet_id: 1 }
    }

    /// Protocol level in use.
    pub fn mqtt_version(&self) -> MqttVersion {
        self.version
    }

    // Wraps at 16 bits and never hands out 0.
    fn allocate_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = match self.next_packet_id.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        id
    }

    fn decode_publish(&self, body: &[u8], flags: u8) -> Result<InternalMessage> {
        let qos = QoS::try_from((flags >> 1) & 0x03)?;
        let retain = flags & 0x01 != 0;

        let mut pos = 0;
        let topic = read_string(body, &mut pos)?;

        if qos != QoS::AtMostOnce {
            if body.len() < pos + 2 {
                return Err(ErrorKind::MalformedPacket(DecodingErrorKind::Truncated));
            }
            pos += 2;
        }

        if self.version == MqttVersion::V5 {
            let (properties_len, len) = varint::decode_complete(body.get(pos..).unwrap_or_default())?;
            pos += len;
            if body.len() < pos + properties_len {
                return Err(ErrorKind::MalformedPacket(DecodingErrorKind::Truncated));
            }
            pos += properties_len;
        }

        Ok(InternalMessage::new(Protocol::Mqtt)
            .with_destination(topic)
            .with_qos(qos)
            .with_retain(retain)
            .with_payload(&body[pos..]))
    }
}

impl Adapter for MqttAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Mqtt
    }

    fn name(&self) -> &'static str {
        "MQTT Adapter"
    }

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn decode(&self, bytes: &[u8]) -> Result<InternalMessage> {
        if bytes.len() < 2 {
            return Err(ErrorKind::MalformedPacket(DecodingErrorKind::Truncated));
        }
        let kind = PacketType::try_from(bytes[0] >> 4)?;
        let (remaining, len) = varint::decode_complete(&bytes[1..])?;
        if 1 + len + remaining != bytes.len() {
            return Err(ErrorKind::MalformedPacket(DecodingErrorKind::LengthMismatch));
        }

        match kind {
            PacketType::Publish => self.decode_publish(&bytes[1 + len..], bytes[0] & 0x0F),
            PacketType::Connect | PacketType::Subscribe | PacketType::Unsubscribe => {
                Err(ErrorKind::NotSupported("MQTT packet type"))
            }
            _ => Err(ErrorKind::MalformedPacket(DecodingErrorKind::PacketType)),
        }
    }

    fn encode(&mut self, message: &InternalMessage, out: &mut [u8]) -> Result<usize> {
        if message.protocol != Protocol::Mqtt {
            return Err(ErrorKind::ProtocolError("message is not an MQTT message"));
        }
        let topic = message
            .destination
            .as_deref()
            .ok_or(ErrorKind::InvalidParameter("MQTT publish requires a topic"))?;
        if topic.len() > u16::MAX as usize {
            return Err(ErrorKind::InvalidParameter("MQTT topic longer than 65535 bytes"));
        }

        let with_id = message.qos != QoS::AtMostOnce;
        let mut remaining = 2 + topic.len() + message.payload.len();
        if with_id {
            remaining += 2;
        }
        if self.version == MqttVersion::V5 {
            remaining += 1;
        }
        if remaining > MQTT_MAX_REMAINING_LENGTH {
            return Err(ErrorKind::InvalidParameter("MQTT packet exceeds maximum size"));
        }
        let total = 1 + varint::encoded_len(remaining) + remaining;
        if total > out.len() {
            return Err(ErrorKind::BufferOverflow { needed: total, available: out.len() });
        }

        let mut packet = Vec::with_capacity(total);
        let flags = (message.qos.to_u8() << 1) | message.retain as u8;
        packet.push((PacketType::Publish.to_u8() << 4) | flags);
        varint::encode(remaining, &mut packet)?;
        packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        packet.extend_from_slice(topic.as_bytes());
        if with_id {
            let id = self.allocate_packet_id();
            packet.extend_from_slice(&id.to_be_bytes());
        }
        if self.version == MqttVersion::V5 {
            packet.push(0);
        }
        packet.extend_from_slice(&message.payload);

        out[..total].copy_from_slice(&packet);
        trace!("[PAL] encoded MQTT PUBLISH to {} ({} bytes)", topic, total);
        Ok(total)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            qos0: true,
            qos1: true,
            qos2: true,
            retain: true,
            wildcards: true,
            max_packet_size: MQTT_MAX_REMAINING_LENGTH,
            max_topic_alias: u16::MAX,
        }
    }

    fn control(&mut self, command: &str, argument: Option<&str>) -> Result<ControlResponse> {
        match command {
            "reset" => {
                self.next_packet_id = 1;
                Ok(ControlResponse::Done)
            }
            "set_version" => {
                self.version = match argument {
                    Some("3.1.1") | Some("4") => MqttVersion::V311,
                    Some("5") | Some("5.0") => MqttVersion::V5,
                    _ => return Err(ErrorKind::InvalidParameter("MQTT version must be 3.1.1 or 5")),
                };
                Ok(ControlResponse::Done)
            }
            "get_version" => Ok(ControlResponse::Version(self.version.as_str())),
            _ => Err(ErrorKind::NotSupported("MQTT control command")),
        }
    }
}
