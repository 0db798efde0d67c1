use std::{convert::TryFrom, fmt};

use paumiot_core::error::{DecodingErrorKind, ErrorKind};

/// Helper trait to convert enums to u8 values for wire format.
pub trait EnumConverter {
    /// The enum type this converter works with.
    type Enum;

    /// Converts the enum to a u8 for serialization.
    fn to_u8(&self) -> u8;
}

/// Application protocol carried by a connection or datagram.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub enum Protocol {
    /// Not yet classified
    #[default]
    Unknown = 0,
    /// MQTT 3.1.1 / 5
    Mqtt = 1,
    /// CoAP (RFC 7252)
    Coap = 2,
    /// HTTP/1.x
    Http = 3,
    /// DNS (RFC 1035)
    Dns = 4,
    /// TLS record layer
    Tls = 5,
    /// QUIC long header
    Quic = 6,
}

impl Protocol {
    /// Every classified protocol, in statistics order.
    pub const ALL: [Protocol; 6] =
        [Protocol::Mqtt, Protocol::Coap, Protocol::Http, Protocol::Dns, Protocol::Tls, Protocol::Quic];

    /// Short upper-case name used in logs and session ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Unknown => "UNKNOWN",
            Protocol::Mqtt => "MQTT",
            Protocol::Coap => "COAP",
            Protocol::Http => "HTTP",
            Protocol::Dns => "DNS",
            Protocol::Tls => "TLS",
            Protocol::Quic => "QUIC",
        }
    }

    /// Index into per-protocol counter arrays (`Unknown` is 0).
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl EnumConverter for Protocol {
    type Enum = Protocol;

    fn to_u8(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for Protocol {
    type Error = ErrorKind;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Protocol::Unknown),
            1 => Ok(Protocol::Mqtt),
            2 => Ok(Protocol::Coap),
            3 => Ok(Protocol::Http),
            4 => Ok(Protocol::Dns),
            5 => Ok(Protocol::Tls),
            6 => Ok(Protocol::Quic),
            _ => Err(ErrorKind::MalformedPacket(DecodingErrorKind::Protocol)),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport a buffer arrived on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Stream socket
    Tcp,
    /// Datagram socket
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transport::Tcp => "TCP",
            Transport::Udp => "UDP",
        })
    }
}
