//! Protocol-neutral message exchanged between the PAL codecs and downstream routing.

use std::{
    convert::TryFrom,
    time::{SystemTime, UNIX_EPOCH},
};

use paumiot_core::error::{DecodingErrorKind, ErrorKind};
use uuid::Uuid;

use crate::protocol::{EnumConverter, Protocol};

/// Delivery guarantee requested for a message.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum QoS {
    /// At most once
    #[default]
    AtMostOnce = 0,
    /// At least once
    AtLeastOnce = 1,
    /// Exactly once
    ExactlyOnce = 2,
}

impl EnumConverter for QoS {
    type Enum = QoS;

    fn to_u8(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for QoS {
    type Error = ErrorKind;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ErrorKind::MalformedPacket(DecodingErrorKind::Qos)),
        }
    }
}

/// Message produced by PAL decoders and consumed by PAL encoders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InternalMessage {
    /// Random UUIDv4 identifier
    pub id: Uuid,
    /// Creation time, `YYYY-MM-DDTHH:MM:SSZ`
    pub timestamp: String,
    /// Originating client or session, if known
    pub source: Option<String>,
    /// Topic or URI path
    pub destination: Option<String>,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// MIME type of the payload, if known
    pub content_type: Option<String>,
    /// Requested delivery guarantee
    pub qos: QoS,
    /// Protocol the message was decoded from or should be encoded to
    pub protocol: Protocol,
    /// MQTT retain flag
    pub retain: bool,
    /// Time to live in seconds (0 = no expiry)
    pub ttl: u32,
}

impl InternalMessage {
    /// Creates an empty message stamped with a fresh id and the current time.
    pub fn new(protocol: Protocol) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: iso8601_now(),
            source: None,
            destination: None,
            payload: Vec::new(),
            content_type: None,
            qos: QoS::AtMostOnce,
            protocol,
            retain: false,
            ttl: 0,
        }
    }

    /// Sets the destination topic or path.
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Sets the payload.
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Sets the delivery guarantee.
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Sets the retain flag.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Sets the payload MIME type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Length of the payload in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn iso8601_now() -> String {
    iso8601(SystemTime::now())
}

/// Formats `time` as `YYYY-MM-DDTHH:MM:SSZ` (UTC, second precision).
pub fn iso8601(time: SystemTime) -> String {
    let secs = time.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        day,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

// Days since 1970-01-01 to a proleptic Gregorian date.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_iso8601_known_dates() {
        assert_eq!(iso8601(UNIX_EPOCH), "1970-01-01T00:00:00Z");
        // 2000-02-29 is a leap day
        assert_eq!(iso8601(UNIX_EPOCH + Duration::from_secs(951_782_400)), "2000-02-29T00:00:00Z");
        assert_eq!(iso8601(UNIX_EPOCH + Duration::from_secs(1_700_000_000)), "2023-11-14T22:13:20Z");
    }

    #[test]
    fn test_new_message_defaults() {
        let a = InternalMessage::new(Protocol::Mqtt);
        let b = InternalMessage::new(Protocol::Mqtt);

        assert_ne!(a.id, b.id);
        assert_eq!(a.id.get_version_num(), 4);
        assert_eq!(a.timestamp.len(), 20);
        assert_eq!(a.qos, QoS::AtMostOnce);
        assert!(!a.retain);
        assert_eq!(a.ttl, 0);
    }

    #[test]
    fn test_qos_from_u8() {
        assert_eq!(QoS::try_from(2).unwrap(), QoS::ExactlyOnce);
        assert!(QoS::try_from(3).is_err());
    }
}
