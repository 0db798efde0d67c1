use std::{
    fmt::{self, Display, Formatter},
    io,
};

use thiserror::Error;

/// Wrapped result type for gateway operations.
pub type Result<T> = std::result::Result<T, ErrorKind>;

/// Enum with all possible gateway errors.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// Caller violated a precondition.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// A pool or table is exhausted, or the allocator refused.
    #[error("out of memory")]
    OutOfMemory,
    /// An encoder ran out of space in the output buffer.
    #[error("buffer overflow: need {needed} bytes, have {available}")]
    BufferOverflow {
        /// Bytes the operation required.
        needed: usize,
        /// Bytes the caller provided.
        available: usize,
    },
    /// Back-pressure: a bounded queue or channel is full.
    #[error("queue full")]
    QueueFull,
    /// A bounded queue is drained.
    #[error("queue empty")]
    QueueEmpty,
    /// The peer closed or the network failed.
    #[error("connection lost")]
    ConnectionLost,
    /// The idle timer fired.
    #[error("timed out")]
    Timeout,
    /// Bytes could not be classified or violate the protocol state machine.
    #[error("protocol error: {0}")]
    ProtocolError(&'static str),
    /// Bytes failed wire-level validation.
    #[error("malformed packet: {0}")]
    MalformedPacket(DecodingErrorKind),
    /// Packet type or command outside the implemented subset.
    #[error("not supported: {0}")]
    NotSupported(&'static str),
    /// A unique resource was registered twice.
    #[error("already initialized")]
    AlreadyInitialized,
    /// Reserved for bugs; counted, logged, and the connection is closed.
    #[error("internal error: {0}")]
    Internal(&'static str),
    /// Wrapper around a std io::Error.
    #[error("io error: {0}")]
    IoError(#[from] io::Error),
}

impl ErrorKind {
    /// Returns true if the error can be handled locally without failing fast.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ErrorKind::InvalidParameter(_))
    }

    /// Returns true if the error leaves the offending connection unusable.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectionLost
                | ErrorKind::Timeout
                | ErrorKind::Internal(_)
                | ErrorKind::ProtocolError(_)
                | ErrorKind::IoError(_)
        )
    }
}

impl From<DecodingErrorKind> for ErrorKind {
    fn from(inner: DecodingErrorKind) -> Self {
        ErrorKind::MalformedPacket(inner)
    }
}

/// Specific wire fault found while decoding a packet.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DecodingErrorKind {
    /// Input ended before a required field.
    Truncated,
    /// MQTT variable byte integer longer than four bytes.
    RemainingLength,
    /// Declared length disagrees with the buffer length.
    LengthMismatch,
    /// Unknown or reserved packet type.
    PacketType,
    /// Unexpected protocol version.
    Version,
    /// Token longer than eight bytes.
    TokenLength,
    /// Option delta or length nibble 15 outside the payload marker.
    ReservedOptionNibble,
    /// Invalid quality of service level.
    Qos,
    /// Field that must be UTF-8 is not.
    Utf8,
    /// Unknown protocol identifier.
    Protocol,
    /// Request line or header block could not be parsed.
    Header,
    /// Domain name labels are malformed.
    QuestionName,
}

impl Display for DecodingErrorKind {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        let text = match self {
            DecodingErrorKind::Truncated => "input truncated",
            DecodingErrorKind::RemainingLength => "remaining length exceeds four bytes",
            DecodingErrorKind::LengthMismatch => "declared length does not match buffer",
            DecodingErrorKind::PacketType => "invalid packet type",
            DecodingErrorKind::Version => "unsupported version",
            DecodingErrorKind::TokenLength => "token length above 8",
            DecodingErrorKind::ReservedOptionNibble => "reserved option nibble",
            DecodingErrorKind::Qos => "invalid QoS",
            DecodingErrorKind::Utf8 => "invalid UTF-8",
            DecodingErrorKind::Protocol => "unknown protocol",
            DecodingErrorKind::Header => "malformed header",
            DecodingErrorKind::QuestionName => "malformed question name",
        };
        write!(fmt, "{}", text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_column() {
        assert!(!ErrorKind::InvalidParameter("zero").is_recoverable());
        assert!(ErrorKind::OutOfMemory.is_recoverable());
        assert!(ErrorKind::QueueFull.is_recoverable());
        assert!(ErrorKind::BufferOverflow { needed: 10, available: 4 }.is_recoverable());
        assert!(ErrorKind::NotSupported("CONNECT").is_recoverable());
    }

    #[test]
    fn test_decoding_error_converts() {
        let err: ErrorKind = DecodingErrorKind::TokenLength.into();
        assert!(matches!(err, ErrorKind::MalformedPacket(DecodingErrorKind::TokenLength)));
        assert_eq!(err.to_string(), "malformed packet: token length above 8");
    }

    #[test]
    fn test_io_error_wraps() {
        let err: ErrorKind = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert!(err.closes_connection());
        assert!(!ErrorKind::MalformedPacket(DecodingErrorKind::Truncated).closes_connection());
    }
}
