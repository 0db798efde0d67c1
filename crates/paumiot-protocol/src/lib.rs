#![warn(missing_docs)]

//! paumiot-protocol: protocol detection, the adaptation layer, and inline codecs.

/// Protocol classification of raw byte buffers.
pub mod detector;
/// DNS header/question decoding and synthetic responses.
pub mod dns;
/// TLS and QUIC cleartext header inspection.
pub mod encrypted;
/// HTTP/1.x request decoding and JSON responses.
pub mod http;
/// Protocol-neutral message type.
pub mod message;
/// Protocol Adaptation Layer (MQTT, CoAP).
pub mod pal;
/// Protocol and transport identifiers.
pub mod protocol;
/// MQTT variable byte integers.
pub mod varint;

pub use detector::{ConfidenceTier, Detection, DetectionCache, ProtocolDetector};
pub use message::{InternalMessage, QoS};
pub use pal::{Adapter, Capabilities, CoapAdapter, ControlResponse, MqttAdapter, PalRegistry};
pub use protocol::{EnumConverter, Protocol, Transport};
