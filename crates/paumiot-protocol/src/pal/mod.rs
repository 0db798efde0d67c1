//! Protocol Adaptation Layer: converts wire packets to and from [`InternalMessage`].
//!
//! Each protocol contributes one [`Adapter`]. Adapters are registered in a
//! [`PalRegistry`], which allows at most one adapter per protocol and keeps
//! per-protocol traffic counters.

use std::fmt;

use paumiot_core::error::Result;

use crate::{message::InternalMessage, protocol::Protocol};

/// CoAP (RFC 7252) adapter.
pub mod coap;
/// MQTT 3.1.1 / 5 PUBLISH adapter.
pub mod mqtt;
/// Adapter registry.
pub mod registry;

pub use coap::CoapAdapter;
pub use mqtt::MqttAdapter;
pub use registry::{PalRegistry, PalStats};

/// Feature set advertised by an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// At-most-once delivery
    pub qos0: bool,
    /// At-least-once delivery
    pub qos1: bool,
    /// Exactly-once delivery
    pub qos2: bool,
    /// Retained messages
    pub retain: bool,
    /// Topic wildcards
    pub wildcards: bool,
    /// Largest packet the protocol allows
    pub max_packet_size: usize,
    /// Highest topic alias (0 = unsupported)
    pub max_topic_alias: u16,
}

/// Outcome of a control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    /// Command applied
    Done,
    /// Current protocol version string
    Version(&'static str),
}

/// Translates one protocol's packets to and from [`InternalMessage`].
pub trait Adapter: Send + fmt::Debug {
    /// Protocol handled by this adapter.
    fn protocol(&self) -> Protocol;

    /// Human-readable adapter name.
    fn name(&self) -> &'static str;

    /// Adapter implementation version.
    fn version(&self) -> &'static str;

    /// Decodes one complete packet.
    fn decode(&self, bytes: &[u8]) -> Result<InternalMessage>;

    /// Encodes `message` into `out`, returning the bytes written.
    ///
    /// Fails with `BufferOverflow` when `out` is too small; nothing is consumed in that case.
    fn encode(&mut self, message: &InternalMessage, out: &mut [u8]) -> Result<usize>;

    /// Feature set of the protocol.
    fn capabilities(&self) -> Capabilities;

    /// Runs a named control command (`reset`, `set_version`, `get_version`).
    fn control(&mut self, command: &str, argument: Option<&str>) -> Result<ControlResponse>;
}
