//! Per-protocol request handlers.
//!
//! A handler receives one framed message and returns the [`Action`]s the loop
//! should carry out: reply bytes, messages to forward, or a close request.
//! Handlers never touch sockets or buffers directly.

use paumiot_core::error::{ErrorKind, Result};
use paumiot_protocol::{
    http::{header_block_len, MAX_RESPONSE_LEN},
    pal::mqtt as mqtt_codec,
    PalRegistry, Protocol,
};

use crate::{connection::ConnectionRecord, event_types::Action};

/// CoAP requests and pings.
pub mod coap;
/// DNS queries answered with a synthetic A record.
pub mod dns;
/// TLS and QUIC header inspection.
pub mod encrypted;
/// HTTP/1.x requests answered with a JSON status document.
pub mod http;
/// MQTT control packets.
pub mod mqtt;

/// Reply sent for UDP datagrams no handler accepts.
pub const UNSUPPORTED_UDP_REPLY: &[u8] = b"ERROR: Unsupported UDP protocol";

/// Shared services a handler may use.
#[derive(Debug)]
pub struct HandlerContext<'a> {
    /// Adaptation layer used to decode application messages
    pub pal: &'a mut PalRegistry,
}

/// Length of the next complete message at the front of `buffered`.
///
/// `capacity` is the size of the read buffer; a message that can never fit is
/// a protocol error.
pub fn next_frame(protocol: Protocol, buffered: &[u8], capacity: usize) -> Result<Option<usize>> {
    if buffered.is_empty() {
        return Ok(None);
    }
    let full = buffered.len() >= capacity;
    match protocol {
        Protocol::Mqtt => {
            let len = mqtt_codec::frame_len(buffered)
                .map_err(|_| ErrorKind::ProtocolError("unframeable MQTT stream"))?;
            match len {
                Some(len) if len > capacity => {
                    Err(ErrorKind::ProtocolError("MQTT packet larger than the read buffer"))
                }
                Some(len) if len <= buffered.len() => Ok(Some(len)),
                _ => Ok(None),
            }
        }
        Protocol::Http => match header_block_len(buffered) {
            Some(len) => Ok(Some(len)),
            None if full => Ok(Some(buffered.len())),
            None => Ok(None),
        },
        _ => Ok(Some(buffered.len())),
    }
}

/// Largest reply a `frame_len`-byte message of `protocol` can produce.
pub fn max_reply_len(protocol: Protocol, frame_len: usize) -> usize {
    match protocol {
        Protocol::Mqtt => mqtt::MAX_REPLY_LEN,
        Protocol::Coap => coap::MAX_REPLY_LEN,
        Protocol::Http => MAX_RESPONSE_LEN,
        // Echoed question plus one answer record, with the TCP length prefix
        Protocol::Dns => frame_len + dns::ANSWER_OVERHEAD,
        Protocol::Tls | Protocol::Quic | Protocol::Unknown => 0,
    }
}

/// Handles one framed message on a classified TCP connection.
pub fn handle(
    record: &mut ConnectionRecord,
    frame: &[u8],
    ctx: &mut HandlerContext<'_>,
) -> Result<Vec<Action>> {
    match record.protocol() {
        Protocol::Mqtt => mqtt::handle(record, frame, ctx),
        Protocol::Coap => coap::handle(record, frame, ctx),
        Protocol::Http => http::handle(record, frame),
        Protocol::Dns => dns::handle(record, frame),
        Protocol::Tls => encrypted::handle_tls(record, frame),
        Protocol::Quic => encrypted::handle_quic(record, frame),
        Protocol::Unknown => Err(ErrorKind::ProtocolError("connection is not classified")),
    }
}

/// Handles one datagram classified as `protocol`.
pub fn handle_datagram(
    protocol: Protocol,
    datagram: &[u8],
    ctx: &mut HandlerContext<'_>,
) -> Result<Vec<Action>> {
    match protocol {
        Protocol::Dns => dns::handle_datagram(datagram),
        Protocol::Coap => coap::handle_datagram(datagram, ctx),
        Protocol::Tls | Protocol::Quic => encrypted::inspect_datagram(protocol, datagram),
        _ => Err(ErrorKind::NotSupported("UDP protocol")),
    }
}
