//! Event and action types for the gateway loop.
//!
//! - `Action`: instructions a protocol handler returns to the loop
//! - `GatewayEvent`: notifications published to the embedding application

use std::net::SocketAddr;

use paumiot_protocol::{InternalMessage, Protocol};

/// Actions that protocol handlers request from the event loop.
#[derive(Debug, PartialEq)]
pub enum Action {
    /// Queue the given bytes on the connection's write buffer (or reply datagram)
    Reply(Vec<u8>),
    /// Hand a decoded message to downstream routing
    Forward(InternalMessage),
    /// Close the connection once pending output has drained
    Close,
}

/// Events published on the gateway's event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// A TCP connection was accepted.
    Connected {
        /// Connection id
        id: u32,
        /// Remote address
        peer: SocketAddr,
    },
    /// A TCP connection was classified.
    Classified {
        /// Connection id
        id: u32,
        /// Detected protocol
        protocol: Protocol,
        /// Detection confidence in [0, 100]
        confidence: u8,
    },
    /// Admission control shed traffic from a connection.
    Throttled {
        /// Connection id
        id: u32,
        /// Remote address
        peer: SocketAddr,
    },
    /// A TCP connection was released.
    Disconnected {
        /// Connection id
        id: u32,
        /// Remote address
        peer: SocketAddr,
    },
    /// A decoded message, when no dispatch pool is configured.
    Message(InternalMessage),
}
