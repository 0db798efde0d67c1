#![warn(missing_docs)]

//! PaumIoT: a protocol-agnostic IoT gateway facade for the workspace.
//!
//! One port, both transports. The gateway classifies each TCP connection and
//! each UDP datagram as MQTT, CoAP, HTTP or DNS (optionally TLS or QUIC) and
//! answers it inline, while decoded application messages are handed to
//! downstream routing.
//!
//! - Gateway and events (`Gateway`, `GatewayEvent`)
//! - Messages and the adaptation layer (`InternalMessage`, `PalRegistry`)
//! - Core configuration and errors (`Config`, `ErrorKind`)
//!
//! Example
//! ```no_run
//! use paumiot::{Config, Gateway, GatewayEvent};
//!
//! let mut gateway = Gateway::bind(Config::default()).unwrap();
//! let events = gateway.get_event_receiver();
//!
//! gateway.manual_poll().unwrap();
//! while let Ok(event) = events.try_recv() {
//!     if let GatewayEvent::Message(message) = event {
//!         println!("{:?} -> {:?}", message.protocol, message.destination);
//!     }
//! }
//! ```

// Core config and errors
pub use paumiot_core::{
    config::Config,
    error::{DecodingErrorKind, ErrorKind, Result},
};
// Host: event loop, sessions and dispatch
pub use paumiot_host::{
    Gateway, GatewayEvent, GatewayStats, MessageHandler, SocketState, StatsSnapshot,
};
// Protocol: detection, messages and adapters
pub use paumiot_protocol::{
    Detection, InternalMessage, PalRegistry, Protocol, ProtocolDetector, QoS, Transport,
};

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{
        Config, ErrorKind, Gateway, GatewayEvent, InternalMessage, MessageHandler, Protocol, QoS,
        Result,
    };
}
