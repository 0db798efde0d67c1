#![warn(missing_docs)]

//! paumiot-core: foundational types and utilities.
//!
//! This crate provides the minimal set of core utilities shared across all layers:
//! - Configuration types
//! - Error handling
//! - Sizing constants
//! - Memory utilities (fixed-block pool, bounded MPMC queue)
//!
//! Protocol-specific logic lives in specialized crates:
//! - `paumiot-protocol`: protocol detection, PAL codecs, HTTP and DNS inline codecs
//! - `paumiot-host`: connection engine, session table, congestion control

/// Sizing constants shared across layers.
pub mod constants {
    /// Maximum number of simultaneous connections.
    pub const MAX_CLIENTS: usize = 10_000;
    /// Size of the per-connection read buffer.
    pub const READ_BUFFER_SIZE: usize = 4096;
    /// Size of the per-connection write buffer.
    pub const WRITE_BUFFER_SIZE: usize = 4096;
    /// Maximum length of a session id string in bytes.
    pub const MAX_SESSION_ID_LEN: usize = 64;
    /// Number of hash buckets in the session table.
    pub const CONNECTION_BUCKETS: usize = 1024;
    /// Maximum readiness events drained per poll.
    pub const MAX_EVENTS: usize = 1000;
    /// Default listening port for both TCP and UDP.
    pub const DEFAULT_PORT: u16 = 8080;
    /// Number of socket-state transitions kept per connection.
    pub const STATE_HISTORY_LEN: usize = 16;
    /// Stamp written into every live connection record.
    pub const CONNECTION_MAGIC: u32 = 0xC0FF_EE42;
    /// Largest datagram accepted on the UDP socket.
    pub const MAX_DATAGRAM_SIZE: usize = 65_507;
    /// Largest value an MQTT variable byte integer can carry.
    pub const MQTT_MAX_REMAINING_LENGTH: usize = 268_435_455;
    /// Largest CoAP message the adapter will emit.
    pub const COAP_MAX_MESSAGE_SIZE: usize = 1152;
    /// Gateway version reported in HTTP `Server` headers.
    pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");
}

/// Configuration options for the gateway.
pub mod config;
/// Error types and results.
pub mod error;
/// Fixed-block memory pool.
pub mod memory_pool;
/// Bounded lock-free MPMC ring queue.
pub mod ring_queue;

pub use config::Config;
pub use error::{DecodingErrorKind, ErrorKind, Result};
pub use memory_pool::{Block, MemoryPool};
pub use ring_queue::RingQueue;
