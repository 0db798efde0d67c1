//! Per-connection record owned by the session table.

use std::{net::SocketAddr, os::fd::RawFd, time::Instant};

use bitflags::bitflags;
use paumiot_core::{
    config::Config,
    constants::{CONNECTION_MAGIC, MAX_SESSION_ID_LEN},
    error::{ErrorKind, Result},
    memory_pool::{Block, MemoryPool},
};
use paumiot_protocol::Protocol;
use tracing::{debug, error};

use crate::{
    congestion::{CongestionControl, CongestionParams},
    socket_state::{SocketState, StateHistory, Transition},
};

bitflags! {
    /// Session attributes collected while handling traffic.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SessionFlags: u16 {
        /// Record is in the session table
        const ACTIVE = 1 << 0;
        /// Peer completed its protocol handshake
        const AUTHENTICATED = 1 << 1;
        /// MQTT keep-alive requested
        const KEEP_ALIVE = 1 << 2;
        /// MQTT clean session / clean start
        const CLEAN_SESSION = 1 << 3;
        /// CoAP Observe registration seen
        const OBSERVE_ACTIVE = 1 << 4;
        /// HTTP persistent connection
        const HTTP_KEEP_ALIVE = 1 << 5;
        /// DNS recursion desired
        const DNS_RECURSIVE = 1 << 6;
        /// TLS handshake in progress or done
        const TLS_ESTABLISHED = 1 << 7;
    }
}

/// Application-level session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Socket accepted, no handshake yet
    #[default]
    Connected,
    /// Protocol handshake completed
    Authenticated,
    /// Application traffic flowing
    Active,
    /// Peer asked to disconnect
    Disconnecting,
    /// Session over
    Closed,
}

/// MQTT session fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MqttData {
    /// QoS of the last PUBLISH
    pub qos: u8,
    /// Keep-alive seconds from CONNECT
    pub keep_alive: u16,
    /// Protocol level from CONNECT
    pub version: u8,
    /// Client identifier from CONNECT
    pub client_id: Option<String>,
}

/// CoAP exchange fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoapData {
    /// Message id of the last request
    pub message_id: u16,
    /// Token of the last request
    pub token: [u8; 8],
    /// Bytes of `token` in use
    pub token_len: u8,
    /// Observe sequence number
    pub observe_seq: u32,
}

/// HTTP request fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpData {
    /// Request method
    pub method: String,
    /// Request target
    pub uri: String,
    /// Protocol version
    pub version: String,
    /// `Host` header
    pub host: Option<String>,
    /// `User-Agent` header
    pub user_agent: Option<String>,
    /// `Content-Length` header
    pub content_length: Option<usize>,
    /// Connection closes after the response
    pub close: bool,
}

/// DNS message fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsData {
    /// Transaction id
    pub xid: u16,
    /// Header flags
    pub flags: u16,
    /// Question count
    pub qd: u16,
    /// Answer count
    pub an: u16,
    /// First question name
    pub qname: String,
    /// First question type
    pub qtype: u16,
}

/// TLS record fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsData {
    /// Record content type
    pub content_type: u8,
    /// Record version
    pub version: u16,
    /// Handshake message type
    pub handshake_type: u8,
    /// First offered cipher suite
    pub cipher: u16,
}

/// QUIC long-header fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuicData {
    /// Version field
    pub version: u32,
    /// Long-header packet type
    pub packet_type: u8,
    /// Bytes of `cid` in use
    pub cid_len: u8,
    /// Destination connection id
    pub cid: [u8; 20],
}

/// Protocol-specific state; the variant always matches the record's protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProtocolData {
    /// Not yet classified
    #[default]
    Unknown,
    /// MQTT
    Mqtt(MqttData),
    /// CoAP
    Coap(CoapData),
    /// HTTP
    Http(HttpData),
    /// DNS
    Dns(DnsData),
    /// TLS
    Tls(TlsData),
    /// QUIC
    Quic(QuicData),
}

impl ProtocolData {
    /// Empty state for `protocol`.
    pub fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Unknown => ProtocolData::Unknown,
            Protocol::Mqtt => ProtocolData::Mqtt(MqttData::default()),
            Protocol::Coap => ProtocolData::Coap(CoapData::default()),
            Protocol::Http => ProtocolData::Http(HttpData::default()),
            Protocol::Dns => ProtocolData::Dns(DnsData::default()),
            Protocol::Tls => ProtocolData::Tls(TlsData::default()),
            Protocol::Quic => ProtocolData::Quic(QuicData::default()),
        }
    }

    /// Protocol the active variant belongs to.
    pub fn protocol(&self) -> Protocol {
        match self {
            ProtocolData::Unknown => Protocol::Unknown,
            ProtocolData::Mqtt(_) => Protocol::Mqtt,
            ProtocolData::Coap(_) => Protocol::Coap,
            ProtocolData::Http(_) => Protocol::Http,
            ProtocolData::Dns(_) => Protocol::Dns,
            ProtocolData::Tls(_) => Protocol::Tls,
            ProtocolData::Quic(_) => Protocol::Quic,
        }
    }
}

/// Traffic counters of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionCounters {
    /// Bytes read from the socket
    pub bytes_read: u64,
    /// Bytes written to the socket
    pub bytes_written: u64,
    /// Messages dispatched to a handler
    pub messages: u64,
    /// Handler and I/O errors
    pub errors: u64,
}

/// Everything the gateway knows about one TCP connection.
#[derive(Debug)]
pub struct ConnectionRecord {
    magic: u32,
    id: u32,
    socket: RawFd,
    peer: SocketAddr,
    local: SocketAddr,
    session_id: String,

    state: SocketState,
    history: StateHistory,
    invalid_transitions: u32,

    protocol: Protocol,
    /// Confidence of the accepted classification
    pub confidence: u8,
    /// Failed and successful detector runs
    pub detection_attempts: u32,
    /// Time of the last detector run
    pub last_detection: Option<Instant>,

    /// Application-level session state
    pub session_state: SessionState,
    /// Session attribute bits
    pub flags: SessionFlags,
    data: ProtocolData,

    block: Option<Block>,
    read_capacity: usize,
    write_capacity: usize,
    read_pos: usize,
    write_pos: usize,
    bytes_to_write: usize,
    /// Write readiness is part of the registration
    pub write_armed: bool,

    /// Per-connection admission control
    pub congestion: CongestionControl,
    /// Traffic counters
    pub counters: ConnectionCounters,
    created_at: Instant,
    created_unix: u64,
    last_activity: Instant,
}

impl ConnectionRecord {
    /// Creates an unclassified record in the `Free` state.
    pub fn new(
        id: u32,
        socket: RawFd,
        peer: SocketAddr,
        local: SocketAddr,
        config: &Config,
        now: Instant,
        created_unix: u64,
    ) -> Self {
        let mut record = Self {
            magic: CONNECTION_MAGIC,
            id,
            socket,
            peer,
            local,
            session_id: String::new(),
            state: SocketState::Free,
            history: StateHistory::default(),
            invalid_transitions: 0,
            protocol: Protocol::Unknown,
            confidence: 0,
            detection_attempts: 0,
            last_detection: None,
            session_state: SessionState::Connected,
            flags: SessionFlags::empty(),
            data: ProtocolData::Unknown,
            block: None,
            read_capacity: config.read_buffer_size,
            write_capacity: config.write_buffer_size,
            read_pos: 0,
            write_pos: 0,
            bytes_to_write: 0,
            write_armed: false,
            congestion: CongestionControl::new(CongestionParams::from(config), now),
            counters: ConnectionCounters::default(),
            created_at: now,
            created_unix,
            last_activity: now,
        };
        record.refresh_session_id();
        record
    }

    /// Returns true if the record still carries its stamp.
    pub fn is_valid(&self) -> bool {
        self.magic == CONNECTION_MAGIC
    }

    /// Clears the stamp once the record leaves the table.
    pub(crate) fn invalidate(&mut self) {
        self.magic = 0;
    }

    /// Connection id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// OS socket handle.
    pub fn socket(&self) -> RawFd {
        self.socket
    }

    /// Remote address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Local address the connection was accepted on.
    pub fn local(&self) -> SocketAddr {
        self.local
    }

    /// `"<PROTOCOL>_<socket>_<created unix secs>"`.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn refresh_session_id(&mut self) {
        let mut id = format!("{}_{}_{}", self.protocol, self.socket, self.created_unix);
        id.truncate(MAX_SESSION_ID_LEN);
        self.session_id = id;
    }

    // ========================================================================
    // Socket state
    // ========================================================================

    /// Current socket state.
    pub fn state(&self) -> SocketState {
        self.state
    }

    /// Moves to `to` if the matrix allows it; otherwise counts and rejects.
    pub fn transition(&mut self, to: SocketState, now: Instant) -> Result<()> {
        if !self.state.can_transition(to) {
            self.invalid_transitions += 1;
            error!(
                "[STATE] invalid transition {} -> {} on connection {} ({})",
                self.state, to, self.id, self.peer
            );
            return Err(ErrorKind::Internal("invalid socket state transition"));
        }
        if self.state != to {
            debug!("[STATE] connection {}: {} -> {}", self.id, self.state, to);
        }
        self.history.push(Transition { from: self.state, to, at: now });
        self.state = to;
        Ok(())
    }

    /// Recent transitions.
    pub fn history(&self) -> &StateHistory {
        &self.history
    }

    /// Transitions rejected so far.
    pub fn invalid_transitions(&self) -> u32 {
        self.invalid_transitions
    }

    // ========================================================================
    // Protocol
    // ========================================================================

    /// Detected protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Switches protocol, resets the protocol data and rewrites the session id.
    pub fn set_protocol(&mut self, protocol: Protocol, confidence: u8) {
        if self.protocol != protocol {
            self.protocol = protocol;
            self.data = ProtocolData::for_protocol(protocol);
        }
        self.confidence = confidence;
        self.refresh_session_id();
    }

    /// Protocol-specific state.
    pub fn data(&self) -> &ProtocolData {
        &self.data
    }

    /// Mutable protocol-specific state; only handlers update it, in place.
    pub(crate) fn data_mut(&mut self) -> &mut ProtocolData {
        &mut self.data
    }

    // ========================================================================
    // Activity
    // ========================================================================

    /// Refreshes the idle timer.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Time of the last I/O.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Time the record was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    // ========================================================================
    // Buffers
    // ========================================================================

    /// Attaches a pool block holding the read half followed by the write half.
    pub fn attach_buffers(&mut self, block: Block) {
        self.block = Some(block);
    }

    /// Detaches the pool block so it can be returned to the pool.
    pub fn take_buffers(&mut self) -> Option<Block> {
        self.read_pos = 0;
        self.write_pos = 0;
        self.bytes_to_write = 0;
        self.block.take()
    }

    /// Pool block size a connection needs.
    pub fn block_size(config: &Config) -> usize {
        config.read_buffer_size + config.write_buffer_size
    }

    /// Splits this record's pool block into its read and write halves.
    pub fn split_buffers<'a>(
        &self,
        pool: &'a mut MemoryPool,
    ) -> Result<(&'a mut [u8], &'a mut [u8])> {
        let block = self.block.ok_or(ErrorKind::Internal("connection has no buffers"))?;
        let bytes = pool.get_mut(block).ok_or(ErrorKind::Internal("stale buffer block"))?;
        if bytes.len() < self.read_capacity + self.write_capacity {
            return Err(ErrorKind::Internal("buffer block too small"));
        }
        let (read, rest) = bytes.split_at_mut(self.read_capacity);
        Ok((read, &mut rest[..self.write_capacity]))
    }

    /// Bytes buffered for reading.
    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    /// Read buffer capacity.
    pub fn read_capacity(&self) -> usize {
        self.read_capacity
    }

    /// Returns true when no more bytes fit the read buffer.
    pub fn read_full(&self) -> bool {
        self.read_pos >= self.read_capacity
    }

    /// Records `n` bytes read into the read buffer.
    pub fn advance_read(&mut self, n: usize) {
        self.read_pos = (self.read_pos + n).min(self.read_capacity);
        self.counters.bytes_read += n as u64;
    }

    /// Records `n` buffered bytes consumed by the front of the read buffer.
    pub fn consume_read(&mut self, n: usize) {
        self.read_pos -= n.min(self.read_pos);
    }

    /// Free space at the end of the write buffer.
    pub fn write_space(&self) -> usize {
        self.write_capacity - self.bytes_to_write
    }

    /// Write buffer capacity.
    pub fn write_capacity(&self) -> usize {
        self.write_capacity
    }

    /// Returns true while output is waiting to be written.
    pub fn has_pending_write(&self) -> bool {
        self.write_pos < self.bytes_to_write
    }

    /// Offset of the next byte to write.
    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    /// End of the queued output.
    pub fn bytes_to_write(&self) -> usize {
        self.bytes_to_write
    }

    /// Records `n` bytes appended to the write buffer.
    pub fn queue_write(&mut self, n: usize) {
        self.bytes_to_write = (self.bytes_to_write + n).min(self.write_capacity);
    }

    /// Records `n` bytes written to the socket; resets both offsets on full drain.
    pub fn advance_write(&mut self, n: usize) {
        self.write_pos = (self.write_pos + n).min(self.bytes_to_write);
        self.counters.bytes_written += n as u64;
        if self.write_pos == self.bytes_to_write {
            self.write_pos = 0;
            self.bytes_to_write = 0;
        }
    }
}

#[cfg(test)]
impl ConnectionRecord {
    /// Record without socket or buffers, already classified as `protocol`.
    pub(crate) fn detached(protocol: Protocol) -> Self {
        let peer = SocketAddr::from(([127, 0, 0, 1], 40000));
        let local = SocketAddr::from(([127, 0, 0, 1], 8080));
        let mut record = Self::new(1, 3, peer, local, &Config::default(), Instant::now(), 0);
        record.set_protocol(protocol, 100);
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ConnectionRecord {
        let peer = "127.0.0.1:50000".parse().unwrap();
        let local = "127.0.0.1:8080".parse().unwrap();
        ConnectionRecord::new(7, 12, peer, local, &Config::default(), Instant::now(), 1_700_000_000)
    }

    #[test]
    fn test_session_id_tracks_protocol() {
        let mut record = record();
        assert_eq!(record.session_id(), "UNKNOWN_12_1700000000");
        record.set_protocol(Protocol::Mqtt, 100);
        assert_eq!(record.session_id(), "MQTT_12_1700000000");
        assert!(record.session_id().len() <= MAX_SESSION_ID_LEN);
    }

    #[test]
    fn test_data_variant_follows_protocol() {
        let mut record = record();
        assert_eq!(record.data().protocol(), record.protocol());
        for protocol in Protocol::ALL {
            record.set_protocol(protocol, 90);
            assert_eq!(record.data().protocol(), protocol);
        }

        let mut record = ConnectionRecord::detached(Protocol::Http);
        crate::handlers::http::handle(&mut record, b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        let ProtocolData::Http(data) = record.data() else { panic!("variant changed") };
        assert_eq!(data.uri, "/x");
        assert_eq!(record.data().protocol(), record.protocol());
    }

    #[test]
    fn test_invalid_transition_rejected_and_counted() {
        let mut record = record();
        let now = Instant::now();
        assert!(record.transition(SocketState::Connected, now).is_err());
        assert_eq!(record.invalid_transitions(), 1);
        assert_eq!(record.state(), SocketState::Free);

        record.transition(SocketState::Listening, now).unwrap();
        record.transition(SocketState::Connected, now).unwrap();
        record.transition(SocketState::Reading, now).unwrap();
        record.transition(SocketState::Reading, now).unwrap();
        assert_eq!(record.history().total(), 4);
        assert!(record.transition(SocketState::Free, now).is_err());
        assert_eq!(record.invalid_transitions(), 2);
    }

    #[test]
    fn test_buffers_split_from_one_block() {
        let config = Config::default();
        let mut pool = MemoryPool::new(ConnectionRecord::block_size(&config), 2).unwrap();
        let mut record = record();
        assert!(record.split_buffers(&mut pool).is_err());

        record.attach_buffers(pool.alloc().unwrap());
        let (read, write) = record.split_buffers(&mut pool).unwrap();
        assert_eq!(read.len(), config.read_buffer_size);
        assert_eq!(write.len(), config.write_buffer_size);

        record.queue_write(10);
        assert!(record.has_pending_write());
        record.advance_write(4);
        assert_eq!(record.write_pos(), 4);
        record.advance_write(6);
        assert!(!record.has_pending_write());
        assert_eq!(record.bytes_to_write(), 0);
        assert_eq!(record.counters.bytes_written, 10);

        let block = record.take_buffers().unwrap();
        assert!(pool.free(block));
    }

    #[test]
    fn test_read_offsets_are_bounded() {
        let mut record = record();
        record.advance_read(100);
        record.consume_read(40);
        assert_eq!(record.read_pos(), 60);
        record.consume_read(1000);
        assert_eq!(record.read_pos(), 0);
        record.advance_read(1 << 20);
        assert!(record.read_full());
    }
}
