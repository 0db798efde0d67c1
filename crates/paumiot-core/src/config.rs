use std::{
    default::Default,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use crate::{
    constants::{DEFAULT_PORT, MAX_CLIENTS, MAX_EVENTS, READ_BUFFER_SIZE, WRITE_BUFFER_SIZE},
    error::{ErrorKind, Result},
};

#[derive(Clone, Debug)]
/// Configuration options to tune the gateway.
pub struct Config {
    /// Address the TCP listener and UDP socket bind to.
    pub bind_address: IpAddr,
    /// Port shared by the TCP listener and the UDP socket.
    pub port: u16,
    /// Listen backlog passed to the OS.
    pub listen_backlog: i32,
    /// Max simultaneous TCP connections.
    pub max_connections: usize,
    /// Per-connection read buffer size in bytes.
    pub read_buffer_size: usize,
    /// Per-connection write buffer size in bytes.
    pub write_buffer_size: usize,
    /// Size of the readiness event buffer.
    pub max_events: usize,
    /// How long to block waiting for readiness.
    pub poll_timeout: Duration,
    /// Max idle time before a session is swept.
    pub idle_timeout: Duration,
    /// Idle time after which a throttled connection is released.
    pub throttle_reset_timeout: Duration,
    /// Interval of the stale-session sweep.
    pub cleanup_interval: Duration,
    /// Interval of the statistics dump.
    pub stats_interval: Duration,
    /// Leaky-bucket limit per connection.
    pub max_msgs_per_sec: u32,
    /// Length of one rate-limit window.
    pub rate_window: Duration,
    /// Max messages admitted but not yet completed per connection.
    pub max_queue_depth: u32,
    /// Initial congestion window (in messages).
    pub initial_window: u32,
    /// Initial slow-start threshold (in messages).
    pub slow_start_threshold: u32,
    /// Backoff growth applied on each failure (factor is multiplied by `1 + step`).
    pub backoff_step: f32,
    /// Upper bound of the backoff factor.
    pub max_backoff: f32,
    /// Failed detection attempts before a connection is closed.
    pub max_detection_attempts: u32,
    /// Cache TCP classifications by 4-tuple.
    pub detection_cache_enabled: bool,
    /// Idle expiry of a cached classification.
    pub detection_cache_ttl: Duration,
    /// Max cached classifications.
    pub detection_cache_capacity: usize,
    /// Recognise TLS records and QUIC long headers.
    pub detect_encrypted: bool,
    /// Capacity of the dispatch queue (power of two).
    pub dispatch_queue_capacity: usize,
    /// Number of dispatch workers; 0 publishes messages on the event channel instead.
    pub dispatch_workers: usize,
    /// Capacity of the gateway event channel.
    pub event_channel_capacity: usize,
    /// Socket receive buffer size in bytes (None = use system default).
    /// Corresponds to SO_RCVBUF socket option.
    pub socket_recv_buffer_size: Option<usize>,
    /// Socket send buffer size in bytes (None = use system default).
    /// Corresponds to SO_SNDBUF socket option.
    pub socket_send_buffer_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            listen_backlog: 128,
            max_connections: MAX_CLIENTS,
            read_buffer_size: READ_BUFFER_SIZE,
            write_buffer_size: WRITE_BUFFER_SIZE,
            max_events: MAX_EVENTS,
            poll_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            throttle_reset_timeout: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(30),
            stats_interval: Duration::from_secs(60),
            max_msgs_per_sec: 100,
            rate_window: Duration::from_secs(1),
            max_queue_depth: 1000,
            initial_window: 1,
            slow_start_threshold: 64,
            backoff_step: 0.5,
            max_backoff: 8.0,
            max_detection_attempts: 3,
            detection_cache_enabled: true,
            detection_cache_ttl: Duration::from_secs(300),
            detection_cache_capacity: 4096,
            detect_encrypted: false, // Four-protocol detection only
            dispatch_queue_capacity: 1024,
            dispatch_workers: 0, // Messages go to the event channel
            event_channel_capacity: 1024,
            socket_recv_buffer_size: None, // Use system default
            socket_send_buffer_size: None, // Use system default
        }
    }
}

impl Config {
    /// Returns the socket address both endpoints bind to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Checks that every size and interval is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(ErrorKind::InvalidParameter("max_connections must be non-zero"));
        }
        if self.read_buffer_size == 0 || self.write_buffer_size == 0 {
            return Err(ErrorKind::InvalidParameter("buffer sizes must be non-zero"));
        }
        if self.max_events == 0 || self.listen_backlog <= 0 {
            return Err(ErrorKind::InvalidParameter("max_events and listen_backlog must be positive"));
        }
        if self.rate_window.is_zero()
            || self.cleanup_interval.is_zero()
            || self.stats_interval.is_zero()
            || self.idle_timeout.is_zero()
        {
            return Err(ErrorKind::InvalidParameter("intervals must be non-zero"));
        }
        if self.max_msgs_per_sec == 0 || self.max_queue_depth == 0 {
            return Err(ErrorKind::InvalidParameter("admission limits must be non-zero"));
        }
        if self.initial_window == 0 || self.initial_window > self.max_queue_depth {
            return Err(ErrorKind::InvalidParameter("initial_window must be in 1..=max_queue_depth"));
        }
        if !self.dispatch_queue_capacity.is_power_of_two() {
            return Err(ErrorKind::InvalidParameter("dispatch_queue_capacity must be a power of two"));
        }
        if self.event_channel_capacity == 0 {
            return Err(ErrorKind::InvalidParameter("event_channel_capacity must be non-zero"));
        }
        if self.max_backoff.is_nan() || self.max_backoff < 1.0 || self.backoff_step < 0.0 {
            return Err(ErrorKind::InvalidParameter("backoff settings out of range"));
        }
        Ok(())
    }
}
