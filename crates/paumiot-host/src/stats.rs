use std::{
    collections::VecDeque,
    fmt::{self, Display},
    sync::Arc,
    time::{Duration, Instant},
};

use paumiot_protocol::{pal::registry::PalStats, ConfidenceTier, Protocol};
use parking_lot::Mutex;

use crate::session_table::HISTOGRAM_COLUMNS;

/// Number of per-protocol counters (`Unknown` included).
pub const PROTOCOL_SLOTS: usize = Protocol::ALL.len() + 1;

const MAX_WINDOWS: usize = 60;

/// Event counters owned by the loop thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStats {
    /// TCP connections accepted
    pub connections_accepted: u64,
    /// TCP connections released
    pub connections_closed: u64,
    /// Accepts dropped because the table, pool or registration failed
    pub connections_refused: u64,
    /// Bytes read from TCP connections
    pub bytes_read: u64,
    /// Bytes written to TCP connections
    pub bytes_written: u64,
    /// Datagrams received on the UDP socket
    pub udp_datagrams: u64,
    /// Successful classifications, indexed by `Protocol::index`
    pub detections: [u64; PROTOCOL_SLOTS],
    /// Classifications by tier: high, medium, low, none
    pub detection_tiers: [u64; 4],
    /// Detector runs that found nothing
    pub detection_failures: u64,
    /// Classifications served from the cache
    pub cache_hits: u64,
    /// Messages that passed admission
    pub messages_admitted: u64,
    /// Messages shed by admission control
    pub messages_dropped: u64,
    /// Transitions into the throttled state
    pub throttle_events: u64,
    /// Rejected socket state transitions
    pub invalid_transitions: u64,
    /// Malformed or unsupported input
    pub protocol_errors: u64,
    /// Bugs caught at the event boundary
    pub internal_errors: u64,
    /// Messages handed to downstream routing
    pub messages_forwarded: u64,
    /// Messages lost to a full dispatch queue or event channel
    pub forward_dropped: u64,
    /// Sessions closed by the idle sweep
    pub stale_closes: u64,
}

impl GatewayStats {
    /// Counts one successful classification.
    pub fn record_detection(&mut self, protocol: Protocol, confidence: u8) {
        self.detections[protocol.index()] += 1;
        let tier = match ConfidenceTier::from_confidence(confidence) {
            ConfidenceTier::High => 0,
            ConfidenceTier::Medium => 1,
            ConfidenceTier::Low => 2,
            ConfidenceTier::None => 3,
        };
        self.detection_tiers[tier] += 1;
    }
}

/// Counts events over fixed windows.
pub struct ThroughputMonitor {
    window: Duration,
    started: Instant,
    current: u32,
    measured: VecDeque<u32>,
}

impl ThroughputMonitor {
    /// Creates a monitor whose first window starts at `now`.
    pub fn new(window: Duration, now: Instant) -> Self {
        Self { window, started: now, current: 0, measured: VecDeque::new() }
    }

    /// Closes the current window if it has run out; returns true if it did.
    pub fn roll(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.started) < self.window {
            return false;
        }
        if self.measured.len() == MAX_WINDOWS {
            self.measured.pop_front();
        }
        self.measured.push_back(self.current);
        self.current = 0;
        self.started = now;
        true
    }

    /// Counts `count` events at `now`.
    pub fn record(&mut self, count: u32, now: Instant) {
        self.roll(now);
        self.current = self.current.saturating_add(count);
    }

    /// Average over the retained windows.
    pub fn average(&self) -> u32 {
        if self.measured.is_empty() {
            return 0;
        }
        self.measured.iter().sum::<u32>() / self.measured.len() as u32
    }

    /// Count of the most recent completed window.
    pub fn last_throughput(&self) -> u32 {
        self.measured.back().copied().unwrap_or(0)
    }

    /// Events counted in the retained windows plus the open one.
    pub fn total_measured(&self) -> u32 {
        self.measured.iter().sum::<u32>() + self.current
    }

    /// Drops every measurement.
    pub fn reset(&mut self) {
        self.current = 0;
        self.measured.clear();
    }
}

impl fmt::Debug for ThroughputMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Last Throughput: {}, Window: {:?}, Average Throughput: {}",
            self.last_throughput(),
            self.window,
            self.average()
        )
    }
}

/// Copy of the loop's statistics for readers on other threads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    /// Event counters
    pub stats: GatewayStats,
    /// Live sessions
    pub active_sessions: usize,
    /// Live sessions by protocol
    pub sessions_by_protocol: [usize; PROTOCOL_SLOTS],
    /// Sessions currently throttled
    pub throttled_sessions: usize,
    /// Sessions whose window is still in slow start
    pub slow_start_sessions: usize,
    /// Session-table bucket occupancy
    pub bucket_histogram: [usize; HISTOGRAM_COLUMNS],
    /// Free connection buffer blocks
    pub pool_available: usize,
    /// Messages in the last completed stats window
    pub last_throughput: u32,
    /// Average messages per stats window
    pub average_throughput: u32,
    /// Adaptation layer counters
    pub pal: PalStats,
}

impl Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sessions={} throttled={} slow_start={} accepted={} closed={} refused={} \
             bytes_in={} bytes_out={} udp={} admitted={} dropped={} forwarded={} \
             errors={}/{} throughput={}/{}",
            self.active_sessions,
            self.throttled_sessions,
            self.slow_start_sessions,
            self.stats.connections_accepted,
            self.stats.connections_closed,
            self.stats.connections_refused,
            self.stats.bytes_read,
            self.stats.bytes_written,
            self.stats.udp_datagrams,
            self.stats.messages_admitted,
            self.stats.messages_dropped,
            self.stats.messages_forwarded,
            self.stats.protocol_errors,
            self.stats.internal_errors,
            self.last_throughput,
            self.average_throughput,
        )
    }
}

/// Snapshot slot shared between the loop and its readers.
pub type SharedStats = Arc<Mutex<StatsSnapshot>>;
