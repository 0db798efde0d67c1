#![warn(missing_docs)]

//! paumiot-host: single-threaded connection engine over mio, with per-connection
//! sessions, admission control and protocol handlers.

/// Per-connection rate limiting and congestion window.
pub mod congestion;
/// Connection records, session flags and protocol state.
pub mod connection;
/// Worker pool handing decoded messages to downstream routing.
pub mod dispatch;
/// Event and action types (Action, GatewayEvent).
pub mod event_types;
/// The mio event loop serving TCP and UDP on one port.
pub mod gateway;
/// Per-protocol request handlers.
pub mod handlers;
/// Socket-keyed table of live connection records.
pub mod session_table;
/// Socket state machine and transition history.
pub mod socket_state;
/// Counters, throughput monitoring and snapshots.
pub mod stats;
/// Time utilities for the gateway.
pub mod time;

pub use congestion::{Admission, CongestionControl, CongestionParams};
pub use connection::{ConnectionRecord, ProtocolData, SessionFlags, SessionState};
pub use dispatch::{Dispatcher, MessageHandler};
pub use event_types::{Action, GatewayEvent};
pub use gateway::Gateway;
pub use session_table::SessionTable;
pub use socket_state::SocketState;
pub use stats::{GatewayStats, SharedStats, StatsSnapshot, ThroughputMonitor};
pub use time::{Clock, ManualClock, SystemClock};
