use std::{fmt, time::Instant};

use paumiot_core::constants::STATE_HISTORY_LEN;

/// Lifecycle state of a connection's socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SocketState {
    /// Slot not in use
    #[default]
    Free,
    /// Slot reserved by an accept in progress
    Listening,
    /// Idle and ready for I/O
    Connected,
    /// Bytes are being read and dispatched
    Reading,
    /// Output is pending on the write buffer
    Writing,
    /// Admission control is shedding this connection's input
    Throttled,
    /// Scheduled for close at the end of the loop iteration
    Closing,
    /// Socket released, record about to return to the free list
    Closed,
}

impl SocketState {
    /// Returns true if `self -> to` is in the transition matrix.
    pub fn can_transition(self, to: SocketState) -> bool {
        use SocketState::*;
        match self {
            Free => matches!(to, Free | Listening),
            Listening => matches!(to, Free | Listening | Connected | Closing),
            Connected | Reading | Writing | Throttled => {
                matches!(to, Connected | Reading | Writing | Throttled | Closing)
            }
            Closing => matches!(to, Closing | Closed),
            Closed => matches!(to, Free | Closed),
        }
    }

    /// Returns true while the connection holds a live socket.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            SocketState::Connected
                | SocketState::Reading
                | SocketState::Writing
                | SocketState::Throttled
        )
    }

    /// Returns true once the connection is on its way out.
    pub fn is_closing(&self) -> bool {
        matches!(self, SocketState::Closing | SocketState::Closed)
    }

    /// Short uppercase name used in log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketState::Free => "FREE",
            SocketState::Listening => "LISTENING",
            SocketState::Connected => "CONNECTED",
            SocketState::Reading => "READING",
            SocketState::Writing => "WRITING",
            SocketState::Throttled => "THROTTLED",
            SocketState::Closing => "CLOSING",
            SocketState::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State left
    pub from: SocketState,
    /// State entered
    pub to: SocketState,
    /// When it happened
    pub at: Instant,
}

/// Bounded ring of the most recent transitions.
#[derive(Debug, Clone, Default)]
pub struct StateHistory {
    entries: [Option<Transition>; STATE_HISTORY_LEN],
    next: usize,
    total: u64,
}

impl StateHistory {
    /// Records a transition, overwriting the oldest once full.
    pub fn push(&mut self, transition: Transition) {
        self.entries[self.next] = Some(transition);
        self.next = (self.next + 1) % STATE_HISTORY_LEN;
        self.total += 1;
    }

    /// Transitions recorded over the lifetime of the record.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Retained transitions, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Transition> {
        let (newer, older) = self.entries.split_at(self.next);
        older.iter().chain(newer.iter()).flatten()
    }

    /// Most recent transition.
    pub fn last(&self) -> Option<&Transition> {
        let index = (self.next + STATE_HISTORY_LEN - 1) % STATE_HISTORY_LEN;
        self.entries[index].as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SocketState; 8] = [
        SocketState::Free,
        SocketState::Listening,
        SocketState::Connected,
        SocketState::Reading,
        SocketState::Writing,
        SocketState::Throttled,
        SocketState::Closing,
        SocketState::Closed,
    ];

    #[test]
    fn test_matrix_matches_table() {
        // Rows in the order of ALL, columns likewise.
        let table: [[u8; 8]; 8] = [
            [1, 1, 0, 0, 0, 0, 0, 0],
            [1, 1, 1, 0, 0, 0, 1, 0],
            [0, 0, 1, 1, 1, 1, 1, 0],
            [0, 0, 1, 1, 1, 1, 1, 0],
            [0, 0, 1, 1, 1, 1, 1, 0],
            [0, 0, 1, 1, 1, 1, 1, 0],
            [0, 0, 0, 0, 0, 0, 1, 1],
            [1, 0, 0, 0, 0, 0, 0, 1],
        ];
        for (row, from) in ALL.iter().enumerate() {
            for (col, to) in ALL.iter().enumerate() {
                assert_eq!(from.can_transition(*to), table[row][col] == 1, "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_no_shortcut_from_free_to_connected() {
        assert!(!SocketState::Free.can_transition(SocketState::Connected));
        assert!(SocketState::Free.can_transition(SocketState::Listening));
        assert!(SocketState::Listening.can_transition(SocketState::Connected));
        assert!(!SocketState::Closing.can_transition(SocketState::Free));
    }

    #[test]
    fn test_history_keeps_last_sixteen() {
        let mut history = StateHistory::default();
        let now = Instant::now();
        assert!(history.last().is_none());

        for i in 0..20 {
            let to = if i % 2 == 0 { SocketState::Reading } else { SocketState::Connected };
            history.push(Transition { from: SocketState::Connected, to, at: now });
        }
        assert_eq!(history.total(), 20);
        assert_eq!(history.iter().count(), STATE_HISTORY_LEN);
        assert_eq!(history.last().unwrap().to, SocketState::Connected);
        assert_eq!(history.iter().next().unwrap().to, SocketState::Reading);
    }
}
