use std::{net::SocketAddr, os::fd::RawFd, time::Instant};

use paumiot_core::{
    config::Config,
    constants::CONNECTION_BUCKETS,
    error::{ErrorKind, Result},
};
use paumiot_protocol::Protocol;
use tracing::{debug, warn};

use crate::connection::{ConnectionRecord, SessionFlags};

/// Number of columns in [`SessionTable::bucket_histogram`]; the last one is "or more".
pub const HISTOGRAM_COLUMNS: usize = 5;

/// Fixed-capacity table of connection records keyed by socket handle.
///
/// Records live in a slot array; free slots are tracked by an index stack and
/// sockets are found through a bucketed hash of slot indices.
#[derive(Debug)]
pub struct SessionTable {
    config: Config,
    slots: Vec<Option<ConnectionRecord>>,
    free: Vec<usize>,
    buckets: Vec<Vec<usize>>,
    len: usize,
    next_id: u32,
}

#[inline]
fn bucket_of(socket: RawFd) -> usize {
    (socket as u32 as usize) % CONNECTION_BUCKETS
}

impl SessionTable {
    /// Creates a table with `config.max_connections` slots.
    pub fn new(config: &Config) -> Self {
        let capacity = config.max_connections;
        Self {
            config: config.clone(),
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().collect(),
            buckets: vec![Vec::new(); CONNECTION_BUCKETS],
            len: 0,
            next_id: 1,
        }
    }

    /// Creates a record for `socket` and returns its slot index.
    pub fn create_session(
        &mut self,
        socket: RawFd,
        peer: SocketAddr,
        local: SocketAddr,
        protocol: Protocol,
        now: Instant,
        created_unix: u64,
    ) -> Result<usize> {
        if self.index_of(socket).is_some() {
            warn!("[SESSION] socket {} already has a session", socket);
            return Err(ErrorKind::AlreadyInitialized);
        }
        let Some(index) = self.free.pop() else {
            warn!("[SESSION] table full ({} sessions), refusing {}", self.len, peer);
            return Err(ErrorKind::OutOfMemory);
        };

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);

        let mut record =
            ConnectionRecord::new(id, socket, peer, local, &self.config, now, created_unix);
        if protocol != Protocol::Unknown {
            record.set_protocol(protocol, 0);
        }
        record.flags.insert(SessionFlags::ACTIVE);
        debug!("[SESSION] created {} for {}", record.session_id(), peer);

        self.slots[index] = Some(record);
        self.buckets[bucket_of(socket)].push(index);
        self.len += 1;
        Ok(index)
    }

    /// Slot index holding `socket`.
    pub fn index_of(&self, socket: RawFd) -> Option<usize> {
        self.buckets[bucket_of(socket)]
            .iter()
            .copied()
            .find(|&index| self.slots[index].as_ref().map_or(false, |r| r.socket() == socket))
    }

    /// Record in slot `index`.
    pub fn get(&self, index: usize) -> Option<&ConnectionRecord> {
        self.slots.get(index)?.as_ref()
    }

    /// Mutable record in slot `index`.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut ConnectionRecord> {
        self.slots.get_mut(index)?.as_mut()
    }

    /// Record for `socket`.
    pub fn get_by_socket(&self, socket: RawFd) -> Option<&ConnectionRecord> {
        self.index_of(socket).and_then(|index| self.get(index))
    }

    /// Mutable record for `socket`.
    pub fn get_by_socket_mut(&mut self, socket: RawFd) -> Option<&mut ConnectionRecord> {
        let index = self.index_of(socket)?;
        self.get_mut(index)
    }

    /// Removes the record for `socket`, returning it with its stamp cleared.
    pub fn remove(&mut self, socket: RawFd) -> Option<ConnectionRecord> {
        let index = self.index_of(socket)?;
        self.buckets[bucket_of(socket)].retain(|&i| i != index);
        let mut record = self.slots[index].take()?;
        self.free.push(index);
        self.len -= 1;

        record.flags.remove(SessionFlags::ACTIVE);
        record.invalidate();
        debug!("[SESSION] removed {}", record.session_id());
        Some(record)
    }

    /// Refreshes the idle timer of `socket`'s session.
    pub fn update_activity(&mut self, socket: RawFd, now: Instant) -> bool {
        match self.get_by_socket_mut(socket) {
            Some(record) => {
                record.touch(now);
                true
            }
            None => false,
        }
    }

    /// Records a classification and rewrites the session id.
    pub fn update_protocol(
        &mut self,
        socket: RawFd,
        protocol: Protocol,
        confidence: u8,
    ) -> Result<()> {
        let record = self
            .get_by_socket_mut(socket)
            .ok_or(ErrorKind::InvalidParameter("no session for socket"))?;
        record.set_protocol(protocol, confidence);
        debug!("[SESSION] {} classified with confidence {}", record.session_id(), confidence);
        Ok(())
    }

    /// Live records, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.slots.iter().flatten()
    }

    /// Mutable live records, in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConnectionRecord> {
        self.slots.iter_mut().flatten()
    }

    /// Socket handles of every live record.
    pub fn sockets(&self) -> Vec<RawFd> {
        self.iter().map(|record| record.socket()).collect()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no record is live.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of live records.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Counts buckets holding 0, 1, 2, 3 and 4-or-more records.
    pub fn bucket_histogram(&self) -> [usize; HISTOGRAM_COLUMNS] {
        let mut histogram = [0; HISTOGRAM_COLUMNS];
        for bucket in &self.buckets {
            histogram[bucket.len().min(HISTOGRAM_COLUMNS - 1)] += 1;
        }
        histogram
    }
}
