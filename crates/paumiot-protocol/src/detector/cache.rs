use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use tracing::trace;

use super::Detection;
use crate::protocol::Protocol;

/// Connection 4-tuple: peer address and local address.
pub type FourTuple = (SocketAddr, SocketAddr);

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    protocol: Protocol,
    confidence: u8,
    last_seen: Instant,
}

/// Remembers the last classification of each TCP 4-tuple until it idles out.
#[derive(Debug)]
pub struct DetectionCache {
    entries: HashMap<FourTuple, CacheEntry>,
    ttl: Duration,
    capacity: usize,
}

impl DetectionCache {
    /// Creates a cache with the given idle expiry and entry bound.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self { entries: HashMap::new(), ttl, capacity: capacity.max(1) }
    }

    /// Looks up a live entry and refreshes its idle timer.
    ///
    /// A hit is reported with confidence 100.
    pub fn lookup(&mut self, key: FourTuple, now: Instant) -> Option<Detection> {
        let entry = self.entries.get_mut(&key)?;
        if now.saturating_duration_since(entry.last_seen) > self.ttl {
            self.entries.remove(&key);
            return None;
        }
        entry.last_seen = now;
        trace!(
            "[DETECTION] cache hit for {} -> {} (stored confidence {})",
            key.0,
            entry.protocol,
            entry.confidence
        );
        Some(Detection { protocol: entry.protocol, confidence: 100 })
    }

    /// Records a classification, evicting the least recently seen entry when full.
    pub fn insert(&mut self, key: FourTuple, detection: Detection, now: Instant) {
        if !detection.is_known() {
            return;
        }
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            if let Some(oldest) =
                self.entries.iter().min_by_key(|(_, entry)| entry.last_seen).map(|(key, _)| *key)
            {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            key,
            CacheEntry { protocol: detection.protocol, confidence: detection.confidence, last_seen: now },
        );
    }

    /// Drops one entry.
    pub fn remove(&mut self, key: &FourTuple) {
        self.entries.remove(key);
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| now.saturating_duration_since(entry.last_seen) <= ttl);
        before - self.entries.len()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(port: u16) -> FourTuple {
        (SocketAddr::from(([10, 0, 0, 1], port)), SocketAddr::from(([10, 0, 0, 2], 8080)))
    }

    fn mqtt() -> Detection {
        Detection { protocol: Protocol::Mqtt, confidence: 85 }
    }

    #[test]
    fn test_hit_reports_full_confidence() {
        let now = Instant::now();
        let mut cache = DetectionCache::new(Duration::from_secs(300), 16);

        cache.insert(tuple(5000), mqtt(), now);
        let hit = cache.lookup(tuple(5000), now + Duration::from_secs(10)).unwrap();
        assert_eq!(hit.protocol, Protocol::Mqtt);
        assert_eq!(hit.confidence, 100);
        assert!(cache.lookup(tuple(5001), now).is_none());
    }

    #[test]
    fn test_entries_expire() {
        let now = Instant::now();
        let mut cache = DetectionCache::new(Duration::from_secs(300), 16);
        cache.insert(tuple(1), mqtt(), now);
        cache.insert(tuple(2), mqtt(), now);

        // Lookup refreshes tuple 1
        assert!(cache.lookup(tuple(1), now + Duration::from_secs(200)).is_some());
        assert_eq!(cache.purge(now + Duration::from_secs(301)), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(tuple(1), now + Duration::from_secs(600)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let now = Instant::now();
        let mut cache = DetectionCache::new(Duration::from_secs(300), 2);
        cache.insert(tuple(1), mqtt(), now);
        cache.insert(tuple(2), mqtt(), now + Duration::from_secs(1));
        cache.insert(tuple(3), mqtt(), now + Duration::from_secs(2));

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(tuple(1), now + Duration::from_secs(3)).is_none());
        assert!(cache.lookup(tuple(3), now + Duration::from_secs(3)).is_some());
    }

    #[test]
    fn test_unknown_is_not_cached() {
        let mut cache = DetectionCache::new(Duration::from_secs(300), 2);
        cache.insert(tuple(1), Detection::UNKNOWN, Instant::now());
        assert!(cache.is_empty());
    }
}
