//! Duplicate packet suppression
//!
//! Every neighbour that rebroadcasts a flooded frame makes every other
//! neighbour hear it again. The tracker remembers `(source, packet_id)`
//! for a retention window so each logical message is processed once.
//!
//! Memory is bounded two ways: entries expire after the window, and if
//! the capacity is hit first the oldest entry is evicted.

use crate::packet::NodeId;
use std::collections::{HashMap, VecDeque};

/// Result of observing a packet identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First sighting within the window
    Fresh,
    /// Already seen and not yet expired
    Duplicate,
}

type DedupKey = (NodeId, u32);

/// Time- and capacity-bounded record of recently seen packets
#[derive(Debug)]
pub struct DuplicateTracker {
    /// Key -> tick of first sighting
    seen: HashMap<DedupKey, u64>,
    /// Insertion order; may hold stale entries for keys re-recorded after expiry
    order: VecDeque<(DedupKey, u64)>,
    /// Retention window (ms)
    window_ms: u64,
    /// Maximum live entries
    capacity: usize,
}

impl DuplicateTracker {
    /// Create a tracker
    pub fn new(window_ms: u64, capacity: usize) -> Self {
        Self {
            seen: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            window_ms,
            capacity: capacity.max(1),
        }
    }

    /// Record a sighting and report whether it is new
    pub fn observe(&mut self, source: NodeId, packet_id: u32, now: u64) -> Observation {
        let key = (source, packet_id);
        if let Some(&first_seen) = self.seen.get(&key) {
            if now.saturating_sub(first_seen) < self.window_ms {
                return Observation::Duplicate;
            }
        }

        self.seen.insert(key, now);
        self.order.push_back((key, now));
        while self.seen.len() > self.capacity {
            self.evict_oldest();
        }
        Observation::Fresh
    }

    /// Check without recording
    pub fn contains(&self, source: NodeId, packet_id: u32, now: u64) -> bool {
        self.seen
            .get(&(source, packet_id))
            .is_some_and(|&t| now.saturating_sub(t) < self.window_ms)
    }

    /// Drop entries older than the window; returns how many were removed
    pub fn evict_expired(&mut self, now: u64) -> usize {
        let mut removed = 0;
        while let Some(&(key, stamp)) = self.order.front() {
            if now.saturating_sub(stamp) < self.window_ms {
                break;
            }
            self.order.pop_front();
            if self.remove_if_current(key, stamp) {
                removed += 1;
            }
        }
        removed
    }

    fn evict_oldest(&mut self) {
        while let Some((key, stamp)) = self.order.pop_front() {
            if self.remove_if_current(key, stamp) {
                return;
            }
        }
    }

    fn remove_if_current(&mut self, key: DedupKey, stamp: u64) -> bool {
        if self.seen.get(&key) == Some(&stamp) {
            self.seen.remove(&key);
            true
        } else {
            false
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for DuplicateTracker {
    fn default() -> Self {
        Self::new(60_000, 50) // 1 minute, 50 entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_within_window() {
        let mut tracker = DuplicateTracker::new(1_000, 16);
        let source = NodeId::from_u32(7);

        assert_eq!(tracker.observe(source, 1, 0), Observation::Fresh);
        assert_eq!(tracker.observe(source, 1, 500), Observation::Duplicate);
        assert_eq!(tracker.observe(source, 2, 500), Observation::Fresh);
        assert_eq!(tracker.observe(NodeId::from_u32(8), 1, 500), Observation::Fresh);
    }

    #[test]
    fn test_fresh_after_window() {
        let mut tracker = DuplicateTracker::new(1_000, 16);
        let source = NodeId::from_u32(7);

        assert_eq!(tracker.observe(source, 1, 0), Observation::Fresh);
        assert_eq!(tracker.observe(source, 1, 999), Observation::Duplicate);
        assert_eq!(tracker.observe(source, 1, 1_000), Observation::Fresh);
        // Window restarts from the new sighting
        assert_eq!(tracker.observe(source, 1, 1_500), Observation::Duplicate);
    }

    #[test]
    fn test_evict_expired() {
        let mut tracker = DuplicateTracker::new(100, 16);
        let source = NodeId::from_u32(1);

        tracker.observe(source, 1, 0);
        tracker.observe(source, 2, 50);
        assert_eq!(tracker.evict_expired(120), 1);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.contains(source, 2, 120));
        assert_eq!(tracker.evict_expired(200), 1);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_refreshed_key_survives_stale_queue_entry() {
        let mut tracker = DuplicateTracker::new(100, 16);
        let source = NodeId::from_u32(1);

        tracker.observe(source, 1, 0);
        tracker.observe(source, 1, 150);
        // The stale queue entry from t=0 must not remove the refreshed key
        assert_eq!(tracker.evict_expired(200), 0);
        assert!(tracker.contains(source, 1, 200));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut tracker = DuplicateTracker::new(10_000, 3);
        let source = NodeId::from_u32(1);

        for id in 0..4 {
            tracker.observe(source, id, id as u64);
        }
        assert_eq!(tracker.len(), 3);
        assert!(!tracker.contains(source, 0, 10));
        assert!(tracker.contains(source, 3, 10));
        assert_eq!(tracker.observe(source, 0, 10), Observation::Fresh);
    }
}
