//! Routing table
//!
//! Routes are learned opportunistically from traffic: every frame heard
//! from `source` via `last_hop` is a candidate route to `source`. The
//! table keeps one entry per destination, replaced only by a strictly
//! better candidate:
//!
//! 1. fewer hops
//! 2. on a tie, stronger signal (RSSI)
//! 3. on a tie, more recent sighting
//!
//! Entries not refreshed within the timeout are dropped by [`RoutingTable::expire`].

use crate::packet::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Best known route to one destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Destination node ID
    pub destination: NodeId,
    /// Neighbour to hand frames to (same as destination if direct)
    pub next_hop: NodeId,
    /// Total hop count to destination
    pub hop_count: u8,
    /// RSSI of the frame that taught this route (dBm)
    pub rssi: i16,
    /// Tick of the last refresh (ms)
    #[serde(skip)]
    pub last_seen: u64,
}

impl RouteEntry {
    /// Create a route entry
    pub fn new(destination: NodeId, next_hop: NodeId, hop_count: u8, rssi: i16, now: u64) -> Self {
        Self {
            destination,
            next_hop,
            hop_count,
            rssi,
            last_seen: now,
        }
    }

    /// Check if the route is a single hop
    pub fn is_direct(&self) -> bool {
        self.next_hop == self.destination
    }

    /// Check if route is expired
    pub fn is_expired(&self, now: u64, timeout_ms: u64) -> bool {
        now.saturating_sub(self.last_seen) > timeout_ms
    }

    /// Strict preference order between two routes to the same destination
    pub fn is_better_than(&self, other: &RouteEntry) -> bool {
        (other.hop_count, self.rssi, self.last_seen) > (self.hop_count, other.rssi, other.last_seen)
    }
}

/// What an [`RoutingTable::update`] call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteChange {
    /// New destination
    Inserted,
    /// Existing entry replaced by a better one
    Replaced,
    /// Candidate was not better; table unchanged
    Kept,
}

/// Routing table for storing known routes
#[derive(Debug)]
pub struct RoutingTable {
    /// Routes indexed by destination
    routes: HashMap<NodeId, RouteEntry>,
    /// Route timeout (ms)
    timeout_ms: u64,
    /// Maximum number of routes
    max_routes: usize,
}

impl RoutingTable {
    /// Create a new routing table
    pub fn new(timeout_ms: u64, max_routes: usize) -> Self {
        Self {
            routes: HashMap::new(),
            timeout_ms,
            max_routes: max_routes.max(1),
        }
    }

    /// Offer a candidate route
    pub fn update(
        &mut self,
        destination: NodeId,
        next_hop: NodeId,
        hop_count: u8,
        rssi: i16,
        now: u64,
    ) -> RouteChange {
        let candidate = RouteEntry::new(destination, next_hop, hop_count, rssi, now);

        if let Some(existing) = self.routes.get_mut(&destination) {
            if existing.is_expired(now, self.timeout_ms) || candidate.is_better_than(existing) {
                *existing = candidate;
                return RouteChange::Replaced;
            }
            return RouteChange::Kept;
        }

        if self.routes.len() >= self.max_routes {
            self.evict_worst(now);
        }
        self.routes.insert(destination, candidate);
        RouteChange::Inserted
    }

    /// Get route to destination
    pub fn lookup(&self, destination: &NodeId) -> Option<&RouteEntry> {
        self.routes.get(destination)
    }

    /// Remove a route
    pub fn remove(&mut self, destination: &NodeId) -> Option<RouteEntry> {
        self.routes.remove(destination)
    }

    /// Drop routes not refreshed within the timeout; returns how many
    pub fn expire(&mut self, now: u64) -> usize {
        let timeout = self.timeout_ms;
        let before = self.routes.len();
        self.routes.retain(|_, r| !r.is_expired(now, timeout));
        before - self.routes.len()
    }

    /// All routes, ordered by destination
    pub fn entries(&self) -> Vec<&RouteEntry> {
        let mut all: Vec<_> = self.routes.values().collect();
        all.sort_by_key(|r| r.destination);
        all
    }

    /// Number of routes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Routes in a form suitable for persisting
    pub fn snapshot(&self) -> Vec<RouteEntry> {
        self.entries().into_iter().cloned().collect()
    }

    /// Reload persisted routes, stamped as seen at `now`
    pub fn restore(&mut self, entries: Vec<RouteEntry>, now: u64) {
        for entry in entries {
            self.update(entry.destination, entry.next_hop, entry.hop_count, entry.rssi, now);
        }
    }

    /// Evict the worst route (expired first, then most hops, weakest, oldest)
    fn evict_worst(&mut self, now: u64) {
        let timeout = self.timeout_ms;
        if let Some(worst_id) = self
            .routes
            .values()
            .max_by_key(|r| {
                (
                    r.is_expired(now, timeout),
                    r.hop_count,
                    std::cmp::Reverse(r.rssi),
                    std::cmp::Reverse(r.last_seen),
                )
            })
            .map(|r| r.destination)
        {
            self.routes.remove(&worst_id);
        }
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new(300_000, 32) // 5 minute timeout, 32 routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> NodeId {
        NodeId::from_u32(n)
    }

    #[test]
    fn test_fewest_hops_wins() {
        let mut table = RoutingTable::default();
        assert_eq!(table.update(id(1), id(10), 3, -80, 0), RouteChange::Inserted);
        assert_eq!(table.update(id(1), id(11), 1, -80, 1), RouteChange::Replaced);
        assert_eq!(table.update(id(1), id(12), 2, -80, 2), RouteChange::Kept);

        let route = table.lookup(&id(1)).unwrap();
        assert_eq!(route.hop_count, 1);
        assert_eq!(route.next_hop, id(11));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_signal_breaks_hop_tie() {
        let mut table = RoutingTable::default();
        table.update(id(1), id(10), 2, -100, 0);
        assert_eq!(table.update(id(1), id(11), 2, -90, 0), RouteChange::Replaced);
        assert_eq!(table.update(id(1), id(12), 2, -95, 5), RouteChange::Kept);
        assert_eq!(table.lookup(&id(1)).unwrap().next_hop, id(11));
    }

    #[test]
    fn test_recency_breaks_full_tie() {
        let mut table = RoutingTable::default();
        table.update(id(1), id(10), 2, -90, 0);
        // Identical candidate at the same tick does not flap
        assert_eq!(table.update(id(1), id(11), 2, -90, 0), RouteChange::Kept);
        assert_eq!(table.update(id(1), id(11), 2, -90, 10), RouteChange::Replaced);
        assert_eq!(table.lookup(&id(1)).unwrap().last_seen, 10);
    }

    #[test]
    fn test_expired_route_is_replaced() {
        let mut table = RoutingTable::new(100, 8);
        table.update(id(1), id(10), 1, -60, 0);
        assert_eq!(table.update(id(1), id(11), 4, -110, 500), RouteChange::Replaced);
        assert_eq!(table.lookup(&id(1)).unwrap().hop_count, 4);
    }

    #[test]
    fn test_expire() {
        let mut table = RoutingTable::new(100, 8);
        table.update(id(1), id(1), 1, -60, 0);
        table.update(id(2), id(1), 2, -60, 80);
        assert_eq!(table.expire(150), 1);
        assert!(table.lookup(&id(1)).is_none());
        assert!(table.lookup(&id(2)).is_some());
    }

    #[test]
    fn test_remove() {
        let mut table = RoutingTable::default();
        table.update(id(1), id(1), 1, -60, 0);
        assert!(table.lookup(&id(1)).unwrap().is_direct());
        assert!(table.remove(&id(1)).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_capacity_evicts_worst() {
        let mut table = RoutingTable::new(10_000, 2);
        table.update(id(1), id(1), 1, -60, 0);
        table.update(id(2), id(9), 5, -60, 0);
        table.update(id(3), id(3), 1, -70, 0);

        assert_eq!(table.len(), 2);
        assert!(table.lookup(&id(2)).is_none());
    }

    #[test]
    fn test_snapshot_restore() {
        let mut table = RoutingTable::default();
        table.update(id(1), id(1), 1, -60, 0);
        table.update(id(2), id(1), 2, -70, 0);

        let json = serde_json::to_string(&table.snapshot()).unwrap();
        let entries: Vec<RouteEntry> = serde_json::from_str(&json).unwrap();

        let mut restored = RoutingTable::default();
        restored.restore(entries, 5_000);
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.lookup(&id(2)).unwrap().next_hop, id(1));
        assert_eq!(restored.lookup(&id(2)).unwrap().last_seen, 5_000);
    }
}
