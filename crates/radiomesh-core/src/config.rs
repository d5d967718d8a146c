//! Device configuration

use crate::error::{MeshError, Result};
use crate::packet::NodeId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Role a device plays during inclusion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceRole {
    /// Includer: owns the mesh key and admits new devices
    Hub,
    /// Includee: must be included before it can send
    Standard,
}

/// Configuration for mesh device behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// This node's ID
    pub node_id: NodeId,
    /// Inclusion role
    pub role: DeviceRole,
    /// Maximum hops a frame may travel
    pub max_hops: u8,
    /// Duplicate suppression window (ms)
    pub dedup_window_ms: u64,
    /// Maximum tracked packet identities
    pub dedup_capacity: usize,
    /// Route staleness timeout (ms)
    pub route_timeout_ms: u64,
    /// Maximum routing table entries
    pub max_routes: usize,
    /// Deadline for each inclusion step (ms)
    pub inclusion_timeout_ms: u64,
    /// Maximum concurrent inclusion sessions on a hub
    pub max_inclusion_sessions: usize,
    /// Relay frames addressed to other nodes
    pub relay_enabled: bool,
    /// Bounded wait for one inbound frame per poll (ms)
    pub receive_timeout_ms: u64,
    /// Optional pre-shared secret mixed into the inclusion bootstrap key
    pub inclusion_secret: Option<[u8; 32]>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::UNKNOWN,
            role: DeviceRole::Standard,
            max_hops: 7,
            dedup_window_ms: 60_000,     // 1 minute
            dedup_capacity: 50,
            route_timeout_ms: 300_000,   // 5 minutes
            max_routes: 32,
            inclusion_timeout_ms: 60_000, // 1 minute per step
            max_inclusion_sessions: 4,
            relay_enabled: true,
            receive_timeout_ms: 50,
            inclusion_secret: None,
        }
    }
}

impl MeshConfig {
    /// Standard device with the given ID
    pub fn standard(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Hub with the given ID
    pub fn hub(node_id: NodeId) -> Self {
        Self {
            node_id,
            role: DeviceRole::Hub,
            ..Default::default()
        }
    }

    pub fn with_max_hops(mut self, max_hops: u8) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn with_dedup(mut self, window_ms: u64, capacity: usize) -> Self {
        self.dedup_window_ms = window_ms;
        self.dedup_capacity = capacity;
        self
    }

    pub fn with_route_timeout(mut self, timeout_ms: u64) -> Self {
        self.route_timeout_ms = timeout_ms;
        self
    }

    pub fn with_inclusion_timeout(mut self, timeout_ms: u64) -> Self {
        self.inclusion_timeout_ms = timeout_ms;
        self
    }

    pub fn with_relay(mut self, enabled: bool) -> Self {
        self.relay_enabled = enabled;
        self
    }

    pub fn with_inclusion_secret(mut self, secret: [u8; 32]) -> Self {
        self.inclusion_secret = Some(secret);
        self
    }

    /// Receive wait as a `Duration`
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// Reject configurations the device cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_broadcast() || self.node_id.is_unknown() {
            return Err(MeshError::InvalidState(format!(
                "node id {} is reserved",
                self.node_id
            )));
        }
        let limits = [
            ("max_hops", self.max_hops as u64),
            ("dedup_window_ms", self.dedup_window_ms),
            ("dedup_capacity", self.dedup_capacity as u64),
            ("route_timeout_ms", self.route_timeout_ms),
            ("max_routes", self.max_routes as u64),
            ("inclusion_timeout_ms", self.inclusion_timeout_ms),
            ("max_inclusion_sessions", self.max_inclusion_sessions as u64),
        ];
        if let Some((name, _)) = limits.iter().find(|(_, v)| *v == 0) {
            return Err(MeshError::InvalidState(format!("{name} must be non-zero")));
        }
        Ok(())
    }
}
