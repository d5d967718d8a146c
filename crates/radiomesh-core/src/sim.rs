//! Multi-Node Mesh Simulation
//!
//! An in-memory radio medium for exercising real [`MeshDevice`]s without
//! hardware. It models:
//!
//! - Nodes at fixed 2D positions
//! - Log-distance path loss, giving each reception an RSSI
//! - A receiver sensitivity cut-off (frames below it are lost)
//! - Message delivery statistics
//!
//! Every step advances the shared clock, moves each node's transmitted frames
//! to every node in range, then polls every node until its inbox is empty.
//!
//! ## Example
//!
//! ```ignore
//! use radiomesh_core::sim::{MeshSimulator, SimConfig};
//! use radiomesh_core::Topic;
//!
//! // Five nodes 300 m apart; node 0 is the hub
//! let mut sim = MeshSimulator::line(SimConfig::default(), 5, 300.0)?;
//! sim.provision_all()?;
//!
//! sim.send(0, 4, Topic::Cmd, b"on")?;
//! sim.run(20)?;
//! println!("Delivery rate: {:.1}%", sim.stats().delivery_rate() * 100.0);
//! ```

use crate::config::{DeviceRole, MeshConfig};
use crate::device::MeshDevice;
use crate::error::{MeshError, RadioError, Result};
use crate::inclusion::InclusionEvent;
use crate::packet::{NodeId, Topic};
use crate::router::Delivery;
use crate::storage::MemoryStorage;
use crate::traits::Radio;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;
use tracing::trace;

/// In-memory radio attached to a [`MeshSimulator`]
#[derive(Debug, Default)]
pub struct SimRadio {
    inbox: VecDeque<(Vec<u8>, i16)>,
    outbox: Vec<Vec<u8>>,
    last_rssi: i16,
    fail_tx: bool,
}

impl SimRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame for reception with the given RSSI
    pub fn inject(&mut self, frame: Vec<u8>, rssi: i16) {
        self.inbox.push_back((frame, rssi));
    }

    /// Take every frame transmitted since the last call
    pub fn take_outbox(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }

    /// Frames waiting to be received
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }

    /// Make transmissions fail with `TxTimeout`
    pub fn set_fail_tx(&mut self, fail: bool) {
        self.fail_tx = fail;
    }
}

impl Radio for SimRadio {
    fn send(&mut self, frame: &[u8]) -> std::result::Result<(), RadioError> {
        if self.fail_tx {
            return Err(RadioError::TxTimeout);
        }
        self.outbox.push(frame.to_vec());
        Ok(())
    }

    fn receive(&mut self, _timeout: Duration) -> std::result::Result<Option<Vec<u8>>, RadioError> {
        Ok(self.inbox.pop_front().map(|(frame, rssi)| {
            self.last_rssi = rssi;
            frame
        }))
    }

    fn rssi(&self) -> i16 {
        self.last_rssi
    }
}

/// Node position in 2D space (meters)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NodePosition {
    pub x: f64,
    pub y: f64,
}

impl NodePosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Distance to another node in meters
    pub fn distance_to(&self, other: &NodePosition) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Generate random position within bounds
    pub fn random(max_x: f64, max_y: f64, seed: u64) -> Self {
        // Simple LCG for reproducible randomness
        let mut rng = seed;
        rng = rng.wrapping_mul(6364136223846793005).wrapping_add(1);
        let x = (rng as f64 / u64::MAX as f64) * max_x;
        rng = rng.wrapping_mul(6364136223846793005).wrapping_add(1);
        let y = (rng as f64 / u64::MAX as f64) * max_y;
        Self { x, y }
    }
}

/// Simulation configuration
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Transmission power (dBm)
    pub tx_power_dbm: f64,
    /// Receiver sensitivity (dBm)
    pub rx_sensitivity_dbm: f64,
    /// Path loss exponent (2.0 = free space, 3.0-4.0 = urban)
    pub path_loss_exponent: f64,
    /// Reference distance for path loss (meters)
    pub reference_distance: f64,
    /// Simulated time per step (ms)
    pub step_ms: u64,
    /// Random seed for reproducible layouts
    pub seed: u64,
    /// Template for every node's device configuration
    pub mesh: MeshConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tx_power_dbm: 14.0, // 25 mW
            rx_sensitivity_dbm: -120.0,
            path_loss_exponent: 3.5, // Suburban, ground level
            reference_distance: 1.0,
            step_ms: 10,
            seed: 42,
            mesh: MeshConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn with_tx_power(mut self, dbm: f64) -> Self {
        self.tx_power_dbm = dbm;
        self
    }

    pub fn with_path_loss_exponent(mut self, exponent: f64) -> Self {
        self.path_loss_exponent = exponent;
        self
    }

    pub fn with_step_ms(mut self, step_ms: u64) -> Self {
        self.step_ms = step_ms;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_mesh(mut self, mesh: MeshConfig) -> Self {
        self.mesh = mesh;
        self
    }

    /// Received signal strength between two positions (log-distance model)
    pub fn rssi_between(&self, tx: &NodePosition, rx: &NodePosition) -> f64 {
        let distance = tx.distance_to(rx).max(self.reference_distance);

        // PL(d) = PL(d0) + 10 * n * log10(d/d0)
        let pl_reference =
            20.0 * (4.0 * std::f64::consts::PI * self.reference_distance / 0.33).log10();
        let path_loss = pl_reference
            + 10.0 * self.path_loss_exponent * (distance / self.reference_distance).log10();

        self.tx_power_dbm - path_loss
    }

    /// Largest distance at which frames are still received
    pub fn max_range(&self) -> f64 {
        let pl_reference =
            20.0 * (4.0 * std::f64::consts::PI * self.reference_distance / 0.33).log10();
        let budget = self.tx_power_dbm - self.rx_sensitivity_dbm - pl_reference;
        self.reference_distance * 10f64.powf(budget / (10.0 * self.path_loss_exponent))
    }
}

/// Simulation statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimStats {
    /// Messages originated through [`MeshSimulator::send`]
    pub messages_sent: u64,
    /// Messages that reached their destination (any recipient for broadcasts)
    pub messages_delivered: u64,
    /// Frames put on the air
    pub frames_transmitted: u64,
    /// Frame receptions (one per receiver in range)
    pub frames_received: u64,
    /// Frame receptions lost to path loss
    pub frames_lost: u64,
    /// Average hop count for delivered messages
    pub avg_hops: f64,
    /// Per-node statistics
    pub per_node: Vec<NodeStats>,
}

impl SimStats {
    /// Message delivery rate (0.0 - 1.0)
    pub fn delivery_rate(&self) -> f64 {
        if self.messages_sent == 0 {
            0.0
        } else {
            self.messages_delivered as f64 / self.messages_sent as f64
        }
    }
}

/// Per-node statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeStats {
    pub node_id: u32,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub frames_relayed: u64,
    pub routes: usize,
}

/// Simulation events for logging
#[derive(Debug, Clone)]
pub enum SimEvent {
    NodeJoined { node_idx: usize, node_id: NodeId, position: NodePosition },
    MessageSent { node_idx: usize, packet_id: u32, dest: NodeId },
    FrameTransmitted { node_idx: usize, size: usize },
    FrameLost { from_idx: usize, to_idx: usize, rssi: f64 },
    MessageDelivered { node_idx: usize, source: NodeId, packet_id: u32, hops: u8 },
    Inclusion { node_idx: usize, event: InclusionEvent },
}

#[derive(Debug, Clone)]
struct TrackedMessage {
    dest_idx: Option<usize>,
    delivered: bool,
}

/// Device type driven by the simulator
pub type SimDevice = MeshDevice<SimRadio, MemoryStorage>;

struct SimNode {
    device: SimDevice,
    position: NodePosition,
    /// Filled by the device's application callback
    deliveries: Rc<RefCell<Vec<Delivery>>>,
    inclusions: Rc<RefCell<Vec<InclusionEvent>>>,
    /// Deliveries already accounted in stats
    seen: usize,
    seen_inclusions: usize,
}

/// Multi-node mesh network simulator
pub struct MeshSimulator {
    config: SimConfig,
    nodes: Vec<SimNode>,
    tracked: HashMap<(NodeId, u32), TrackedMessage>,
    now: u64,
    step_count: u64,
    stats: SimStats,
    event_log: Vec<SimEvent>,
}

impl MeshSimulator {
    /// Create an empty simulator
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            nodes: Vec::new(),
            tracked: HashMap::new(),
            now: 0,
            step_count: 0,
            stats: SimStats::default(),
            event_log: Vec::new(),
        }
    }

    /// Nodes on a line `spacing` meters apart; node 0 is the hub
    pub fn line(config: SimConfig, count: usize, spacing: f64) -> Result<Self> {
        let mut sim = Self::new(config);
        for i in 0..count {
            sim.add_default_node(i, NodePosition::new(i as f64 * spacing, 0.0))?;
        }
        Ok(sim)
    }

    /// Nodes at random positions within `width` x `height`; node 0 is the hub
    pub fn random(config: SimConfig, count: usize, width: f64, height: f64) -> Result<Self> {
        let mut sim = Self::new(config);
        let seed = sim.config.seed;
        for i in 0..count {
            let position = NodePosition::random(width, height, seed.wrapping_add(i as u64 * 12345));
            sim.add_default_node(i, position)?;
        }
        Ok(sim)
    }

    fn add_default_node(&mut self, index: usize, position: NodePosition) -> Result<usize> {
        let node_id = NodeId::from_u32(index as u32 + 1);
        let mut mesh = self.config.mesh.clone();
        mesh.node_id = node_id;
        if index == 0 {
            mesh.role = DeviceRole::Hub;
        }
        self.add_node(mesh, position)
    }

    /// Add a device at `position`; returns its index
    pub fn add_node(&mut self, config: MeshConfig, position: NodePosition) -> Result<usize> {
        let node_id = config.node_id;
        if self.index_of(node_id).is_some() {
            return Err(MeshError::InvalidState(format!("duplicate node id {node_id}")));
        }

        let mut device = MeshDevice::new(config, SimRadio::new(), MemoryStorage::new())?;
        device.init(self.now)?;

        let deliveries = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&deliveries);
        device.on_receive(move |d: &Delivery| sink.borrow_mut().push(d.clone()))?;

        let inclusions = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&inclusions);
        device.on_inclusion(move |e: &InclusionEvent| sink.borrow_mut().push(e.clone()))?;

        let node_idx = self.nodes.len();
        self.event_log.push(SimEvent::NodeJoined {
            node_idx,
            node_id,
            position,
        });
        self.nodes.push(SimNode {
            device,
            position,
            deliveries,
            inclusions,
            seen: 0,
            seen_inclusions: 0,
        });
        self.stats.per_node.push(NodeStats {
            node_id: node_id.to_u32(),
            ..Default::default()
        });
        Ok(node_idx)
    }

    /// Give every node the hub's mesh key out of band
    ///
    /// The hub (node 0) creates the key by entering inclusion mode.
    pub fn provision_all(&mut self) -> Result<()> {
        let hub = self.nodes.first_mut().ok_or_else(|| {
            MeshError::InvalidState("simulation has no nodes".to_string())
        })?;
        hub.device.enable_inclusion_mode()?;
        hub.device.disable_inclusion_mode();
        let key = hub
            .device
            .keys()
            .current_mesh_key()
            .cloned()
            .ok_or_else(|| MeshError::InvalidState("hub has no mesh key".to_string()))?;

        for node in self.nodes.iter_mut().skip(1) {
            if !node.device.keys().has_mesh_key() {
                node.device.provision_mesh_key(key.clone())?;
            }
        }
        Ok(())
    }

    /// Run one simulation step
    pub fn step(&mut self) -> Result<()> {
        self.step_count += 1;
        self.now += self.config.step_ms;

        // 1. Put transmitted frames on the air
        self.propagate_frames();

        // 2. Let every node drain its inbox
        for i in 0..self.nodes.len() {
            while self.nodes[i].device.poll(self.now)?.is_some() {}
        }

        // 3. Account deliveries
        self.collect_results();
        Ok(())
    }

    fn propagate_frames(&mut self) {
        for from in 0..self.nodes.len() {
            let frames = self.nodes[from].device.radio_mut().take_outbox();
            for frame in frames {
                self.stats.frames_transmitted += 1;
                self.event_log.push(SimEvent::FrameTransmitted {
                    node_idx: from,
                    size: frame.len(),
                });
                for to in 0..self.nodes.len() {
                    if to == from {
                        continue;
                    }
                    let rssi = self
                        .config
                        .rssi_between(&self.nodes[from].position, &self.nodes[to].position);
                    if rssi < self.config.rx_sensitivity_dbm {
                        self.stats.frames_lost += 1;
                        self.event_log.push(SimEvent::FrameLost {
                            from_idx: from,
                            to_idx: to,
                            rssi,
                        });
                        continue;
                    }
                    trace!(from, to, rssi, "frame heard");
                    self.stats.frames_received += 1;
                    self.nodes[to]
                        .device
                        .radio_mut()
                        .inject(frame.clone(), rssi.round() as i16);
                }
            }
        }
    }

    fn collect_results(&mut self) {
        let mut total_hops = self.stats.avg_hops * self.stats.messages_delivered as f64;

        for (i, node) in self.nodes.iter_mut().enumerate() {
            let deliveries = node.deliveries.borrow();
            for delivery in deliveries.iter().skip(node.seen) {
                self.stats.per_node[i].messages_received += 1;
                if let Some(tracked) = self.tracked.get_mut(&(delivery.source, delivery.packet_id)) {
                    let at_destination = tracked.dest_idx.map_or(true, |d| d == i);
                    if at_destination && !tracked.delivered {
                        tracked.delivered = true;
                        self.stats.messages_delivered += 1;
                        total_hops += delivery.hop_count as f64;
                        self.event_log.push(SimEvent::MessageDelivered {
                            node_idx: i,
                            source: delivery.source,
                            packet_id: delivery.packet_id,
                            hops: delivery.hop_count,
                        });
                    }
                }
            }
            node.seen = deliveries.len();

            let inclusions = node.inclusions.borrow();
            for event in inclusions.iter().skip(node.seen_inclusions) {
                self.event_log.push(SimEvent::Inclusion {
                    node_idx: i,
                    event: event.clone(),
                });
            }
            node.seen_inclusions = inclusions.len();

            let stats = node.device.stats();
            self.stats.per_node[i].frames_relayed = stats.forwarded + stats.rebroadcast;
            self.stats.per_node[i].routes = node.device.router().routes().len();
        }

        if self.stats.messages_delivered > 0 {
            self.stats.avg_hops = total_hops / self.stats.messages_delivered as f64;
        }
    }

    /// Run simulation for a number of steps
    pub fn run(&mut self, steps: u64) -> Result<()> {
        for _ in 0..steps {
            self.step()?;
        }
        Ok(())
    }

    /// Run until `condition` holds or `max_steps` pass; returns whether it held
    pub fn run_until<F>(&mut self, max_steps: u64, condition: F) -> Result<bool>
    where
        F: Fn(&Self) -> bool,
    {
        for _ in 0..max_steps {
            self.step()?;
            if condition(self) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Send a message from one node to another; returns the packet ID
    pub fn send(&mut self, from_idx: usize, to_idx: usize, topic: Topic, payload: &[u8]) -> Result<u32> {
        let dest = self
            .node_id(to_idx)
            .ok_or_else(|| MeshError::InvalidState(format!("no node {to_idx}")))?;
        self.originate(from_idx, dest, Some(to_idx), topic, payload)
    }

    /// Broadcast a message from one node; returns the packet ID
    pub fn broadcast(&mut self, from_idx: usize, topic: Topic, payload: &[u8]) -> Result<u32> {
        self.originate(from_idx, NodeId::BROADCAST, None, topic, payload)
    }

    fn originate(
        &mut self,
        from_idx: usize,
        dest: NodeId,
        dest_idx: Option<usize>,
        topic: Topic,
        payload: &[u8],
    ) -> Result<u32> {
        let now = self.now;
        let node = self
            .nodes
            .get_mut(from_idx)
            .ok_or_else(|| MeshError::InvalidState(format!("no node {from_idx}")))?;
        let source = node.device.node_id();
        let packet_id = node.device.send(dest, topic, payload, now)?;

        self.tracked.insert(
            (source, packet_id),
            TrackedMessage {
                dest_idx,
                delivered: false,
            },
        );
        self.stats.messages_sent += 1;
        self.stats.per_node[from_idx].messages_sent += 1;
        self.event_log.push(SimEvent::MessageSent {
            node_idx: from_idx,
            packet_id,
            dest,
        });
        Ok(packet_id)
    }

    /// Index of the node with `id`
    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.device.node_id() == id)
    }

    pub fn device(&self, idx: usize) -> Option<&SimDevice> {
        self.nodes.get(idx).map(|n| &n.device)
    }

    pub fn device_mut(&mut self, idx: usize) -> Option<&mut SimDevice> {
        self.nodes.get_mut(idx).map(|n| &mut n.device)
    }

    /// Payloads delivered to a node's application so far
    pub fn deliveries(&self, idx: usize) -> Vec<Delivery> {
        self.nodes
            .get(idx)
            .map(|n| n.deliveries.borrow().clone())
            .unwrap_or_default()
    }

    /// Inclusion results reported to a node so far
    pub fn inclusion_events(&self, idx: usize) -> Vec<InclusionEvent> {
        self.nodes
            .get(idx)
            .map(|n| n.inclusions.borrow().clone())
            .unwrap_or_default()
    }

    /// Get current statistics
    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    /// Get event log
    pub fn events(&self) -> &[SimEvent] {
        &self.event_log
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_position(&self, idx: usize) -> Option<NodePosition> {
        self.nodes.get(idx).map(|n| n.position)
    }

    pub fn node_id(&self, idx: usize) -> Option<NodeId> {
        self.nodes.get(idx).map(|n| n.device.node_id())
    }

    /// Simulated clock (ms)
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Radio neighbours of each node, by position and sensitivity
    pub fn topology(&self) -> Vec<Vec<usize>> {
        let mut adj = vec![Vec::new(); self.nodes.len()];
        for (i, a) in self.nodes.iter().enumerate() {
            for (j, b) in self.nodes.iter().enumerate() {
                if i != j
                    && self.config.rssi_between(&a.position, &b.position)
                        >= self.config.rx_sensitivity_dbm
                {
                    adj[i].push(j);
                }
            }
        }
        adj
    }

    /// Check if the network is connected (all nodes reachable from node 0)
    pub fn is_connected(&self) -> bool {
        if self.nodes.is_empty() {
            return true;
        }

        let adj = self.topology();
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![0usize];

        while let Some(node) = stack.pop() {
            if visited[node] {
                continue;
            }
            visited[node] = true;

            for &neighbor in &adj[node] {
                if !visited[neighbor] {
                    stack.push(neighbor);
                }
            }
        }

        visited.iter().all(|&v| v)
    }

    /// Print a summary of the simulation
    pub fn print_summary(&self) {
        println!("\n=== Mesh Simulation Summary ===");
        println!("Steps: {} ({} ms simulated)", self.step_count, self.now);
        println!("Nodes: {}", self.nodes.len());
        println!();
        println!("Messages:");
        println!("  Sent: {}", self.stats.messages_sent);
        println!("  Delivered: {}", self.stats.messages_delivered);
        println!("  Delivery rate: {:.1}%", self.stats.delivery_rate() * 100.0);
        println!("  Average hops: {:.2}", self.stats.avg_hops);
        println!();
        println!("Frames:");
        println!("  Transmitted: {}", self.stats.frames_transmitted);
        println!("  Received: {}", self.stats.frames_received);
        println!("  Lost (range): {}", self.stats.frames_lost);
        println!();
        println!("Per-node stats:");
        for (i, stats) in self.stats.per_node.iter().enumerate() {
            println!(
                "  Node {:2} ({:08x}): TX={} RX={} relayed={} routes={}",
                i, stats.node_id, stats.messages_sent, stats.messages_received, stats.frames_relayed, stats.routes
            );
        }
    }
}

impl std::fmt::Debug for MeshSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshSimulator")
            .field("nodes", &self.nodes.len())
            .field("now", &self.now)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_position_distance() {
        let p1 = NodePosition::new(0.0, 0.0);
        let p2 = NodePosition::new(3.0, 4.0);
        assert!((p1.distance_to(&p2) - 5.0).abs() < 0.001);
    }

    #[test]
    fn test_rssi_calculation() {
        let config = SimConfig::default();
        let p1 = NodePosition::new(0.0, 0.0);
        let p2 = NodePosition::new(100.0, 0.0);

        let rssi = config.rssi_between(&p1, &p2);
        assert!(rssi < config.tx_power_dbm); // Path loss
        assert!(rssi > config.rx_sensitivity_dbm); // Still receivable at 100m
    }

    #[test]
    fn test_max_range_matches_sensitivity() {
        let config = SimConfig::default();
        let range = config.max_range();
        let origin = NodePosition::new(0.0, 0.0);
        let inside = config.rssi_between(&origin, &NodePosition::new(range * 0.99, 0.0));
        let outside = config.rssi_between(&origin, &NodePosition::new(range * 1.01, 0.0));
        assert!(inside >= config.rx_sensitivity_dbm);
        assert!(outside < config.rx_sensitivity_dbm);
    }

    #[test]
    fn test_sim_radio_queues() {
        let mut radio = SimRadio::new();
        radio.send(&[1, 2, 3]).unwrap();
        assert_eq!(radio.take_outbox(), vec![vec![1, 2, 3]]);

        radio.inject(vec![9], -80);
        assert_eq!(radio.pending(), 1);
        assert_eq!(radio.receive(Duration::ZERO).unwrap(), Some(vec![9]));
        assert_eq!(radio.rssi(), -80);
        assert_eq!(radio.receive(Duration::ZERO).unwrap(), None);

        radio.set_fail_tx(true);
        assert_eq!(radio.send(&[0]), Err(RadioError::TxTimeout));
    }

    #[test]
    fn test_line_topology() {
        let config = SimConfig::default();
        let spacing = config.max_range() * 0.8;
        let sim = MeshSimulator::line(config, 4, spacing).unwrap();
        assert_eq!(sim.node_count(), 4);
        assert_eq!(sim.topology()[0], vec![1]);
        assert_eq!(sim.topology()[1], vec![0, 2]);
        assert!(sim.is_connected());
    }

    #[test]
    fn test_close_nodes_communicate() {
        let mut sim = MeshSimulator::line(SimConfig::default(), 2, 50.0).unwrap();
        sim.provision_all().unwrap();

        sim.send(0, 1, Topic::application(0x20).unwrap(), b"Hello!").unwrap();
        sim.run(5).unwrap();

        assert_eq!(sim.stats().messages_delivered, 1);
        assert_eq!(sim.deliveries(1)[0].payload, b"Hello!");
    }

    #[test]
    fn test_far_nodes_no_communicate() {
        let config = SimConfig::default();
        let spacing = config.max_range() * 2.0;
        let mut sim = MeshSimulator::line(config, 2, spacing).unwrap();
        sim.provision_all().unwrap();

        sim.send(0, 1, Topic::Cmd, b"on").unwrap();
        sim.run(5).unwrap();

        assert!(!sim.is_connected());
        assert_eq!(sim.stats().messages_delivered, 0);
        assert!(sim.stats().frames_lost > 0);
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut sim = MeshSimulator::new(SimConfig::default());
        let config = MeshConfig::standard(NodeId::from_u32(5));
        sim.add_node(config.clone(), NodePosition::new(0.0, 0.0)).unwrap();
        assert!(sim.add_node(config, NodePosition::new(1.0, 0.0)).is_err());
    }
}
