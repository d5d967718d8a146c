//! Packet router
//!
//! Every inbound frame goes through the same pipeline:
//!
//! ```text
//!  raw bytes ─► decode ─► dedup ─► learn route ─┬─► for us ──────► deliver (+ PONG/ACK)
//!                 │          │                  ├─► broadcast ────► deliver + rebroadcast
//!                 ▼          ▼                  └─► for someone ──► forward via next hop
//!              Dropped    Dropped                                   or flood if unknown
//! ```
//!
//! Routes are learned from every frame heard, not from a separate discovery
//! protocol: a frame from `source` relayed by `last_hop` after `h` hops is a
//! route to `source` of length `h + 1` through `last_hop`.
//!
//! Payloads outside the inclusion handshake are sealed with the mesh key.
//! Relays forward ciphertext untouched; only the final recipient opens it.

use crate::config::MeshConfig;
use crate::error::{MeshError, PacketError, Result};
use crate::keys::KeyManager;
use crate::packet::{NodeId, Packet, Topic, TopicCategory, MAX_PAYLOAD};
use crate::routing::{RouteChange, RoutingTable};
use crate::tracker::{DuplicateTracker, Observation};
use crate::traits::Radio;
use tracing::{debug, trace};

/// Why a frame was not delivered or relayed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Frame too short or length fields inconsistent
    InvalidLength,
    /// Checksum mismatch
    PacketCorrupted,
    /// Already processed within the dedup window
    Duplicate,
    /// Hop budget exhausted
    MaxHops,
    /// Echo of a frame this node originated
    OwnPacket,
    /// Unicast relay meant for a different neighbour
    NotNextHop,
    /// Relaying is disabled on this node
    RelayDisabled,
    /// Payload could not be opened with the mesh key
    Unauthenticated,
    /// Protocol topic with no assigned meaning
    UnsupportedTopic,
    /// Inclusion traffic is handled by the inclusion controller, not routed
    HandshakeTopic,
    /// Inclusion controller refused the frame
    InclusionRejected,
}

/// Result of routing one inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Addressed to this node and handed to the application
    DeliveredLocally,
    /// Relayed towards a known next hop
    Forwarded { next_hop: NodeId },
    /// Relayed by flooding
    Rebroadcast,
    /// Not delivered or relayed
    Dropped(DropReason),
}

/// A payload delivered to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub source: NodeId,
    pub destination: NodeId,
    pub topic: Topic,
    pub packet_id: u32,
    /// Hops the frame travelled before reaching us
    pub hop_count: u8,
    /// Decrypted payload
    pub payload: Vec<u8>,
}

/// Application callback for local deliveries
pub type DeliveryHandler = Box<dyn FnMut(&Delivery)>;

/// Statistics for router operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshStats {
    /// Frames read from the radio
    pub packets_rx: u64,
    /// Frames written to the radio (originated and relayed)
    pub packets_tx: u64,
    /// Payloads handed to the application
    pub delivered: u64,
    /// Unicast relays via a known next hop
    pub forwarded: u64,
    /// Flood relays
    pub rebroadcast: u64,
    /// Frames suppressed as duplicates
    pub duplicates_dropped: u64,
    /// Frames failing length or checksum validation
    pub corrupted: u64,
    /// Frames dropped for exhausting the hop budget
    pub hop_limit_exceeded: u64,
    /// Payloads that failed authentication
    pub unauthenticated: u64,
    /// Routes inserted or replaced
    pub routes_learned: u64,
}

/// Router: dedup, route learning and forwarding decisions
pub struct Router {
    node_id: NodeId,
    max_hops: u8,
    relay_enabled: bool,
    tracker: DuplicateTracker,
    routes: RoutingTable,
    stats: MeshStats,
    handler: Option<DeliveryHandler>,
}

impl Router {
    /// Create a router from device configuration
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            node_id: config.node_id,
            max_hops: config.max_hops,
            relay_enabled: config.relay_enabled,
            tracker: DuplicateTracker::new(config.dedup_window_ms, config.dedup_capacity),
            routes: RoutingTable::new(config.route_timeout_ms, config.max_routes),
            stats: MeshStats::default(),
            handler: None,
        }
    }

    /// This node's ID
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Register the application callback; only one may be registered
    pub fn set_handler(&mut self, handler: DeliveryHandler) -> Result<()> {
        if self.handler.is_some() {
            return Err(MeshError::InvalidState(
                "delivery handler already registered".to_string(),
            ));
        }
        self.handler = Some(handler);
        Ok(())
    }

    /// Routing table
    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    /// Mutable routing table, for restore and administrative removal
    pub fn routes_mut(&mut self) -> &mut RoutingTable {
        &mut self.routes
    }

    /// Duplicate tracker
    pub fn tracker(&self) -> &DuplicateTracker {
        &self.tracker
    }

    /// Counters
    pub fn stats(&self) -> &MeshStats {
        &self.stats
    }

    /// Periodic expiry of dedup entries and stale routes
    pub fn sweep(&mut self, now: u64) {
        let evicted = self.tracker.evict_expired(now);
        let expired = self.routes.expire(now);
        if evicted > 0 || expired > 0 {
            trace!(evicted, expired, "router sweep");
        }
    }

    /// Route one raw frame end to end
    pub fn route_packet(
        &mut self,
        raw: &[u8],
        rssi: i16,
        now: u64,
        keys: &KeyManager,
        radio: &mut dyn Radio,
    ) -> Result<RouteOutcome> {
        match self.admit(raw, rssi, now) {
            Ok(packet) => self.dispatch(packet, now, keys, radio),
            Err(reason) => Ok(RouteOutcome::Dropped(reason)),
        }
    }

    /// Decode, dedup and learn from a frame
    ///
    /// On success the frame is fresh and the routing table has been updated
    /// from it; the caller decides who handles it next.
    pub fn admit(&mut self, raw: &[u8], rssi: i16, now: u64) -> std::result::Result<Packet, DropReason> {
        self.stats.packets_rx += 1;

        let packet = Packet::decode(raw).map_err(|e| {
            self.stats.corrupted += 1;
            debug!(error = %e, "dropping malformed frame");
            match e {
                PacketError::PacketCorrupted { .. } => DropReason::PacketCorrupted,
                _ => DropReason::InvalidLength,
            }
        })?;

        // Unicast relayed to another neighbour: learn from it, but leave the
        // dedup slot free for when the frame is handed to us
        if self.is_overheard(&packet) {
            if packet.source != self.node_id && !self.tracker.contains(packet.source, packet.packet_id, now) {
                self.learn(&packet, rssi, now);
            }
            trace!(source = %packet.source, next_hop = %packet.next_hop, "overheard");
            return Err(DropReason::NotNextHop);
        }

        if self.tracker.observe(packet.source, packet.packet_id, now) == Observation::Duplicate {
            self.stats.duplicates_dropped += 1;
            trace!(source = %packet.source, id = packet.packet_id, "duplicate");
            return Err(DropReason::Duplicate);
        }

        if packet.source == self.node_id {
            return Err(DropReason::OwnPacket);
        }

        self.learn(&packet, rssi, now);
        Ok(packet)
    }

    fn is_overheard(&self, packet: &Packet) -> bool {
        packet.topic.category() != TopicCategory::Inclusion
            && !packet.is_broadcast()
            && packet.destination != self.node_id
            && packet.next_hop != self.node_id
            && !packet.next_hop.is_broadcast()
    }

    fn learn(&mut self, packet: &Packet, rssi: i16, now: u64) {
        // Routes from frames this far out are not worth keeping
        if packet.hop_count < self.max_hops.saturating_sub(1) {
            let change = self.routes.update(
                packet.source,
                packet.last_hop,
                packet.hop_count + 1,
                rssi,
                now,
            );
            self.note_route(packet.source, change);
        }

        let neighbour = packet.last_hop;
        if neighbour != packet.source
            && neighbour != self.node_id
            && !neighbour.is_broadcast()
            && !neighbour.is_unknown()
        {
            let change = self.routes.update(neighbour, neighbour, 1, rssi, now);
            self.note_route(neighbour, change);
        }
    }

    fn note_route(&mut self, destination: NodeId, change: RouteChange) {
        if change != RouteChange::Kept {
            self.stats.routes_learned += 1;
            debug!(%destination, ?change, "route learned");
        }
    }

    /// Deliver, forward or flood an admitted frame
    pub fn dispatch(
        &mut self,
        packet: Packet,
        now: u64,
        keys: &KeyManager,
        radio: &mut dyn Radio,
    ) -> Result<RouteOutcome> {
        if packet.topic.category() == TopicCategory::Inclusion {
            return Ok(RouteOutcome::Dropped(DropReason::HandshakeTopic));
        }

        if packet.destination == self.node_id {
            return self.deliver_unicast(&packet, now, keys, radio);
        }

        if packet.is_broadcast() {
            let delivered = self.deliver(&packet, keys).is_ok();
            if !self.relay_enabled {
                return Ok(if delivered {
                    RouteOutcome::DeliveredLocally
                } else {
                    RouteOutcome::Dropped(DropReason::RelayDisabled)
                });
            }
            return self.relay(packet, NodeId::BROADCAST, radio);
        }

        if packet.next_hop != self.node_id && !packet.next_hop.is_broadcast() {
            return Ok(RouteOutcome::Dropped(DropReason::NotNextHop));
        }
        if !self.relay_enabled {
            return Ok(RouteOutcome::Dropped(DropReason::RelayDisabled));
        }

        let next_hop = self
            .routes
            .lookup(&packet.destination)
            .map(|r| r.next_hop)
            .unwrap_or(NodeId::BROADCAST);
        self.relay(packet, next_hop, radio)
    }

    fn deliver_unicast(
        &mut self,
        packet: &Packet,
        now: u64,
        keys: &KeyManager,
        radio: &mut dyn Radio,
    ) -> Result<RouteOutcome> {
        if let Err(reason) = self.deliver(packet, keys) {
            return Ok(RouteOutcome::Dropped(reason));
        }

        if let Some(reply) = packet.topic.reply_topic() {
            let body = match reply {
                Topic::Ack => packet.packet_id.to_be_bytes().to_vec(),
                _ => Vec::new(),
            };
            self.originate(packet.source, reply, &body, now, keys, radio)?;
            debug!(to = %packet.source, %reply, "reply sent");
        }
        Ok(RouteOutcome::DeliveredLocally)
    }

    /// Open the payload and hand it to the application
    fn deliver(&mut self, packet: &Packet, keys: &KeyManager) -> std::result::Result<(), DropReason> {
        if let Topic::Reserved(_) = packet.topic {
            return Err(DropReason::UnsupportedTopic);
        }

        let payload = keys
            .open(&packet.associated_data(), &packet.payload)
            .map_err(|e| {
                self.stats.unauthenticated += 1;
                debug!(source = %packet.source, error = %e, "payload rejected");
                DropReason::Unauthenticated
            })?;

        if packet.topic == Topic::Bye {
            self.routes.remove(&packet.source);
            debug!(source = %packet.source, "peer left, route removed");
        }

        let delivery = Delivery {
            source: packet.source,
            destination: packet.destination,
            topic: packet.topic,
            packet_id: packet.packet_id,
            hop_count: packet.hop_count,
            payload,
        };
        if let Some(handler) = self.handler.as_mut() {
            handler(&delivery);
        }
        self.stats.delivered += 1;
        Ok(())
    }

    fn relay(&mut self, mut packet: Packet, next_hop: NodeId, radio: &mut dyn Radio) -> Result<RouteOutcome> {
        if packet.decrement_hop(self.max_hops).is_err() {
            self.stats.hop_limit_exceeded += 1;
            debug!(source = %packet.source, id = packet.packet_id, "hop budget exhausted");
            return Ok(RouteOutcome::Dropped(DropReason::MaxHops));
        }
        packet.last_hop = self.node_id;
        packet.next_hop = next_hop;

        radio.send(&packet.encode()?)?;
        self.stats.packets_tx += 1;

        if next_hop.is_broadcast() {
            self.stats.rebroadcast += 1;
            debug!(source = %packet.source, id = packet.packet_id, "rebroadcast");
            Ok(RouteOutcome::Rebroadcast)
        } else {
            self.stats.forwarded += 1;
            debug!(source = %packet.source, %next_hop, "forwarded");
            Ok(RouteOutcome::Forwarded { next_hop })
        }
    }

    /// Seal and send an application or control message; returns the packet ID
    pub fn originate(
        &mut self,
        destination: NodeId,
        topic: Topic,
        payload: &[u8],
        now: u64,
        keys: &KeyManager,
        radio: &mut dyn Radio,
    ) -> Result<u32> {
        let mut packet = Packet::new(self.node_id, destination, topic, Vec::new())?;
        packet.payload = if topic.category() == TopicCategory::Inclusion {
            payload.to_vec()
        } else {
            keys.seal(&packet.associated_data(), payload)?
        };
        if packet.payload.len() > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(packet.payload.len()).into());
        }
        self.transmit(packet, now, radio)
    }

    /// Send a fully built packet from this node; returns the packet ID
    pub fn transmit(&mut self, mut packet: Packet, now: u64, radio: &mut dyn Radio) -> Result<u32> {
        packet.last_hop = self.node_id;
        if !packet.is_broadcast() {
            packet.next_hop = self
                .routes
                .lookup(&packet.destination)
                .map(|r| r.next_hop)
                .unwrap_or(NodeId::BROADCAST);
        }
        let frame = packet.encode()?;

        // Our own frame echoed back by neighbours must not be processed again
        self.tracker.observe(packet.source, packet.packet_id, now);
        radio.send(&frame)?;
        self.stats.packets_tx += 1;
        trace!(to = %packet.destination, topic = %packet.topic, len = frame.len(), "sent");
        Ok(packet.packet_id)
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("node_id", &self.node_id)
            .field("max_hops", &self.max_hops)
            .field("relay_enabled", &self.relay_enabled)
            .field("routes", &self.routes.len())
            .field("tracked", &self.tracker.len())
            .field("stats", &self.stats)
            .finish()
    }
}
