//! Mesh packet types and framing
//!
//! A frame is a fixed 23-byte header, a payload of up to [`MAX_PAYLOAD`]
//! bytes, and a trailing CRC-32 that covers every byte before it.
//!
//! ## Frame Structure
//!
//! ```text
//! ┌────────────┬────────────┬─────────┬─────────────┬───────────┐
//! │ Src (4B)   │ Dest (4B)  │ Topic   │ Packet ID   │ Hop Count │
//! │            │            │  (1B)   │   (4B)      │   (1B)    │
//! ├────────────┼────────────┼─────────┴─────────────┴───────────┤
//! │ Last Hop   │ Next Hop   │ Payload Length (1B)               │
//! │   (4B)     │   (4B)     │                                   │
//! ├────────────┴────────────┴───────────────────────────────────┤
//! │ Payload (0-229B)                                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │ CRC-32 (4B)                                                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All multi-byte fields are big-endian. A destination of `FF FF FF FF`
//! is a broadcast.

use crate::error::PacketError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest frame the radio can carry
pub const MAX_FRAME_LEN: usize = 256;

/// Header length in bytes
pub const HEADER_LEN: usize = 23;

/// Checksum length in bytes
pub const CHECKSUM_LEN: usize = 4;

/// Smallest valid frame (empty payload)
pub const MIN_FRAME_LEN: usize = HEADER_LEN + CHECKSUM_LEN;

/// Largest payload that fits in one frame
pub const MAX_PAYLOAD: usize = MAX_FRAME_LEN - MIN_FRAME_LEN;

/// Highest protocol-owned topic value
pub const MAX_RESERVED_TOPIC: u8 = 0x0F;

/// Node identifier - 4-byte unique ID
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; 4]);

impl NodeId {
    /// Broadcast address (all 0xFF)
    pub const BROADCAST: NodeId = NodeId([0xFF, 0xFF, 0xFF, 0xFF]);

    /// Unknown/unset address (all 0x00)
    pub const UNKNOWN: NodeId = NodeId([0x00, 0x00, 0x00, 0x00]);

    /// Create a new NodeId from 4 bytes
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        NodeId(bytes)
    }

    /// Create a NodeId from a u32
    pub fn from_u32(value: u32) -> Self {
        NodeId(value.to_be_bytes())
    }

    /// Convert to u32
    pub fn to_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Generate a random NodeId that is neither broadcast nor unknown
    pub fn random() -> Self {
        loop {
            let id = NodeId(rand::random());
            if !id.is_broadcast() && !id.is_unknown() {
                return id;
            }
        }
    }

    /// Check if this is the broadcast address
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Check if this is unknown/unset
    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:08x})", self.to_u32())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.to_u32())
    }
}

/// Coarse classification of a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicCategory {
    /// Protocol housekeeping (PING, PONG, ACK, CMD, BYE, reserved values)
    Control,
    /// The five-step inclusion handshake
    Inclusion,
    /// Application-defined, above [`MAX_RESERVED_TOPIC`]
    Application,
}

/// Message kind carried in the topic byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Ping,
    Pong,
    Ack,
    Cmd,
    Bye,
    IncludeRequest,
    IncludeResponse,
    IncludeOpen,
    IncludeConfirm,
    IncludeSuccess,
    /// Protocol-owned value with no assigned meaning (including 0x00)
    Reserved(u8),
    /// Application-defined topic (> 0x0F)
    Application(u8),
}

impl Topic {
    /// Decode a topic byte; never fails
    pub fn from_byte(value: u8) -> Self {
        match value {
            0x01 => Topic::Ping,
            0x02 => Topic::Pong,
            0x03 => Topic::Ack,
            0x04 => Topic::Cmd,
            0x05 => Topic::Bye,
            0x06 => Topic::IncludeRequest,
            0x07 => Topic::IncludeResponse,
            0x08 => Topic::IncludeOpen,
            0x09 => Topic::IncludeConfirm,
            0x0A => Topic::IncludeSuccess,
            v if v <= MAX_RESERVED_TOPIC => Topic::Reserved(v),
            v => Topic::Application(v),
        }
    }

    /// Wire value
    pub fn as_byte(&self) -> u8 {
        match self {
            Topic::Ping => 0x01,
            Topic::Pong => 0x02,
            Topic::Ack => 0x03,
            Topic::Cmd => 0x04,
            Topic::Bye => 0x05,
            Topic::IncludeRequest => 0x06,
            Topic::IncludeResponse => 0x07,
            Topic::IncludeOpen => 0x08,
            Topic::IncludeConfirm => 0x09,
            Topic::IncludeSuccess => 0x0A,
            Topic::Reserved(v) | Topic::Application(v) => *v,
        }
    }

    /// Whether the variant is the one its wire byte decodes to
    ///
    /// `Application(0x06)` or `Reserved(0x01)` can be built in code but would
    /// arrive as a different topic.
    pub fn is_canonical(&self) -> bool {
        Topic::from_byte(self.as_byte()) == *self
    }

    /// Application topic, if `value` lies above the protocol range
    pub fn application(value: u8) -> Option<Self> {
        (value > MAX_RESERVED_TOPIC).then_some(Topic::Application(value))
    }

    /// Classify the topic
    pub fn category(&self) -> TopicCategory {
        match self {
            Topic::IncludeRequest
            | Topic::IncludeResponse
            | Topic::IncludeOpen
            | Topic::IncludeConfirm
            | Topic::IncludeSuccess => TopicCategory::Inclusion,
            Topic::Application(_) => TopicCategory::Application,
            _ => TopicCategory::Control,
        }
    }

    /// Topic sent back automatically when this one is delivered locally
    pub fn reply_topic(&self) -> Option<Topic> {
        match self {
            Topic::Ping => Some(Topic::Pong),
            Topic::Cmd => Some(Topic::Ack),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topic::Ping => "PING",
            Topic::Pong => "PONG",
            Topic::Ack => "ACK",
            Topic::Cmd => "CMD",
            Topic::Bye => "BYE",
            Topic::IncludeRequest => "INCLUDE_REQUEST",
            Topic::IncludeResponse => "INCLUDE_RESPONSE",
            Topic::IncludeOpen => "INCLUDE_OPEN",
            Topic::IncludeConfirm => "INCLUDE_CONFIRM",
            Topic::IncludeSuccess => "INCLUDE_SUCCESS",
            Topic::Reserved(v) => return write!(f, "RESERVED({:#04x})", v),
            Topic::Application(v) => return write!(f, "APP({:#04x})", v),
        };
        f.write_str(name)
    }
}

/// A decoded mesh frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Originating node
    pub source: NodeId,
    /// Final destination, or [`NodeId::BROADCAST`]
    pub destination: NodeId,
    /// Message kind
    pub topic: Topic,
    /// Per-source message identifier used for duplicate suppression
    pub packet_id: u32,
    /// Hops already travelled (0 when sent by the originator)
    pub hop_count: u8,
    /// Node that transmitted this copy
    pub last_hop: NodeId,
    /// Relay expected to act on this copy, or broadcast for flooding
    pub next_hop: NodeId,
    /// Opaque payload, sealed under the mesh key outside inclusion
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a packet with a random packet ID, ready to leave `source`
    pub fn new(
        source: NodeId,
        destination: NodeId,
        topic: Topic,
        payload: Vec<u8>,
    ) -> Result<Self, PacketError> {
        if !topic.is_canonical() {
            return Err(PacketError::InvalidTopic(topic));
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            source,
            destination,
            topic,
            packet_id: rand::random(),
            hop_count: 0,
            last_hop: source,
            next_hop: NodeId::BROADCAST,
            payload,
        })
    }

    /// Create a broadcast packet
    pub fn broadcast(source: NodeId, topic: Topic, payload: Vec<u8>) -> Result<Self, PacketError> {
        Self::new(source, NodeId::BROADCAST, topic, payload)
    }

    /// Override the packet ID
    pub fn with_packet_id(mut self, packet_id: u32) -> Self {
        self.packet_id = packet_id;
        self
    }

    /// Parse and validate a raw frame
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < MIN_FRAME_LEN || bytes.len() > MAX_FRAME_LEN {
            return Err(PacketError::InvalidLength {
                expected: MIN_FRAME_LEN,
                actual: bytes.len(),
            });
        }

        // Checksum first, so a damaged length byte reports as corruption
        let (body, trailer) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(PacketError::PacketCorrupted { expected, actual });
        }

        let payload_len = body[22] as usize;
        if body.len() != HEADER_LEN + payload_len {
            return Err(PacketError::InvalidLength {
                expected: MIN_FRAME_LEN + payload_len,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            source: read_node_id(&body[0..4]),
            destination: read_node_id(&body[4..8]),
            topic: Topic::from_byte(body[8]),
            packet_id: u32::from_be_bytes([body[9], body[10], body[11], body[12]]),
            hop_count: body[13],
            last_hop: read_node_id(&body[14..18]),
            next_hop: read_node_id(&body[18..22]),
            payload: body[HEADER_LEN..].to_vec(),
        })
    }

    /// Serialize to a wire frame
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        if !self.topic.is_canonical() {
            return Err(PacketError::InvalidTopic(self.topic));
        }
        if self.payload.len() > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(self.payload.len()));
        }

        let mut frame = Vec::with_capacity(MIN_FRAME_LEN + self.payload.len());
        frame.extend_from_slice(self.source.as_bytes());
        frame.extend_from_slice(self.destination.as_bytes());
        frame.push(self.topic.as_byte());
        frame.extend_from_slice(&self.packet_id.to_be_bytes());
        frame.push(self.hop_count);
        frame.extend_from_slice(self.last_hop.as_bytes());
        frame.extend_from_slice(self.next_hop.as_bytes());
        frame.push(self.payload.len() as u8);
        frame.extend_from_slice(&self.payload);

        let crc = crc32fast::hash(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());
        Ok(frame)
    }

    /// Check if this is a broadcast packet
    pub fn is_broadcast(&self) -> bool {
        self.destination.is_broadcast()
    }

    /// Duplicate-suppression key
    pub fn dedup_key(&self) -> (NodeId, u32) {
        (self.source, self.packet_id)
    }

    /// Header fields that stay fixed end to end, used as AEAD associated data
    pub fn associated_data(&self) -> [u8; 13] {
        let mut aad = [0u8; 13];
        aad[0..4].copy_from_slice(self.source.as_bytes());
        aad[4..8].copy_from_slice(self.destination.as_bytes());
        aad[8] = self.topic.as_byte();
        aad[9..13].copy_from_slice(&self.packet_id.to_be_bytes());
        aad
    }

    /// Hops left before `limit`
    pub fn remaining_hops(&self, limit: u8) -> u8 {
        limit.saturating_sub(self.hop_count)
    }

    /// Check whether the hop budget is used up
    pub fn is_at_max_hops(&self, limit: u8) -> bool {
        self.hop_count >= limit
    }

    /// Spend one hop of the remaining budget
    pub fn decrement_hop(&mut self, limit: u8) -> Result<(), PacketError> {
        if self.is_at_max_hops(limit) {
            return Err(PacketError::MaxHops {
                hop_count: self.hop_count,
                limit,
            });
        }
        self.hop_count += 1;
        Ok(())
    }
}

fn read_node_id(bytes: &[u8]) -> NodeId {
    NodeId::from_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
