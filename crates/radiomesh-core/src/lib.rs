//! # RadioMesh Core
//!
//! Packet routing and secure device inclusion for low-power radio meshes.
//!
//! ## Overview
//!
//! Nodes exchange small checksummed frames over a shared broadcast medium,
//! relay them towards distant destinations, and admit new devices through a
//! five-message key-agreement handshake. This crate provides:
//!
//! - **Packet**: binary frame encode/decode with CRC-32 validation
//! - **DuplicateTracker**: bounded, time-windowed suppression of re-floods
//! - **RoutingTable**: best next hop per destination, learned from traffic
//! - **Router**: deliver / forward / flood / drop decisions
//! - **InclusionController**: the INCLUDE_* handshake state machine
//! - **KeyManager**: the mesh-wide AES-256-GCM key
//!
//! ## Frame Flow
//!
//! ```text
//! RX: Radio → decode → dedup → learn route ─┬→ INCLUDE_* → InclusionController
//!                                           └→ other     → deliver / forward / flood
//! TX: payload → seal (mesh key) → encode → Radio
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use radiomesh_core::{MeshConfig, MeshDevice, MemoryStorage, NodeId, Topic};
//! use radiomesh_core::sim::SimRadio;
//!
//! let config = MeshConfig::hub(NodeId::from_u32(1));
//! let mut hub = MeshDevice::new(config, SimRadio::new(), MemoryStorage::new())?;
//! hub.init(0)?;
//! hub.on_receive(|d| println!("{} says {:?}", d.source, d.payload))?;
//!
//! // Accept new devices; creates the mesh key on first use
//! hub.enable_inclusion_mode()?;
//!
//! // Drive the device from the application's loop
//! let mut now = 0;
//! loop {
//!     hub.poll(now)?;
//!     now += 10;
//! #   if now > 100 { break; }
//! }
//! hub.shutdown()?;
//! # Ok::<(), radiomesh_core::MeshError>(())
//! ```

pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod inclusion;
pub mod keys;
pub mod packet;
pub mod router;
pub mod routing;
pub mod sim;
pub mod storage;
pub mod tracker;
pub mod traits;

pub use config::{DeviceRole, MeshConfig};
pub use crypto::{CryptoProvider, MeshKey, SoftwareCrypto};
pub use device::MeshDevice;
pub use error::{
    CryptoError, InclusionError, KeyError, MeshError, PacketError, RadioError, Result,
    StorageError,
};
pub use inclusion::{InclusionController, InclusionEvent, InclusionState};
pub use keys::KeyManager;
pub use packet::{NodeId, Packet, Topic, TopicCategory};
pub use router::{Delivery, DropReason, MeshStats, RouteOutcome, Router};
pub use routing::{RouteEntry, RoutingTable};
pub use storage::MemoryStorage;
pub use tracker::{DuplicateTracker, Observation};
pub use traits::{ByteStorage, Radio, SignalIndicator};
