//! Mesh device
//!
//! [`MeshDevice`] is the explicitly owned context object tying the core
//! together: it owns the radio and storage collaborators, the [`Router`]
//! (duplicate tracker, routing table, stats), the [`InclusionController`] and
//! the [`KeyManager`].
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          MeshDevice                          │
//! │                                                              │
//! │   Radio ──► poll() ──► Router::admit ──┬─► InclusionController│
//! │     ▲                  (decode/dedup/  │     (INCLUDE_*)      │
//! │     │                   learn)         │                      │
//! │     │                                  └─► Router::dispatch   │
//! │     └───────────── replies / relays ◄──────  (deliver/fwd)    │
//! │                                                              │
//! │   KeyManager ◄──── init() / shutdown() ────► ByteStorage      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The device is single-threaded and poll-driven. Each [`poll`](MeshDevice::poll)
//! sweeps expiry with the caller's `now`, reads at most one frame and handles
//! it to completion.

use crate::config::{DeviceRole, MeshConfig};
use crate::crypto::{CryptoProvider, MeshKey, SoftwareCrypto};
use crate::error::{MeshError, PacketError, Result};
use crate::inclusion::{InclusionController, InclusionEvent, InclusionState};
use crate::keys::KeyManager;
use crate::packet::{NodeId, Packet, Topic, TopicCategory};
use crate::router::{Delivery, DropReason, MeshStats, RouteOutcome, Router};
use crate::routing::RouteEntry;
use crate::storage::{KEY_INCLUSION_STATE, KEY_ROUTES};
use crate::traits::{ByteStorage, Radio};
use tracing::{debug, info, warn};

/// Callback for terminal inclusion results
pub type InclusionHandler = Box<dyn FnMut(&InclusionEvent)>;

/// A mesh node: router, inclusion and keys over a radio and a store
pub struct MeshDevice<R: Radio, S: ByteStorage> {
    config: MeshConfig,
    radio: R,
    storage: S,
    router: Router,
    inclusion: InclusionController,
    keys: KeyManager,
    inclusion_handler: Option<InclusionHandler>,
}

impl<R: Radio, S: ByteStorage> MeshDevice<R, S> {
    /// Create a device using the software crypto provider
    pub fn new(config: MeshConfig, radio: R, storage: S) -> Result<Self> {
        Self::with_crypto(config, radio, storage, Box::new(SoftwareCrypto::new()))
    }

    /// Create a device with a specific crypto provider
    pub fn with_crypto(
        config: MeshConfig,
        radio: R,
        storage: S,
        crypto: Box<dyn CryptoProvider>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            router: Router::new(&config),
            inclusion: InclusionController::new(&config),
            keys: KeyManager::new(crypto),
            inclusion_handler: None,
            config,
            radio,
            storage,
        })
    }

    /// Load the mesh key, membership state and route snapshot from storage
    pub fn init(&mut self, now: u64) -> Result<()> {
        let has_key = self.keys.load(&self.storage)?;

        if self.config.role == DeviceRole::Standard {
            let stored = self
                .storage
                .read_optional(KEY_INCLUSION_STATE)?
                .and_then(|bytes| bytes.first().copied())
                .map(InclusionState::from_byte);
            let state = match (has_key, stored) {
                (true, _) => InclusionState::Included,
                (false, Some(InclusionState::Included)) => {
                    warn!(node = %self.config.node_id, "stored membership has no mesh key, resetting");
                    InclusionState::NotIncluded
                }
                (false, _) => InclusionState::NotIncluded,
            };
            self.inclusion.restore_state(state);
        }

        if let Some(bytes) = self.storage.read_optional(KEY_ROUTES)? {
            match serde_json::from_slice::<Vec<RouteEntry>>(&bytes) {
                Ok(entries) => {
                    let count = entries.len();
                    self.router.routes_mut().restore(entries, now);
                    debug!(count, "routes restored");
                }
                Err(e) => warn!(error = %e, "ignoring unreadable route snapshot"),
            }
        }

        info!(
            node = %self.config.node_id,
            role = ?self.config.role,
            state = ?self.inclusion.state(),
            routes = self.router.routes().len(),
            "device initialised"
        );
        Ok(())
    }

    /// Persist the mesh key, membership state and routes
    pub fn shutdown(&mut self) -> Result<()> {
        self.persist_membership()?;
        let snapshot = serde_json::to_vec(&self.router.routes().snapshot())?;
        self.storage.write(KEY_ROUTES, &snapshot)?;
        info!(node = %self.config.node_id, "device state flushed");
        Ok(())
    }

    /// One loop tick: expire state, read at most one frame and handle it
    ///
    /// Returns `None` when no frame arrived within the receive timeout.
    pub fn poll(&mut self, now: u64) -> Result<Option<RouteOutcome>> {
        self.router.sweep(now);
        self.inclusion.check_timeouts(now);
        self.emit_inclusion_events()?;

        match self.radio.receive(self.config.receive_timeout())? {
            Some(frame) => self.process_frame(&frame, now).map(Some),
            None => Ok(None),
        }
    }

    /// Handle one raw frame as if it had just been received
    pub fn process_frame(&mut self, frame: &[u8], now: u64) -> Result<RouteOutcome> {
        let rssi = self.radio.rssi();
        let packet = match self.router.admit(frame, rssi, now) {
            Ok(packet) => packet,
            Err(reason) => return Ok(RouteOutcome::Dropped(reason)),
        };

        let outcome = if packet.topic.category() == TopicCategory::Inclusion {
            self.handle_inclusion(&packet, now)
        } else {
            self.router.dispatch(packet, now, &self.keys, &mut self.radio)
        };
        // Surface terminal inclusion results even if a reply failed to send
        self.emit_inclusion_events()?;
        outcome
    }

    fn handle_inclusion(&mut self, packet: &Packet, now: u64) -> Result<RouteOutcome> {
        if packet.destination != self.config.node_id && !packet.is_broadcast() {
            return Ok(RouteOutcome::Dropped(DropReason::HandshakeTopic));
        }
        match self.inclusion.handle(packet, now, &mut self.keys) {
            Ok(reply) => {
                if let Some(reply) = reply {
                    self.router.transmit(reply, now, &mut self.radio)?;
                }
                Ok(RouteOutcome::DeliveredLocally)
            }
            Err(e) => {
                debug!(from = %packet.source, topic = %packet.topic, error = %e, "inclusion frame refused");
                Ok(RouteOutcome::Dropped(DropReason::InclusionRejected))
            }
        }
    }

    fn emit_inclusion_events(&mut self) -> Result<()> {
        let events = self.inclusion.drain_events();
        if events.is_empty() {
            return Ok(());
        }
        if let Some(handler) = self.inclusion_handler.as_mut() {
            for event in &events {
                handler(event);
            }
        }
        self.persist_membership()
    }

    fn persist_membership(&mut self) -> Result<()> {
        let result = self.keys.flush(&mut self.storage).and_then(|_| {
            self.storage
                .write(KEY_INCLUSION_STATE, &[self.inclusion.state().as_byte()])
                .map_err(MeshError::from)
        });
        if let Err(e) = &result {
            warn!(error = %e, "failed to persist membership");
        }
        result
    }

    /// Send a sealed message; returns its packet ID
    pub fn send(&mut self, destination: NodeId, topic: Topic, payload: &[u8], now: u64) -> Result<u32> {
        if !topic.is_canonical() {
            return Err(PacketError::InvalidTopic(topic).into());
        }
        if topic.category() == TopicCategory::Inclusion {
            return Err(MeshError::InvalidState(format!(
                "{topic} is sent by the inclusion handshake"
            )));
        }
        if self.inclusion.state() != InclusionState::Included {
            return Err(MeshError::NotIncluded);
        }
        self.router
            .originate(destination, topic, payload, now, &self.keys, &mut self.radio)
    }

    /// Broadcast a sealed message to the whole mesh; returns its packet ID
    pub fn broadcast(&mut self, topic: Topic, payload: &[u8], now: u64) -> Result<u32> {
        self.send(NodeId::BROADCAST, topic, payload, now)
    }

    /// Ask a nearby hub to include this device
    pub fn request_inclusion(&mut self, now: u64) -> Result<()> {
        let request = self.inclusion.request_inclusion(now, &self.keys)?;
        self.router.transmit(request, now, &mut self.radio)?;
        Ok(())
    }

    /// Open the hub for inclusion, creating the mesh key if needed
    pub fn enable_inclusion_mode(&mut self) -> Result<()> {
        self.inclusion.enable_inclusion_mode(&mut self.keys)?;
        self.persist_membership()
    }

    /// Stop accepting inclusion requests
    pub fn disable_inclusion_mode(&mut self) {
        self.inclusion.disable_inclusion_mode();
    }

    /// Install a mesh key obtained out of band (factory provisioning)
    pub fn provision_mesh_key(&mut self, key: MeshKey) -> Result<()> {
        self.keys.install_mesh_key(key)?;
        self.inclusion.restore_state(InclusionState::Included);
        self.persist_membership()
    }

    /// Announce departure with BYE, then forget the mesh key
    pub fn leave(&mut self, now: u64) -> Result<()> {
        if self.config.role == DeviceRole::Hub {
            return Err(MeshError::InvalidState("a hub cannot leave its own mesh".to_string()));
        }
        if self.inclusion.state() != InclusionState::Included {
            return Err(MeshError::NotIncluded);
        }
        if let Err(e) = self.broadcast(Topic::Bye, &[], now) {
            warn!(error = %e, "BYE not sent");
        }
        self.keys.clear();
        self.inclusion.reset();
        info!(node = %self.config.node_id, "left mesh");
        self.persist_membership()
    }

    /// Register the application callback; only one may be registered
    pub fn on_receive<F>(&mut self, handler: F) -> Result<()>
    where
        F: FnMut(&Delivery) + 'static,
    {
        self.router.set_handler(Box::new(handler))
    }

    /// Register the inclusion result callback; only one may be registered
    pub fn on_inclusion<F>(&mut self, handler: F) -> Result<()>
    where
        F: FnMut(&InclusionEvent) + 'static,
    {
        if self.inclusion_handler.is_some() {
            return Err(MeshError::InvalidState(
                "inclusion handler already registered".to_string(),
            ));
        }
        self.inclusion_handler = Some(Box::new(handler));
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// This device's membership state
    pub fn state(&self) -> InclusionState {
        self.inclusion.state()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn inclusion(&self) -> &InclusionController {
        &self.inclusion
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    pub fn stats(&self) -> &MeshStats {
        self.router.stats()
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Tear down, returning the collaborators
    pub fn into_parts(self) -> (R, S) {
        (self.radio, self.storage)
    }
}

impl<R: Radio, S: ByteStorage> std::fmt::Debug for MeshDevice<R, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshDevice")
            .field("node_id", &self.config.node_id)
            .field("role", &self.config.role)
            .field("state", &self.inclusion.state())
            .field("router", &self.router)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{KeyError, RadioError};
    use crate::storage::{MemoryStorage, KEY_MESH_KEY};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::time::Duration;

    #[derive(Default)]
    struct QueueRadio {
        inbox: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
    }

    impl Radio for QueueRadio {
        fn send(&mut self, frame: &[u8]) -> std::result::Result<(), RadioError> {
            self.sent.push(frame.to_vec());
            Ok(())
        }

        fn receive(&mut self, _timeout: Duration) -> std::result::Result<Option<Vec<u8>>, RadioError> {
            Ok(self.inbox.pop_front())
        }

        fn rssi(&self) -> i16 {
            -70
        }
    }

    type TestDevice = MeshDevice<QueueRadio, MemoryStorage>;

    fn device(config: MeshConfig, storage: MemoryStorage) -> TestDevice {
        let mut device = MeshDevice::new(config, QueueRadio::default(), storage).unwrap();
        device.init(0).unwrap();
        device
    }

    fn standard(id: u32) -> TestDevice {
        device(MeshConfig::standard(NodeId::from_u32(id)), MemoryStorage::new())
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = MeshDevice::new(MeshConfig::default(), QueueRadio::default(), MemoryStorage::new());
        assert!(matches!(result, Err(MeshError::InvalidState(_))));
    }

    #[test]
    fn test_send_requires_inclusion() {
        let mut dev = standard(2);
        assert_eq!(dev.state(), InclusionState::NotIncluded);
        assert!(matches!(
            dev.send(NodeId::from_u32(1), Topic::Ping, &[], 0),
            Err(MeshError::NotIncluded)
        ));
        assert!(matches!(
            dev.send(NodeId::from_u32(1), Topic::IncludeOpen, &[], 0),
            Err(MeshError::InvalidState(_))
        ));
        assert!(dev.radio().sent.is_empty());
    }

    #[test]
    fn test_send_rejects_misclassified_topic() {
        let mut hub = device(MeshConfig::hub(NodeId::from_u32(1)), MemoryStorage::new());
        hub.enable_inclusion_mode().unwrap();

        // 0x06 on the wire is INCLUDE_REQUEST, not application data
        let result = hub.send(NodeId::from_u32(2), Topic::Application(0x06), b"x", 0);
        assert!(matches!(
            result,
            Err(MeshError::Packet(PacketError::InvalidTopic(Topic::Application(0x06))))
        ));
        assert!(hub.radio().sent.is_empty());
        assert!(hub.send(NodeId::from_u32(2), Topic::Application(0x16), b"x", 0).is_ok());
    }

    #[test]
    fn test_poll_without_traffic() {
        let mut dev = standard(2);
        assert_eq!(dev.poll(10).unwrap(), None);
    }

    #[test]
    fn test_hub_inclusion_mode_persists_key() {
        let mut hub = device(MeshConfig::hub(NodeId::from_u32(1)), MemoryStorage::new());
        hub.enable_inclusion_mode().unwrap();
        assert!(hub.keys().has_mesh_key());
        assert!(hub.storage().contains(KEY_MESH_KEY));
        assert!(hub.storage().contains(KEY_INCLUSION_STATE));
        assert!(hub.send(NodeId::from_u32(2), Topic::Cmd, b"on", 0).is_ok());
    }

    #[test]
    fn test_delivers_and_replies() {
        let mut hub = device(MeshConfig::hub(NodeId::from_u32(1)), MemoryStorage::new());
        hub.enable_inclusion_mode().unwrap();
        let key = hub.keys().current_mesh_key().cloned().unwrap();

        let mut dev = standard(2);
        dev.provision_mesh_key(key).unwrap();
        assert_eq!(dev.state(), InclusionState::Included);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        dev.on_receive(move |d: &Delivery| sink.borrow_mut().push(d.clone())).unwrap();

        hub.send(NodeId::from_u32(2), Topic::Cmd, b"light on", 0).unwrap();
        let frame = hub.radio_mut().sent.remove(0);
        dev.radio_mut().inbox.push_back(frame);

        assert_eq!(dev.poll(1).unwrap(), Some(RouteOutcome::DeliveredLocally));
        assert_eq!(seen.borrow()[0].payload, b"light on");

        // ACK goes back out
        let ack = Packet::decode(&dev.radio().sent[0]).unwrap();
        assert_eq!(ack.topic, Topic::Ack);
        assert_eq!(ack.destination, NodeId::from_u32(1));
    }

    #[test]
    fn test_inclusion_over_queue_radios() {
        let mut hub = device(MeshConfig::hub(NodeId::from_u32(1)), MemoryStorage::new());
        hub.enable_inclusion_mode().unwrap();
        let mut dev = standard(2);

        let results = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&results);
        dev.on_inclusion(move |e: &InclusionEvent| sink.borrow_mut().push(e.clone()))
            .unwrap();

        dev.request_inclusion(0).unwrap();
        assert_eq!(dev.state(), InclusionState::InclusionPending);

        // Shuttle frames until both outboxes are quiet
        for now in 1..10 {
            let to_hub: Vec<_> = dev.radio_mut().sent.drain(..).collect();
            hub.radio_mut().inbox.extend(to_hub);
            while hub.poll(now).unwrap().is_some() {}

            let to_dev: Vec<_> = hub.radio_mut().sent.drain(..).collect();
            dev.radio_mut().inbox.extend(to_dev);
            while dev.poll(now).unwrap().is_some() {}
        }

        assert_eq!(dev.state(), InclusionState::Included);
        assert_eq!(dev.keys().current_mesh_key(), hub.keys().current_mesh_key());
        assert_eq!(dev.keys().install_count(), 1);
        assert_eq!(
            *results.borrow(),
            vec![InclusionEvent::Included { peer: NodeId::from_u32(1) }]
        );
        assert_eq!(hub.inclusion().state_of(NodeId::from_u32(2)), InclusionState::Included);
        assert!(dev.storage().contains(KEY_MESH_KEY));
    }

    #[test]
    fn test_shutdown_and_restart() {
        let mut dev = standard(2);
        dev.provision_mesh_key(MeshKey::from_bytes([7; 32])).unwrap();

        let hello = Packet::broadcast(NodeId::from_u32(9), Topic::Ping, vec![])
            .unwrap()
            .encode()
            .unwrap();
        dev.process_frame(&hello, 0).unwrap();
        assert!(dev.router().routes().lookup(&NodeId::from_u32(9)).is_some());
        dev.shutdown().unwrap();

        let (_, storage) = dev.into_parts();
        let restarted = device(MeshConfig::standard(NodeId::from_u32(2)), storage);
        assert_eq!(restarted.state(), InclusionState::Included);
        assert!(restarted.keys().has_mesh_key());
        assert!(restarted.router().routes().lookup(&NodeId::from_u32(9)).is_some());
    }

    #[test]
    fn test_corrupt_route_snapshot_ignored() {
        let mut storage = MemoryStorage::new();
        storage.write(KEY_ROUTES, b"not json").unwrap();
        let dev = device(MeshConfig::standard(NodeId::from_u32(2)), storage);
        assert!(dev.router().routes().is_empty());
    }

    #[test]
    fn test_leave_clears_membership() {
        let mut dev = standard(2);
        dev.provision_mesh_key(MeshKey::from_bytes([7; 32])).unwrap();
        dev.leave(5).unwrap();

        assert_eq!(dev.state(), InclusionState::NotIncluded);
        assert!(!dev.keys().has_mesh_key());
        assert!(!dev.storage().contains(KEY_MESH_KEY));
        let bye = Packet::decode(&dev.radio().sent[0]).unwrap();
        assert_eq!(bye.topic, Topic::Bye);
        assert!(bye.is_broadcast());
    }

    #[test]
    fn test_provision_twice_fails() {
        let mut dev = standard(2);
        dev.provision_mesh_key(MeshKey::from_bytes([1; 32])).unwrap();
        assert!(matches!(
            dev.provision_mesh_key(MeshKey::from_bytes([2; 32])),
            Err(MeshError::Key(KeyError::AlreadyInstalled))
        ));
    }

    #[test]
    fn test_storage_failure_propagates() {
        let mut storage = MemoryStorage::new();
        storage.set_fail_writes(true);
        let mut hub = device(MeshConfig::hub(NodeId::from_u32(1)), storage);
        assert!(matches!(hub.enable_inclusion_mode(), Err(MeshError::Storage(_))));
        // The key is still live in memory
        assert!(hub.keys().has_mesh_key());
    }

    #[test]
    fn test_handlers_register_once() {
        let mut dev = standard(2);
        dev.on_inclusion(|_: &InclusionEvent| {}).unwrap();
        assert!(dev.on_inclusion(|_: &InclusionEvent| {}).is_err());
        dev.on_receive(|_: &Delivery| {}).unwrap();
        assert!(dev.on_receive(|_: &Delivery| {}).is_err());
    }
}
