//! Device inclusion handshake
//!
//! A new device (includee) joins the mesh by running a five-message
//! handshake with a hub (includer) that is in inclusion mode:
//!
//! ```text
//!   Includee                                        Hub
//!      │  INCLUDE_REQUEST   (eph. pubkey, nonce)      │   broadcast
//!      │ ───────────────────────────────────────────► │
//!      │  INCLUDE_RESPONSE  (eph. pubkey, nonce)      │
//!      │ ◄─────────────────────────────────────────── │
//!      │         both derive the bootstrap key        │
//!      │  INCLUDE_OPEN      seal_boot(includee id)    │
//!      │ ───────────────────────────────────────────► │
//!      │  INCLUDE_CONFIRM   seal_boot(mesh key)       │
//!      │ ◄─────────────────────────────────────────── │
//!      │  INCLUDE_SUCCESS   seal_mesh(includee id)    │
//!      │ ───────────────────────────────────────────► │
//! ```
//!
//! The bootstrap key is `HKDF-SHA256(X25519(eph_a, eph_b))` salted with both
//! nonces and, if configured, a pre-shared inclusion secret. Every sealed
//! payload is bound to its frame header.
//!
//! Each step must arrive before a deadline. A timeout, an out-of-sequence
//! message from the session peer, or any failed decrypt destroys the session
//! and queues exactly one [`InclusionEvent::Failed`].

use crate::config::{DeviceRole, MeshConfig};
use crate::crypto::{AgreementKeyPair, CryptoProvider, MeshKey, KEY_LEN};
use crate::error::{CryptoError, InclusionError, KeyError, MeshError};
use crate::keys::KeyManager;
use crate::packet::{NodeId, Packet, Topic};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Handshake nonce length
pub const NONCE_LEN: usize = 16;

/// Length of REQUEST and RESPONSE payloads
const OFFER_LEN: usize = KEY_LEN + NONCE_LEN;

const KDF_LABEL: &[u8] = b"radiomesh/inclusion/v1";

/// Membership state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InclusionState {
    NotIncluded,
    InclusionPending,
    Included,
}

impl InclusionState {
    /// Persisted byte
    pub fn as_byte(&self) -> u8 {
        match self {
            InclusionState::NotIncluded => 0,
            InclusionState::InclusionPending => 1,
            InclusionState::Included => 2,
        }
    }

    /// Parse a persisted byte; a pending handshake does not survive a restart
    pub fn from_byte(value: u8) -> Self {
        match value {
            2 => InclusionState::Included,
            _ => InclusionState::NotIncluded,
        }
    }
}

/// Terminal result of one inclusion session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InclusionEvent {
    /// Handshake completed with `peer`
    Included { peer: NodeId },
    /// Session destroyed
    Failed { peer: NodeId, reason: InclusionError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    AwaitingResponse,
    AwaitingConfirm,
    AwaitingOpen,
    AwaitingSuccess,
}

#[derive(Debug)]
struct Session {
    /// Includer for our own session; broadcast until a hub answers
    peer: NodeId,
    step: Step,
    deadline: u64,
    key_pair: AgreementKeyPair,
    nonce: [u8; NONCE_LEN],
    bootstrap: Option<MeshKey>,
}

/// Inclusion state machine for both roles
#[derive(Debug)]
pub struct InclusionController {
    node_id: NodeId,
    role: DeviceRole,
    timeout_ms: u64,
    max_sessions: usize,
    secret: Option<[u8; 32]>,
    state: InclusionState,
    inclusion_mode: bool,
    /// Includee side: our own handshake
    own: Option<Session>,
    /// Includer side: one session per peer
    sessions: HashMap<NodeId, Session>,
    /// Peers this hub has included since start
    included: BTreeSet<NodeId>,
    events: Vec<InclusionEvent>,
}

impl InclusionController {
    /// Create a controller; hubs start included, standard devices do not
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            node_id: config.node_id,
            role: config.role,
            timeout_ms: config.inclusion_timeout_ms,
            max_sessions: config.max_inclusion_sessions,
            secret: config.inclusion_secret,
            state: match config.role {
                DeviceRole::Hub => InclusionState::Included,
                DeviceRole::Standard => InclusionState::NotIncluded,
            },
            inclusion_mode: false,
            own: None,
            sessions: HashMap::new(),
            included: BTreeSet::new(),
            events: Vec::new(),
        }
    }

    /// This device's membership state
    pub fn state(&self) -> InclusionState {
        self.state
    }

    /// Restore a persisted membership state
    pub fn restore_state(&mut self, state: InclusionState) {
        if self.role == DeviceRole::Standard {
            self.state = state;
        }
    }

    /// Forget membership (after leaving the mesh)
    pub fn reset(&mut self) {
        self.own = None;
        if self.role == DeviceRole::Standard {
            self.state = InclusionState::NotIncluded;
        }
    }

    /// Membership state of `peer` as seen from this device
    pub fn state_of(&self, peer: NodeId) -> InclusionState {
        if self.sessions.contains_key(&peer) || self.own.as_ref().is_some_and(|s| s.peer == peer) {
            InclusionState::InclusionPending
        } else if self.included.contains(&peer) {
            InclusionState::Included
        } else {
            InclusionState::NotIncluded
        }
    }

    /// Whether a hub is accepting new devices
    pub fn in_inclusion_mode(&self) -> bool {
        self.inclusion_mode
    }

    /// Number of handshakes in progress
    pub fn active_sessions(&self) -> usize {
        self.sessions.len() + usize::from(self.own.is_some())
    }

    /// Start accepting inclusion requests (hub only)
    ///
    /// A hub without a mesh key generates and installs one here.
    pub fn enable_inclusion_mode(&mut self, keys: &mut KeyManager) -> Result<(), MeshError> {
        if self.role != DeviceRole::Hub {
            return Err(MeshError::InvalidState(
                "only a hub can enter inclusion mode".to_string(),
            ));
        }
        if !keys.has_mesh_key() {
            let key = keys.generate_mesh_key();
            keys.install_mesh_key(key)?;
        }
        self.inclusion_mode = true;
        info!(node = %self.node_id, "inclusion mode enabled");
        Ok(())
    }

    /// Stop accepting new requests; sessions in progress continue
    pub fn disable_inclusion_mode(&mut self) {
        if self.inclusion_mode {
            info!(node = %self.node_id, "inclusion mode disabled");
        }
        self.inclusion_mode = false;
    }

    /// Start our own inclusion; returns the INCLUDE_REQUEST to broadcast
    pub fn request_inclusion(&mut self, now: u64, keys: &KeyManager) -> Result<Packet, MeshError> {
        if self.role != DeviceRole::Standard {
            return Err(MeshError::InvalidState("a hub cannot be included".to_string()));
        }
        if self.state == InclusionState::Included || keys.has_mesh_key() {
            return Err(MeshError::InvalidState("already included".to_string()));
        }
        if self.own.is_some() {
            return Err(MeshError::InvalidState("inclusion already in progress".to_string()));
        }

        let crypto = keys.crypto();
        let session = self.new_session(crypto, NodeId::BROADCAST, Step::AwaitingResponse, now);
        let packet = Packet::broadcast(self.node_id, Topic::IncludeRequest, offer(&session))?;

        self.own = Some(session);
        self.state = InclusionState::InclusionPending;
        info!(node = %self.node_id, "inclusion requested");
        Ok(packet)
    }

    /// Handle an inclusion-family frame
    ///
    /// Returns the reply to transmit, if any. An error means the frame was
    /// refused; if it belonged to a live session, that session has failed and
    /// an event was queued.
    pub fn handle(
        &mut self,
        packet: &Packet,
        now: u64,
        keys: &mut KeyManager,
    ) -> Result<Option<Packet>, InclusionError> {
        let addressed = packet.destination == self.node_id
            || (packet.is_broadcast() && packet.topic == Topic::IncludeRequest);
        if !addressed {
            return Err(InclusionError::Rejected("not addressed to this node".to_string()));
        }

        debug!(from = %packet.source, topic = %packet.topic, "inclusion frame");
        match packet.topic {
            Topic::IncludeRequest => self.on_request(packet, now, keys).map(Some),
            Topic::IncludeOpen => self.on_open(packet, now, keys).map(Some),
            Topic::IncludeSuccess => self.on_success(packet, keys).map(|_| None),
            Topic::IncludeResponse => self.on_response(packet, now, keys).map(Some),
            Topic::IncludeConfirm => self.on_confirm(packet, keys).map(Some),
            other => Err(InclusionError::OutOfSequence(other)),
        }
    }

    /// Fail every session whose deadline has passed
    pub fn check_timeouts(&mut self, now: u64) {
        let expired: Vec<NodeId> = self
            .sessions
            .iter()
            .filter(|(_, s)| now >= s.deadline)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in expired {
            self.fail_peer(peer, InclusionError::Timeout);
        }

        if self.own.as_ref().is_some_and(|s| now >= s.deadline) {
            self.fail_own(InclusionError::Timeout);
        }
    }

    /// Take queued terminal results
    pub fn drain_events(&mut self) -> Vec<InclusionEvent> {
        std::mem::take(&mut self.events)
    }

    // --- includer side ---

    fn on_request(
        &mut self,
        packet: &Packet,
        now: u64,
        keys: &mut KeyManager,
    ) -> Result<Packet, InclusionError> {
        let peer = packet.source;
        if self.role != DeviceRole::Hub {
            return Err(InclusionError::Rejected("not an includer".to_string()));
        }
        if !self.inclusion_mode {
            return Err(InclusionError::NotInInclusionMode);
        }
        if self.sessions.contains_key(&peer) {
            // Restarting mid-handshake could mix key material
            return Err(self.fail_peer(peer, InclusionError::OutOfSequence(Topic::IncludeRequest)));
        }
        if self.sessions.len() >= self.max_sessions {
            return Err(InclusionError::SessionLimit);
        }
        if !keys.has_mesh_key() {
            return Err(KeyError::Missing.into());
        }

        let (peer_public, peer_nonce) = parse_offer(&packet.payload)?;
        let crypto = keys.crypto();
        let mut session = self.new_session(crypto, peer, Step::AwaitingOpen, now);
        session.bootstrap = Some(self.derive_bootstrap(
            crypto,
            &session.key_pair,
            &peer_public,
            &peer_nonce,
            &session.nonce,
            peer,
            self.node_id,
        )?);

        let reply = self.build(peer, Topic::IncludeResponse, |_| Ok(offer(&session)))?;
        self.included.remove(&peer);
        self.sessions.insert(peer, session);
        info!(%peer, "inclusion request accepted");
        Ok(reply)
    }

    fn on_open(
        &mut self,
        packet: &Packet,
        now: u64,
        keys: &mut KeyManager,
    ) -> Result<Packet, InclusionError> {
        let peer = packet.source;
        self.expect_peer_step(peer, Step::AwaitingOpen, packet.topic)?;

        let result = self.accept_open(packet, keys);
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => return Err(self.fail_peer(peer, e)),
        };
        if let Some(session) = self.sessions.get_mut(&peer) {
            session.step = Step::AwaitingSuccess;
            session.deadline = now + self.timeout_ms;
        }
        debug!(%peer, "mesh key sent");
        Ok(reply)
    }

    fn accept_open(&self, packet: &Packet, keys: &KeyManager) -> Result<Packet, InclusionError> {
        let peer = packet.source;
        let session = self
            .sessions
            .get(&peer)
            .ok_or_else(|| InclusionError::Rejected("no session".to_string()))?;
        let bootstrap = session.bootstrap.as_ref().ok_or(CryptoError::InvalidKey)?;
        let crypto = keys.crypto();

        let claimed = crypto.open(bootstrap, &packet.associated_data(), &packet.payload)?;
        if claimed != peer.as_bytes() {
            return Err(InclusionError::Rejected("identity mismatch".to_string()));
        }

        let mesh_key = keys.current_mesh_key().ok_or(KeyError::Missing)?;
        self.build(peer, Topic::IncludeConfirm, |aad| {
            crypto.seal(bootstrap, aad, mesh_key.as_bytes())
        })
    }

    fn on_success(&mut self, packet: &Packet, keys: &KeyManager) -> Result<(), InclusionError> {
        let peer = packet.source;
        self.expect_peer_step(peer, Step::AwaitingSuccess, packet.topic)?;

        let verified = keys
            .current_mesh_key()
            .ok_or(InclusionError::Key(KeyError::Missing))
            .and_then(|key| Ok(keys.crypto().open(key, &packet.associated_data(), &packet.payload)?));
        match verified {
            Ok(claimed) if claimed == peer.as_bytes() => {
                self.sessions.remove(&peer);
                self.included.insert(peer);
                self.events.push(InclusionEvent::Included { peer });
                info!(%peer, "device included");
                Ok(())
            }
            Ok(_) => Err(self.fail_peer(peer, InclusionError::Rejected("identity mismatch".to_string()))),
            Err(e) => Err(self.fail_peer(peer, e)),
        }
    }

    fn expect_peer_step(&mut self, peer: NodeId, step: Step, topic: Topic) -> Result<(), InclusionError> {
        match self.sessions.get(&peer) {
            Some(session) if session.step == step => Ok(()),
            Some(_) => Err(self.fail_peer(peer, InclusionError::OutOfSequence(topic))),
            None => Err(InclusionError::Rejected(format!("no session with {peer}"))),
        }
    }

    // --- includee side ---

    fn on_response(
        &mut self,
        packet: &Packet,
        now: u64,
        keys: &KeyManager,
    ) -> Result<Packet, InclusionError> {
        let hub = packet.source;
        let step = self.own_step_for(hub, packet.topic)?;
        if step != Step::AwaitingResponse {
            return Err(self.fail_own(InclusionError::OutOfSequence(packet.topic)));
        }

        match self.accept_response(packet, keys) {
            Ok((bootstrap, reply)) => {
                if let Some(session) = self.own.as_mut() {
                    session.peer = hub;
                    session.bootstrap = Some(bootstrap);
                    session.step = Step::AwaitingConfirm;
                    session.deadline = now + self.timeout_ms;
                }
                debug!(%hub, "inclusion response accepted");
                Ok(reply)
            }
            Err(e) => Err(self.fail_own(e)),
        }
    }

    fn accept_response(&self, packet: &Packet, keys: &KeyManager) -> Result<(MeshKey, Packet), InclusionError> {
        let hub = packet.source;
        let session = self
            .own
            .as_ref()
            .ok_or_else(|| InclusionError::Rejected("no session".to_string()))?;
        let (hub_public, hub_nonce) = parse_offer(&packet.payload)?;
        let crypto = keys.crypto();

        let bootstrap = self.derive_bootstrap(
            crypto,
            &session.key_pair,
            &hub_public,
            &session.nonce,
            &hub_nonce,
            self.node_id,
            hub,
        )?;
        let me = *self.node_id.as_bytes();
        let reply = self.build(hub, Topic::IncludeOpen, |aad| crypto.seal(&bootstrap, aad, &me))?;
        Ok((bootstrap, reply))
    }

    fn on_confirm(&mut self, packet: &Packet, keys: &mut KeyManager) -> Result<Packet, InclusionError> {
        let hub = packet.source;
        let step = self.own_step_for(hub, packet.topic)?;
        if step != Step::AwaitingConfirm {
            return Err(self.fail_own(InclusionError::OutOfSequence(packet.topic)));
        }

        let mesh_key = match self.open_confirm(packet, keys) {
            Ok(key) => key,
            Err(e) => return Err(self.fail_own(e)),
        };
        if let Err(e) = keys.install_mesh_key(mesh_key) {
            return Err(self.fail_own(e.into()));
        }

        let me = *self.node_id.as_bytes();
        let reply = keys
            .current_mesh_key()
            .ok_or(InclusionError::Key(KeyError::Missing))
            .and_then(|key| self.build(hub, Topic::IncludeSuccess, |aad| keys.crypto().seal(key, aad, &me)));

        // The key is installed, so membership holds even if the reply cannot be built
        self.own = None;
        self.state = InclusionState::Included;
        self.events.push(InclusionEvent::Included { peer: hub });
        info!(%hub, "included in mesh");
        reply
    }

    fn open_confirm(&self, packet: &Packet, keys: &KeyManager) -> Result<MeshKey, InclusionError> {
        let bootstrap = self
            .own
            .as_ref()
            .and_then(|s| s.bootstrap.as_ref())
            .ok_or(CryptoError::InvalidKey)?;
        let raw = keys
            .crypto()
            .open(bootstrap, &packet.associated_data(), &packet.payload)?;
        Ok(MeshKey::from_slice(&raw)?)
    }

    fn own_step_for(&self, hub: NodeId, topic: Topic) -> Result<Step, InclusionError> {
        match &self.own {
            Some(session) if session.peer.is_broadcast() || session.peer == hub => Ok(session.step),
            Some(_) => Err(InclusionError::Rejected(format!("{hub} is not our includer"))),
            None => Err(InclusionError::OutOfSequence(topic)),
        }
    }

    // --- shared ---

    fn new_session(&self, crypto: &dyn CryptoProvider, peer: NodeId, step: Step, now: u64) -> Session {
        let mut nonce = [0u8; NONCE_LEN];
        crypto.random_bytes(&mut nonce);
        Session {
            peer,
            step,
            deadline: now + self.timeout_ms,
            key_pair: crypto.generate_key_pair(),
            nonce,
            bootstrap: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn derive_bootstrap(
        &self,
        crypto: &dyn CryptoProvider,
        own: &AgreementKeyPair,
        peer_public: &[u8; KEY_LEN],
        request_nonce: &[u8; NONCE_LEN],
        response_nonce: &[u8; NONCE_LEN],
        includee: NodeId,
        includer: NodeId,
    ) -> Result<MeshKey, CryptoError> {
        let mut salt = Vec::with_capacity(2 * NONCE_LEN + 32);
        salt.extend_from_slice(request_nonce);
        salt.extend_from_slice(response_nonce);
        if let Some(secret) = &self.secret {
            salt.extend_from_slice(secret);
        }

        let mut info = Vec::with_capacity(KDF_LABEL.len() + 8);
        info.extend_from_slice(KDF_LABEL);
        info.extend_from_slice(includee.as_bytes());
        info.extend_from_slice(includer.as_bytes());

        crypto.derive_shared_key(own, peer_public, &salt, &info)
    }

    /// Build a unicast frame whose payload is computed from its own header
    fn build<F>(&self, destination: NodeId, topic: Topic, payload: F) -> Result<Packet, InclusionError>
    where
        F: FnOnce(&[u8]) -> Result<Vec<u8>, CryptoError>,
    {
        let mut packet = Packet::new(self.node_id, destination, topic, Vec::new())
            .map_err(|e| InclusionError::Rejected(e.to_string()))?;
        packet.payload = payload(&packet.associated_data())?;
        Ok(packet)
    }

    fn fail_peer(&mut self, peer: NodeId, reason: InclusionError) -> InclusionError {
        if let Some(session) = self.sessions.remove(&peer) {
            warn!(%peer, %reason, step = ?session.step, "inclusion failed");
            self.events.push(InclusionEvent::Failed {
                peer,
                reason: reason.clone(),
            });
        }
        reason
    }

    fn fail_own(&mut self, reason: InclusionError) -> InclusionError {
        if let Some(session) = self.own.take() {
            warn!(peer = %session.peer, %reason, "inclusion failed");
            self.state = InclusionState::NotIncluded;
            self.events.push(InclusionEvent::Failed {
                peer: session.peer,
                reason: reason.clone(),
            });
        }
        reason
    }
}

fn offer(session: &Session) -> Vec<u8> {
    let mut payload = Vec::with_capacity(OFFER_LEN);
    payload.extend_from_slice(session.key_pair.public());
    payload.extend_from_slice(&session.nonce);
    payload
}

fn parse_offer(payload: &[u8]) -> Result<([u8; KEY_LEN], [u8; NONCE_LEN]), InclusionError> {
    if payload.len() != OFFER_LEN {
        return Err(InclusionError::Rejected(format!(
            "offer must be {OFFER_LEN} bytes, got {}",
            payload.len()
        )));
    }
    let mut public = [0u8; KEY_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    public.copy_from_slice(&payload[..KEY_LEN]);
    nonce.copy_from_slice(&payload[KEY_LEN..]);
    Ok((public, nonce))
}
