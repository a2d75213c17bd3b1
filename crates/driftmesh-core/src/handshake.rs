//! Two-party handshake manager and secure-link store
//!
//! Establishes symmetric channels between peers with a three-message
//! XX-style pattern:
//!
//! | Step | Initiator sends | Responder sends |
//! |------|-----------------|-----------------|
//! | 1    | ephemeral pub   | —               |
//! | 2    | —               | ephemeral pub + encrypted static |
//! | 3    | encrypted static| —               |
//!
//! Each message mixes the remote material into the running hash and
//! chaining key; on completion the chaining key splits into one transport
//! key per direction. The Noise machinery comes from [`crate::crypto`];
//! this module owns the session state machine, the link store, key
//! pinning, and the rekey sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::config::HandshakeConfig;
use crate::crypto::{NoiseHandshake, NoiseKeyPair, NoiseTransport};
use crate::errors::{HandshakeError, MeshError, Result};
use crate::types::NodeHash;

// ----------------------------------------------------------------------------
// Wire Form
// ----------------------------------------------------------------------------

/// Handshake step carried in the first payload byte
pub const STEP_INITIATOR_EPHEMERAL: u8 = 1;
pub const STEP_RESPONDER_EXCHANGE: u8 = 2;
pub const STEP_INITIATOR_STATIC: u8 = 3;

/// One handshake message ready to travel as a `Handshake` packet payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub step: u8,
    pub payload: Vec<u8>,
}

impl HandshakeMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + self.payload.len());
        bytes.push(self.step);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(MeshError::malformed("empty handshake message"));
        }
        Ok(Self {
            step: bytes[0],
            payload: bytes[1..].to_vec(),
        })
    }
}

// ----------------------------------------------------------------------------
// Session State
// ----------------------------------------------------------------------------

/// Session role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

/// Phases of the three-message exchange
///
/// The initiator walks the chain after sending its ephemeral; the
/// responder mirrors it from the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Initialized,
    WaitingForE,
    WaitingForSe,
    WaitingForS,
    Established,
}

/// Clonable outcome delivered to handshake waiters
#[derive(Debug, Clone)]
enum HandshakeOutcome {
    Established,
    Failed(String),
}

struct HandshakeSession {
    role: HandshakeRole,
    phase: SessionPhase,
    handshake: Option<NoiseHandshake>,
    expected_public_key: Option<[u8; 32]>,
    created_at: Instant,
    waiters: Vec<oneshot::Sender<HandshakeOutcome>>,
}

impl HandshakeSession {
    fn fail(mut self, reason: &str) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(HandshakeOutcome::Failed(reason.to_string()));
        }
    }

    fn complete(mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(HandshakeOutcome::Established);
        }
    }
}

// ----------------------------------------------------------------------------
// Secure Link
// ----------------------------------------------------------------------------

/// Established symmetric channel with one peer
///
/// The cipher state is serialised behind a mutex, which keeps the nonce
/// sequence strictly increasing per direction even under concurrent
/// callers.
pub struct SecureLink {
    peer: NodeHash,
    remote_public_key: [u8; 32],
    transport: Mutex<NoiseTransport>,
    established_at: Instant,
    message_count: AtomicU64,
}

impl SecureLink {
    pub fn peer(&self) -> NodeHash {
        self.peer
    }

    pub fn remote_public_key(&self) -> [u8; 32] {
        self.remote_public_key
    }

    pub fn established_at(&self) -> Instant {
        self.established_at
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    /// Encrypt application bytes for this peer
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut transport = self
            .transport
            .lock()
            .map_err(|_| MeshError::malformed("secure link cipher state poisoned"))?;
        let ciphertext = transport.encrypt(plaintext)?;
        self.message_count.fetch_add(1, Ordering::Relaxed);
        Ok(ciphertext)
    }

    /// Decrypt and authenticate bytes from this peer
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut transport = self
            .transport
            .lock()
            .map_err(|_| MeshError::malformed("secure link cipher state poisoned"))?;
        let plaintext = transport.decrypt(ciphertext)?;
        self.message_count.fetch_add(1, Ordering::Relaxed);
        Ok(plaintext)
    }

    /// A link past its maximum age must not carry traffic
    pub fn is_healthy(&self, config: &HandshakeConfig) -> bool {
        self.established_at.elapsed() < config.max_link_age
    }

    /// Whether the rekey policy demands a fresh handshake
    pub fn needs_rekey(&self, config: &HandshakeConfig) -> bool {
        self.established_at.elapsed() >= config.rekey_after
            || self.message_count() >= config.rekey_after_messages
    }
}

impl core::fmt::Debug for SecureLink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SecureLink")
            .field("peer", &self.peer)
            .field("message_count", &self.message_count())
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Handshake Manager
// ----------------------------------------------------------------------------

struct ManagerState {
    sessions: HashMap<NodeHash, HandshakeSession>,
    links: HashMap<NodeHash, Arc<SecureLink>>,
}

/// Drives handshake sessions and owns the secure-link store
pub struct HandshakeManager {
    static_key: NoiseKeyPair,
    config: HandshakeConfig,
    state: Mutex<ManagerState>,
    rekey_tx: broadcast::Sender<NodeHash>,
}

impl HandshakeManager {
    pub fn new(static_key: NoiseKeyPair, config: HandshakeConfig) -> Self {
        let (rekey_tx, _) = broadcast::channel(32);
        Self {
            static_key,
            config,
            state: Mutex::new(ManagerState {
                sessions: HashMap::new(),
                links: HashMap::new(),
            }),
            rekey_tx,
        }
    }

    /// Our static public key, advertised in announces
    pub fn public_key(&self) -> [u8; 32] {
        self.static_key.public_key_bytes()
    }

    /// Subscribe to rekey-required signals from the background sweep
    pub fn subscribe_rekey(&self) -> broadcast::Receiver<NodeHash> {
        self.rekey_tx.subscribe()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ManagerState>> {
        self.state
            .lock()
            .map_err(|_| MeshError::malformed("handshake manager state poisoned"))
    }

    /// Begin (or join) a handshake with `peer`
    ///
    /// Returns the first message to transmit when a new session was
    /// opened, or `None` when a healthy link already exists or another
    /// handshake is in flight. Callers then await completion via
    /// [`wait_established`](Self::wait_established), which enforces the
    /// overall timeout.
    pub fn initiate_handshake(
        &self,
        peer: NodeHash,
        expected_public_key: Option<[u8; 32]>,
    ) -> Result<Option<HandshakeMessage>> {
        let mut state = self.lock()?;

        if let Some(link) = state.links.get(&peer) {
            if link.is_healthy(&self.config) {
                debug!(peer = %peer, "healthy link already established");
                return Ok(None);
            }
            // Expired link is replaced by the new handshake
            state.links.remove(&peer);
        }

        if state.sessions.contains_key(&peer) {
            debug!(peer = %peer, "handshake already in flight, joining");
            return Ok(None);
        }

        let mut handshake = NoiseHandshake::initiator(&self.static_key)?;
        let payload = handshake.write_message(&[])?;

        state.sessions.insert(
            peer,
            HandshakeSession {
                role: HandshakeRole::Initiator,
                phase: SessionPhase::WaitingForE,
                handshake: Some(handshake),
                expected_public_key,
                created_at: Instant::now(),
                waiters: Vec::new(),
            },
        );
        info!(peer = %peer, "handshake initiated");

        Ok(Some(HandshakeMessage {
            step: STEP_INITIATOR_EPHEMERAL,
            payload,
        }))
    }

    /// Await an in-flight handshake under the configured 30 s deadline
    ///
    /// On timeout the session is torn down and no partial link remains.
    pub async fn wait_established(&self, peer: NodeHash) -> Result<Arc<SecureLink>> {
        let rx = {
            let mut state = self.lock()?;
            if let Some(link) = state.links.get(&peer) {
                if link.is_healthy(&self.config) {
                    return Ok(Arc::clone(link));
                }
            }
            let session = state.sessions.get_mut(&peer).ok_or_else(|| {
                MeshError::Handshake(HandshakeError::LinkNotFound {
                    peer: peer.to_string(),
                })
            })?;
            let (tx, rx) = oneshot::channel();
            session.waiters.push(tx);
            rx
        };

        let outcome = tokio::time::timeout(self.config.handshake_timeout, rx).await;
        match outcome {
            Ok(Ok(HandshakeOutcome::Established)) => self.get_link(&peer)?.ok_or_else(|| {
                MeshError::Handshake(HandshakeError::LinkNotFound {
                    peer: peer.to_string(),
                })
            }),
            Ok(Ok(HandshakeOutcome::Failed(reason))) => {
                Err(MeshError::Handshake(HandshakeError::AuthenticationFailed {
                    peer: format!("{peer}: {reason}"),
                }))
            }
            Ok(Err(_)) | Err(_) => {
                // Deadline passed or the session was dropped underneath us
                if let Ok(mut state) = self.lock() {
                    if let Some(session) = state.sessions.remove(&peer) {
                        session.fail("timed out");
                    }
                }
                warn!(peer = %peer, "handshake timed out");
                Err(MeshError::Handshake(HandshakeError::Timeout {
                    peer: peer.to_string(),
                    timeout_secs: self.config.handshake_timeout.as_secs(),
                }))
            }
        }
    }

    /// Process an inbound handshake message
    ///
    /// Returns the response message to transmit, when the protocol calls
    /// for one (step 1 yields step 2; step 2 yields step 3).
    pub fn handle_incoming_handshake(
        &self,
        peer: NodeHash,
        message: HandshakeMessage,
    ) -> Result<Option<HandshakeMessage>> {
        match message.step {
            STEP_INITIATOR_EPHEMERAL => self.handle_step1(peer, &message.payload),
            STEP_RESPONDER_EXCHANGE => self.handle_step2(peer, &message.payload),
            STEP_INITIATOR_STATIC => self.handle_step3(peer, &message.payload),
            step => Err(MeshError::malformed(format!(
                "unknown handshake step {step}"
            ))),
        }
    }

    fn handle_step1(&self, peer: NodeHash, payload: &[u8]) -> Result<Option<HandshakeMessage>> {
        let mut state = self.lock()?;

        // A crossed handshake (both sides initiating) resolves by letting
        // the fresh responder session replace our initiator attempt.
        if let Some(stale) = state.sessions.remove(&peer) {
            stale.fail("superseded by peer-initiated handshake");
        }

        let mut handshake = NoiseHandshake::responder(&self.static_key)?;
        handshake.read_message(payload)?;
        let response = handshake.write_message(&[])?;

        state.sessions.insert(
            peer,
            HandshakeSession {
                role: HandshakeRole::Responder,
                phase: SessionPhase::WaitingForS,
                handshake: Some(handshake),
                expected_public_key: None,
                created_at: Instant::now(),
                waiters: Vec::new(),
            },
        );
        debug!(peer = %peer, "responder session opened");

        Ok(Some(HandshakeMessage {
            step: STEP_RESPONDER_EXCHANGE,
            payload: response,
        }))
    }

    fn handle_step2(&self, peer: NodeHash, payload: &[u8]) -> Result<Option<HandshakeMessage>> {
        let mut state = self.lock()?;
        let mut session = state.sessions.remove(&peer).ok_or_else(|| {
            MeshError::Handshake(HandshakeError::InvalidState {
                peer: peer.to_string(),
                expected: "initiator awaiting responder exchange".into(),
                actual: "no session".into(),
            })
        })?;

        if session.role != HandshakeRole::Initiator {
            session.fail("protocol confusion");
            return Err(MeshError::Handshake(HandshakeError::InvalidState {
                peer: peer.to_string(),
                expected: "initiator".into(),
                actual: "responder".into(),
            }));
        }

        let mut handshake = match session.handshake.take() {
            Some(h) => h,
            None => {
                session.fail("missing handshake state");
                return Err(MeshError::Handshake(HandshakeError::InvalidState {
                    peer: peer.to_string(),
                    expected: "live handshake".into(),
                    actual: "consumed".into(),
                }));
            }
        };

        session.phase = SessionPhase::WaitingForSe;
        if let Err(err) = handshake.read_message(payload) {
            session.fail("cipher authentication failed");
            warn!(peer = %peer, cause = %err, "handshake message 2 rejected");
            return Err(MeshError::Handshake(HandshakeError::AuthenticationFailed {
                peer: peer.to_string(),
            }));
        }

        // The responder's static is now known; enforce pinning before we
        // reveal our own static in message 3.
        let remote_static = handshake.remote_static();
        if let (Some(expected), Some(actual)) = (session.expected_public_key, remote_static) {
            if expected != actual {
                session.fail("key pinning failed");
                warn!(peer = %peer, "key pinning mismatch");
                return Err(MeshError::Handshake(HandshakeError::PinningMismatch {
                    peer: peer.to_string(),
                }));
            }
        }

        session.phase = SessionPhase::WaitingForS;
        let final_message = match handshake.write_message(&[]) {
            Ok(m) => m,
            Err(err) => {
                session.fail("could not produce final message");
                return Err(err);
            }
        };

        let link = match Self::build_link(peer, handshake) {
            Ok(link) => link,
            Err(err) => {
                session.fail("link construction failed");
                return Err(err);
            }
        };
        state.links.insert(peer, Arc::new(link));
        session.phase = SessionPhase::Established;
        session.complete();
        info!(peer = %peer, "secure link established (initiator)");

        Ok(Some(HandshakeMessage {
            step: STEP_INITIATOR_STATIC,
            payload: final_message,
        }))
    }

    fn handle_step3(&self, peer: NodeHash, payload: &[u8]) -> Result<Option<HandshakeMessage>> {
        let mut state = self.lock()?;
        let mut session = state.sessions.remove(&peer).ok_or_else(|| {
            MeshError::Handshake(HandshakeError::InvalidState {
                peer: peer.to_string(),
                expected: "responder awaiting initiator static".into(),
                actual: "no session".into(),
            })
        })?;

        if session.role != HandshakeRole::Responder {
            session.fail("protocol confusion");
            return Err(MeshError::Handshake(HandshakeError::InvalidState {
                peer: peer.to_string(),
                expected: "responder".into(),
                actual: "initiator".into(),
            }));
        }

        let mut handshake = match session.handshake.take() {
            Some(h) => h,
            None => {
                session.fail("missing handshake state");
                return Err(MeshError::Handshake(HandshakeError::InvalidState {
                    peer: peer.to_string(),
                    expected: "live handshake".into(),
                    actual: "consumed".into(),
                }));
            }
        };

        if let Err(err) = handshake.read_message(payload) {
            session.fail("cipher authentication failed");
            warn!(peer = %peer, cause = %err, "handshake message 3 rejected");
            return Err(MeshError::Handshake(HandshakeError::AuthenticationFailed {
                peer: peer.to_string(),
            }));
        }

        let link = match Self::build_link(peer, handshake) {
            Ok(link) => link,
            Err(err) => {
                session.fail("link construction failed");
                return Err(err);
            }
        };
        state.links.insert(peer, Arc::new(link));
        session.phase = SessionPhase::Established;
        session.complete();
        info!(peer = %peer, "secure link established (responder)");

        Ok(None)
    }

    fn build_link(peer: NodeHash, handshake: NoiseHandshake) -> Result<SecureLink> {
        let remote_public_key = handshake.remote_static().ok_or_else(|| {
            MeshError::Handshake(HandshakeError::AuthenticationFailed {
                peer: peer.to_string(),
            })
        })?;
        let transport = handshake.into_transport()?;
        Ok(SecureLink {
            peer,
            remote_public_key,
            transport: Mutex::new(transport),
            established_at: Instant::now(),
            message_count: AtomicU64::new(0),
        })
    }

    /// Look up the established link with a peer
    pub fn get_link(&self, peer: &NodeHash) -> Result<Option<Arc<SecureLink>>> {
        let state = self.lock()?;
        Ok(state.links.get(peer).cloned())
    }

    /// Tear down the link with one peer
    pub fn close_link(&self, peer: &NodeHash) -> Result<bool> {
        let mut state = self.lock()?;
        let removed = state.links.remove(peer).is_some();
        if removed {
            info!(peer = %peer, "secure link closed");
        }
        Ok(removed)
    }

    /// Panic wipe: drop every link and abandon every in-flight session
    pub fn close_all_links(&self) -> Result<usize> {
        let mut state = self.lock()?;
        let count = state.links.len();
        state.links.clear();
        for (_, session) in state.sessions.drain() {
            session.fail("links wiped");
        }
        warn!(links = count, "all secure links wiped");
        Ok(count)
    }

    /// Peers with an established link
    pub fn get_connected_peers(&self) -> Result<Vec<NodeHash>> {
        let state = self.lock()?;
        Ok(state.links.keys().copied().collect())
    }

    /// One pass of the rekey sweep: expire dead links, signal stale ones
    ///
    /// Called from the background task spawned by the runtime glue at
    /// `rekey_check_interval`; callable directly in tests.
    pub fn rekey_sweep(&self) -> Result<Vec<NodeHash>> {
        let mut state = self.lock()?;

        state.links.retain(|peer, link| {
            let healthy = link.is_healthy(&self.config);
            if !healthy {
                info!(peer = %peer, "secure link expired");
            }
            healthy
        });

        // Sessions that outlived the handshake deadline are abandoned
        let deadline = self.config.handshake_timeout;
        let stale: Vec<NodeHash> = state
            .sessions
            .iter()
            .filter(|(_, s)| s.created_at.elapsed() > deadline)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in stale {
            if let Some(session) = state.sessions.remove(&peer) {
                session.fail("timed out");
            }
        }

        let due: Vec<NodeHash> = state
            .links
            .iter()
            .filter(|(_, link)| link.needs_rekey(&self.config))
            .map(|(peer, _)| *peer)
            .collect();
        for peer in &due {
            let _ = self.rekey_tx.send(*peer);
        }
        Ok(due)
    }

    /// Observable phase of an in-flight session, for diagnostics
    pub fn session_phase(&self, peer: &NodeHash) -> Result<Option<SessionPhase>> {
        let state = self.lock()?;
        Ok(state.sessions.get(peer).map(|s| s.phase))
    }

    /// Spawn the background rekey sweep
    ///
    /// Runs [`rekey_sweep`](Self::rekey_sweep) once per
    /// `rekey_check_interval` until the returned handle is aborted.
    pub fn spawn_rekey_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.rekey_check_interval);
            loop {
                ticker.tick().await;
                match manager.rekey_sweep() {
                    Ok(due) if !due.is_empty() => {
                        info!(count = due.len(), "links due for rekey");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "rekey sweep failed"),
                }
            }
        })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
