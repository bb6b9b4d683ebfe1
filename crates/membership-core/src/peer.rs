//! Peers and the peer registry.
//!
//! A [`Peer`] models one remote node: its outbound link, its liveness
//! deadlines, its headers and the protocol state attached to it. The
//! [`PeerRegistry`] is the only owner of peers; handlers look them up by
//! endpoint for the duration of a callback.
//!
//! Removal is two-phase. `retire()` disconnects a peer and stamps it, and
//! `purge_retired()` forgets it once the grace period has passed.

use crate::Endpoint;
use crate::state::NodeState;
use crate::transport::{Link, Transport, TransportError};
use crate::versioned::VersionedMap;
use std::collections::HashMap;
use tracing::{debug, warn};

/// One remote node.
pub struct Peer {
    endpoint: Endpoint,
    link: Option<Box<dyn Link>>,
    evasive_at: u64,
    expired_at: u64,
    /// The remote side has talked to us at least once
    ready: bool,
    /// Frames sent over the current link
    sequence: u64,
    headers: VersionedMap,
    attached: Option<NodeState>,
    retired_at: Option<u64>,
}

impl Peer {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            link: None,
            evasive_at: 0,
            expired_at: 0,
            ready: false,
            sequence: 0,
            headers: VersionedMap::new(),
            attached: None,
            retired_at: None,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Open the outbound link. No-op when already connected.
    ///
    /// A transport failure leaves the peer disconnected; the next send
    /// simply fails.
    pub fn connect(&mut self, transport: &mut dyn Transport, reply_to: Endpoint, send_hwm: usize) {
        if self.link.is_some() {
            return;
        }
        match transport.connect(self.endpoint, reply_to, send_hwm) {
            Ok(link) => {
                debug!("Connected link to {}", self.endpoint);
                self.link = Some(link);
                self.sequence = 0;
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", self.endpoint, e);
            }
        }
    }

    /// Drop the outbound link. Idempotent.
    pub fn disconnect(&mut self) {
        if self.link.take().is_some() {
            debug!("Disconnected link to {}", self.endpoint);
        }
        self.ready = false;
    }

    /// Queue a frame without blocking.
    pub fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        let link = self.link.as_ref().ok_or(TransportError::NotConnected)?;
        link.send(frame)?;
        self.sequence += 1;
        Ok(())
    }

    /// Push both liveness deadlines forward from `now_ms`.
    pub fn refresh(&mut self, now_ms: u64, evasive_ms: u64, expired_ms: u64) {
        self.evasive_at = now_ms + evasive_ms;
        self.expired_at = now_ms + expired_ms;
    }

    pub fn evasive_at(&self) -> u64 {
        self.evasive_at
    }

    pub fn expired_at(&self) -> u64 {
        self.expired_at
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn set_ready(&mut self) {
        self.ready = true;
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn headers(&self) -> &VersionedMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut VersionedMap {
        &mut self.headers
    }

    /// Attach protocol state, replacing any previous one.
    pub fn attach(&mut self, state: NodeState) {
        self.attached = Some(state);
    }

    pub fn attached(&self) -> Option<&NodeState> {
        self.attached.as_ref()
    }

    pub fn attached_mut(&mut self) -> Option<&mut NodeState> {
        self.attached.as_mut()
    }

    pub fn is_retired(&self) -> bool {
        self.retired_at.is_some()
    }

    pub fn retired_at(&self) -> Option<u64> {
        self.retired_at
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .field("evasive_at", &self.evasive_at)
            .field("expired_at", &self.expired_at)
            .field("attached", &self.attached)
            .field("retired_at", &self.retired_at)
            .finish()
    }
}

/// Endpoint → peer table owned by the agent.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<Endpoint, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the peer for `endpoint`, creating it if absent.
    pub fn create(&mut self, endpoint: Endpoint) -> &mut Peer {
        self.peers
            .entry(endpoint)
            .or_insert_with(|| Peer::new(endpoint))
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<&Peer> {
        self.peers.get(endpoint)
    }

    pub fn get_mut(&mut self, endpoint: &Endpoint) -> Option<&mut Peer> {
        self.peers.get_mut(endpoint)
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.peers.contains_key(endpoint)
    }

    pub fn is_retired(&self, endpoint: &Endpoint) -> bool {
        self.peers.get(endpoint).is_some_and(Peer::is_retired)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Peers not waiting out their grace period.
    pub fn active(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values().filter(|p| !p.is_retired())
    }

    /// Endpoints of active peers that carry protocol state.
    pub fn attached_endpoints(&self) -> Vec<Endpoint> {
        self.active()
            .filter(|p| p.attached.is_some())
            .map(|p| p.endpoint)
            .collect()
    }

    /// Disconnect a peer and start its grace period.
    ///
    /// Returns false if the peer is unknown or already retired.
    pub fn retire(&mut self, endpoint: &Endpoint, now_ms: u64) -> bool {
        match self.peers.get_mut(endpoint) {
            Some(peer) if !peer.is_retired() => {
                peer.disconnect();
                peer.retired_at = Some(now_ms);
                true
            }
            _ => false,
        }
    }

    /// Forget retired peers whose grace period has elapsed.
    pub fn purge_retired(&mut self, now_ms: u64, grace_ms: u64) -> Vec<Endpoint> {
        let expired: Vec<Endpoint> = self
            .peers
            .values()
            .filter(|p| {
                p.retired_at
                    .is_some_and(|at| now_ms.saturating_sub(at) > grace_ms)
            })
            .map(|p| p.endpoint)
            .collect();

        for endpoint in &expired {
            self.peers.remove(endpoint);
        }
        expired
    }

    /// Disconnect and drop a peer immediately.
    pub fn remove(&mut self, endpoint: &Endpoint) -> Option<Peer> {
        let mut peer = self.peers.remove(endpoint)?;
        peer.disconnect();
        Some(peer)
    }

    /// Disconnect and drop every peer.
    pub fn clear(&mut self) {
        for peer in self.peers.values_mut() {
            peer.disconnect();
        }
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;

    fn addr(port: u16) -> Endpoint {
        Endpoint::from(([127, 0, 0, 1], port))
    }

    // ==================== Peer ====================

    #[test]
    fn test_connect_is_idempotent() {
        let network = MemoryNetwork::new();
        let mut transport = network.bind(addr(1));
        network.bind(addr(2));
        let mut peer = Peer::new(addr(2));

        peer.connect(&mut transport, addr(1), 10);
        peer.send(vec![1]).unwrap();
        peer.connect(&mut transport, addr(1), 10);

        assert!(peer.is_connected());
        assert_eq!(peer.sequence(), 1);
    }

    #[test]
    fn test_send_without_link_fails() {
        let mut peer = Peer::new(addr(2));
        assert!(matches!(
            peer.send(vec![1]),
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let network = MemoryNetwork::new();
        let mut transport = network.bind(addr(1));
        let mut peer = Peer::new(addr(2));
        peer.connect(&mut transport, addr(1), 10);
        peer.set_ready();

        peer.disconnect();
        peer.disconnect();

        assert!(!peer.is_connected());
        assert!(!peer.is_ready());
    }

    #[test]
    fn test_refresh_slides_deadlines() {
        let mut peer = Peer::new(addr(2));
        peer.refresh(1_000, 5_000, 10_000);
        assert_eq!(peer.evasive_at(), 6_000);
        assert_eq!(peer.expired_at(), 11_000);

        peer.refresh(3_000, 5_000, 10_000);
        assert_eq!(peer.evasive_at(), 8_000);
        assert_eq!(peer.expired_at(), 13_000);
    }

    // ==================== Registry ====================

    #[test]
    fn test_create_returns_existing_peer() {
        let mut registry = PeerRegistry::new();
        registry.create(addr(2)).set_ready();

        assert!(registry.create(addr(2)).is_ready());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_retire_then_purge_after_grace() {
        let network = MemoryNetwork::new();
        let mut transport = network.bind(addr(1));
        let mut registry = PeerRegistry::new();
        registry
            .create(addr(2))
            .connect(&mut transport, addr(1), 10);

        assert!(registry.retire(&addr(2), 1_000));
        assert!(!registry.retire(&addr(2), 1_500));
        assert!(registry.is_retired(&addr(2)));
        assert!(!registry.get(&addr(2)).unwrap().is_connected());
        assert_eq!(registry.active().count(), 0);

        assert!(registry.purge_retired(11_000, 10_000).is_empty());
        assert_eq!(registry.purge_retired(11_001, 10_000), vec![addr(2)]);
        assert!(!registry.contains(&addr(2)));
    }

    #[test]
    fn test_attached_endpoints_skip_retired() {
        let mut registry = PeerRegistry::new();
        registry.create(addr(2)).attach(NodeState::new(addr(2), 1, 1));
        registry.create(addr(3)).attach(NodeState::new(addr(3), 1, 1));
        registry.create(addr(4));
        registry.retire(&addr(3), 0);

        assert_eq!(registry.attached_endpoints(), vec![addr(2)]);
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut registry = PeerRegistry::new();
        registry.create(addr(2));
        registry.create(addr(3));
        registry.clear();
        assert!(registry.is_empty());
    }
}
