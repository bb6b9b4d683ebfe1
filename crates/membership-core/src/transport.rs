//! Transport abstraction for agent-to-agent traffic.
//!
//! Implementations:
//! - WebSocket links (membership-daemon)
//! - `MemoryNetwork`: in-process queues for deterministic tests
//!
//! Sends never block. A link that already holds `send_hwm` queued frames
//! rejects further frames with [`TransportError::WouldBlock`].

use crate::Endpoint;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send queue full")]
    WouldBlock,

    #[error("Link closed")]
    Disconnected,

    #[error("Not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A frame received from a remote agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Address announced by the sender's handshake
    pub from: Endpoint,
    pub frame: Vec<u8>,
}

/// Outbound point-to-point handle to one remote agent.
///
/// Dropping the link tears it down.
pub trait Link: Send {
    fn send(&self, frame: Vec<u8>) -> Result<()>;
}

/// Factory for outbound links.
pub trait Transport: Send {
    /// Open a link to `endpoint`, announcing `reply_to` as our address.
    fn connect(
        &mut self,
        endpoint: Endpoint,
        reply_to: Endpoint,
        send_hwm: usize,
    ) -> Result<Box<dyn Link>>;
}

#[derive(Debug, Default)]
struct NetworkState {
    inboxes: HashMap<Endpoint, VecDeque<Delivery>>,
    down: HashSet<Endpoint>,
}

/// Shared in-process network. Clones refer to the same network.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an inbox for `endpoint` and a transport that sends from it.
    pub fn bind(&self, endpoint: Endpoint) -> MemoryTransport {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.inboxes.entry(endpoint).or_default();
        state.down.remove(&endpoint);
        MemoryTransport {
            network: self.clone(),
        }
    }

    /// Take every frame queued for `endpoint`.
    pub fn drain(&self, endpoint: Endpoint) -> Vec<Delivery> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .inboxes
            .get_mut(&endpoint)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    /// Mark an endpoint unreachable. Frames sent to it are lost and its
    /// pending inbox is discarded.
    pub fn set_down(&self, endpoint: Endpoint, down: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if down {
            state.down.insert(endpoint);
            if let Some(queue) = state.inboxes.get_mut(&endpoint) {
                queue.clear();
            }
        } else {
            state.down.remove(&endpoint);
        }
    }

    pub fn pending(&self, endpoint: Endpoint) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.inboxes.get(&endpoint).map(|q| q.len()).unwrap_or(0)
    }
}

/// Transport half of a [`MemoryNetwork`] binding.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
}

impl Transport for MemoryTransport {
    fn connect(
        &mut self,
        endpoint: Endpoint,
        reply_to: Endpoint,
        send_hwm: usize,
    ) -> Result<Box<dyn Link>> {
        Ok(Box::new(MemoryLink {
            network: self.network.clone(),
            to: endpoint,
            from: reply_to,
            send_hwm,
        }))
    }
}

struct MemoryLink {
    network: MemoryNetwork,
    to: Endpoint,
    from: Endpoint,
    send_hwm: usize,
}

impl Link for MemoryLink {
    fn send(&self, frame: Vec<u8>) -> Result<()> {
        let mut state = self.network.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.down.contains(&self.to) {
            return Ok(());
        }
        // Unbound endpoints swallow frames, like a socket nobody listens on.
        let Some(queue) = state.inboxes.get_mut(&self.to) else {
            return Ok(());
        };
        if queue.len() >= self.send_hwm {
            return Err(TransportError::WouldBlock);
        }
        queue.push_back(Delivery {
            from: self.from,
            frame,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Endpoint {
        Endpoint::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_frames_are_tagged_with_reply_address() {
        let network = MemoryNetwork::new();
        let mut a = network.bind(addr(1));
        network.bind(addr(2));

        let link = a.connect(addr(2), addr(1), 10).unwrap();
        link.send(b"hi".to_vec()).unwrap();

        let delivered = network.drain(addr(2));
        assert_eq!(
            delivered,
            vec![Delivery {
                from: addr(1),
                frame: b"hi".to_vec()
            }]
        );
        assert!(network.drain(addr(2)).is_empty());
    }

    #[test]
    fn test_high_water_mark_rejects_sends() {
        let network = MemoryNetwork::new();
        let mut a = network.bind(addr(1));
        network.bind(addr(2));

        let link = a.connect(addr(2), addr(1), 2).unwrap();
        link.send(vec![1]).unwrap();
        link.send(vec![2]).unwrap();

        assert!(matches!(link.send(vec![3]), Err(TransportError::WouldBlock)));
        assert_eq!(network.pending(addr(2)), 2);
    }

    #[test]
    fn test_down_endpoint_loses_frames() {
        let network = MemoryNetwork::new();
        let mut a = network.bind(addr(1));
        network.bind(addr(2));
        let link = a.connect(addr(2), addr(1), 10).unwrap();

        network.set_down(addr(2), true);
        link.send(vec![1]).unwrap();
        assert_eq!(network.pending(addr(2)), 0);

        network.set_down(addr(2), false);
        link.send(vec![2]).unwrap();
        assert_eq!(network.pending(addr(2)), 1);
    }

    #[test]
    fn test_unbound_endpoint_swallows_frames() {
        let network = MemoryNetwork::new();
        let mut a = network.bind(addr(1));
        let link = a.connect(addr(9), addr(1), 10).unwrap();

        assert!(link.send(vec![1]).is_ok());
        assert!(network.drain(addr(9)).is_empty());
    }
}
