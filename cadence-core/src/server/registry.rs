//! Registry of active flows
//!
//! The listener inserts a peer when it accepts a flow; the flow's
//! [`Registration`] removes it again when the flow thread finishes, however
//! the receive loop ended.

use crate::config::Protocol;
use cadence_transport::Timestamp;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

/// An active flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowEntry {
    pub protocol: Protocol,
    pub accepted: Timestamp,
}

#[derive(Debug, Clone, Default)]
pub struct FlowRegistry {
    flows: Arc<Mutex<HashMap<SocketAddr, FlowEntry>>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddr, FlowEntry>> {
        // A panicking flow thread leaves the map itself consistent
        self.flows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert `peer`, or `None` if it already has an active flow
    pub fn register(&self, peer: SocketAddr, protocol: Protocol) -> Option<Registration> {
        let mut flows = self.lock();
        if flows.contains_key(&peer) {
            return None;
        }
        flows.insert(peer, FlowEntry { protocol, accepted: Timestamp::now() });
        Some(Registration { registry: self.clone(), peer })
    }

    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.lock().contains_key(peer)
    }

    pub fn get(&self, peer: &SocketAddr) -> Option<FlowEntry> {
        self.lock().get(peer).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.lock().keys().copied().collect()
    }

    fn remove(&self, peer: &SocketAddr) {
        self.lock().remove(peer);
    }
}

/// Membership of one flow; dropping it removes the peer
#[derive(Debug)]
pub struct Registration {
    registry: FlowRegistry,
    peer: SocketAddr,
}

impl Registration {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(&self.peer);
        tracing::debug!("Flow from {} removed from registry", self.peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_register_and_drop() {
        let registry = FlowRegistry::new();
        let reg = registry.register(addr(1000), Protocol::Udp).unwrap();
        assert!(registry.contains(&addr(1000)));
        assert_eq!(reg.peer(), addr(1000));
        assert_eq!(registry.get(&addr(1000)).map(|e| e.protocol), Some(Protocol::Udp));

        drop(reg);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_peer_rejected() {
        let registry = FlowRegistry::new();
        let _first = registry.register(addr(1000), Protocol::Udp).unwrap();
        assert!(registry.register(addr(1000), Protocol::Udp).is_none());
        let _second = registry.register(addr(1001), Protocol::Tcp).unwrap();
        assert_eq!(registry.len(), 2);
        let mut peers = registry.peers();
        peers.sort();
        assert_eq!(peers, vec![addr(1000), addr(1001)]);
    }

    #[test]
    fn test_registration_released_across_threads() {
        let registry = FlowRegistry::new();
        let reg = registry.register(addr(2000), Protocol::Udp).unwrap();
        std::thread::spawn(move || drop(reg)).join().unwrap();
        assert!(!registry.contains(&addr(2000)));
        assert!(registry.register(addr(2000), Protocol::Udp).is_some());
    }
}
