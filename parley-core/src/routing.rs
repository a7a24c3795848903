//! Routing collaborator seam: locate peers, move opaque datagrams.
//!
//! The engine never does I/O itself. A `Router` resolves public keys to network locations and
//! carries envelopes; DHT, onion routing and NAT traversal live behind this trait.
//! `MemoryNetwork` is an in-process implementation for tests and local demos.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::identity::PublicKey;

/// Where a peer can currently be reached.
pub type NetworkLocation = SocketAddr;

pub trait Router {
    /// Current location of the peer owning `public_key`.
    fn resolve(&mut self, public_key: &PublicKey) -> Result<NetworkLocation, RouteError>;

    /// Best-effort, non-blocking send of one datagram.
    fn send_packet(&mut self, to: NetworkLocation, packet: &[u8]) -> Result<(), RouteError>;

    /// Drain datagrams received since the last poll.
    fn poll_inbound(&mut self) -> Vec<(NetworkLocation, Vec<u8>)>;

    /// Seed a known node (bootstrap or persisted hint).
    fn add_node(&mut self, public_key: PublicKey, location: NetworkLocation);

    /// Whether the router currently has a working path to the network.
    fn is_connected(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("peer not found")]
    NotFound,
    #[error("destination unreachable: {0}")]
    Unreachable(NetworkLocation),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// In-process network shared by several `MemoryRouter`s. Cloning shares the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Hub>>,
}

#[derive(Default)]
struct Hub {
    directory: HashMap<PublicKey, NetworkLocation>,
    queues: HashMap<NetworkLocation, VecDeque<(NetworkLocation, Vec<u8>)>>,
    /// Locations whose traffic is silently lost in both directions.
    cut: HashSet<NetworkLocation>,
    next_port: u16,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a node and publish its key in the directory.
    pub fn join(&self, public_key: PublicKey) -> MemoryRouter {
        let router = self.join_unlisted(public_key);
        self.hub().directory.insert(public_key, router.location);
        router
    }

    /// Attach a node without publishing it; `resolve` for its key fails with `NotFound`.
    pub fn join_unlisted(&self, public_key: PublicKey) -> MemoryRouter {
        let mut hub = self.hub();
        hub.next_port = hub.next_port.wrapping_add(1);
        let location = SocketAddr::from((Ipv4Addr::LOCALHOST, 30000 + hub.next_port));
        hub.queues.insert(location, VecDeque::new());
        MemoryRouter {
            network: self.clone(),
            public_key,
            location,
        }
    }

    /// Cut or restore a node's connectivity.
    pub fn set_reachable(&self, location: NetworkLocation, reachable: bool) {
        let mut hub = self.hub();
        if reachable {
            hub.cut.remove(&location);
        } else {
            hub.cut.insert(location);
        }
    }

    /// Deliver raw bytes to `to` as if sent from `from`.
    pub fn inject(&self, from: NetworkLocation, to: NetworkLocation, bytes: Vec<u8>) {
        if let Some(queue) = self.hub().queues.get_mut(&to) {
            queue.push_back((from, bytes));
        }
    }

    /// Number of datagrams waiting for `location`.
    pub fn pending(&self, location: NetworkLocation) -> usize {
        self.hub().queues.get(&location).map_or(0, VecDeque::len)
    }
}

/// One node's handle on a `MemoryNetwork`.
pub struct MemoryRouter {
    network: MemoryNetwork,
    public_key: PublicKey,
    location: NetworkLocation,
}

impl MemoryRouter {
    pub fn location(&self) -> NetworkLocation {
        self.location
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl Router for MemoryRouter {
    fn resolve(&mut self, public_key: &PublicKey) -> Result<NetworkLocation, RouteError> {
        self.network
            .hub()
            .directory
            .get(public_key)
            .copied()
            .ok_or(RouteError::NotFound)
    }

    fn send_packet(&mut self, to: NetworkLocation, packet: &[u8]) -> Result<(), RouteError> {
        let mut hub = self.network.hub();
        if hub.cut.contains(&self.location) || hub.cut.contains(&to) {
            return Ok(());
        }
        let queue = hub.queues.get_mut(&to).ok_or(RouteError::Unreachable(to))?;
        queue.push_back((self.location, packet.to_vec()));
        Ok(())
    }

    fn poll_inbound(&mut self) -> Vec<(NetworkLocation, Vec<u8>)> {
        self.network
            .hub()
            .queues
            .get_mut(&self.location)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    fn add_node(&mut self, public_key: PublicKey, location: NetworkLocation) {
        self.network
            .hub()
            .directory
            .entry(public_key)
            .or_insert(location);
    }

    fn is_connected(&self) -> bool {
        !self.network.hub().cut.contains(&self.location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn resolve_and_deliver() {
        let net = MemoryNetwork::new();
        let a_key = *Keypair::generate().public_key();
        let b_key = *Keypair::generate().public_key();
        let mut a = net.join(a_key);
        let mut b = net.join(b_key);
        let to = a.resolve(&b_key).unwrap();
        assert_eq!(to, b.location());
        a.send_packet(to, b"ping").unwrap();
        assert_eq!(b.poll_inbound(), vec![(a.location(), b"ping".to_vec())]);
        assert!(b.poll_inbound().is_empty());
    }

    #[test]
    fn unlisted_node_not_found() {
        let net = MemoryNetwork::new();
        let mut a = net.join(*Keypair::generate().public_key());
        let hidden = net.join_unlisted(*Keypair::generate().public_key());
        assert!(matches!(
            a.resolve(hidden.public_key()),
            Err(RouteError::NotFound)
        ));
    }

    #[test]
    fn cut_node_loses_traffic() {
        let net = MemoryNetwork::new();
        let mut a = net.join(*Keypair::generate().public_key());
        let b = net.join(*Keypair::generate().public_key());
        net.set_reachable(b.location(), false);
        a.send_packet(b.location(), b"lost").unwrap();
        assert_eq!(net.pending(b.location()), 0);
        assert!(!b.is_connected());
        net.set_reachable(b.location(), true);
        assert!(b.is_connected());
    }
}
