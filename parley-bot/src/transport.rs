//! UDP router: one tokio socket, a static node directory plus locations learned from traffic.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parley_core::wire::peek_sender;
use parley_core::{NetworkLocation, PublicKey, RouteError, Router};
use tokio::net::UdpSocket;

const MAX_DATAGRAM: usize = 64 * 1024;
/// Datagrams drained per poll, so a flood cannot starve the tick loop.
const MAX_BATCH: usize = 256;
/// No inbound traffic for this long counts as disconnected.
const CONNECTED_WINDOW: Duration = Duration::from_secs(30);

pub struct UdpRouter {
    socket: UdpSocket,
    /// Bootstrap and configured peers; never overwritten by traffic.
    nodes: HashMap<PublicKey, SocketAddr>,
    /// Source address of the last valid-looking envelope from each sender.
    learned: HashMap<PublicKey, SocketAddr>,
    last_inbound: Option<Instant>,
    buf: Vec<u8>,
}

impl UdpRouter {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            nodes: HashMap::new(),
            learned: HashMap::new(),
            last_inbound: None,
            buf: vec![0u8; MAX_DATAGRAM],
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Router for UdpRouter {
    fn resolve(&mut self, public_key: &PublicKey) -> Result<NetworkLocation, RouteError> {
        self.nodes
            .get(public_key)
            .or_else(|| self.learned.get(public_key))
            .copied()
            .ok_or(RouteError::NotFound)
    }

    fn send_packet(&mut self, to: NetworkLocation, packet: &[u8]) -> Result<(), RouteError> {
        match self.socket.try_send_to(packet, to) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                tracing::debug!(%to, "send buffer full, datagram dropped");
                Ok(())
            }
            Err(e) => Err(RouteError::Io(e)),
        }
    }

    fn poll_inbound(&mut self) -> Vec<(NetworkLocation, Vec<u8>)> {
        let mut out = Vec::new();
        while out.len() < MAX_BATCH {
            match self.socket.try_recv_from(&mut self.buf) {
                Ok((n, from)) => {
                    let bytes = self.buf[..n].to_vec();
                    if let Some(sender) = peek_sender(&bytes) {
                        self.learned.insert(sender, from);
                    }
                    self.last_inbound = Some(Instant::now());
                    out.push((from, bytes));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    // ICMP port-unreachable surfaces here on some platforms
                    tracing::debug!(error = %e, "recv error");
                    break;
                }
            }
        }
        out
    }

    fn add_node(&mut self, public_key: PublicKey, location: NetworkLocation) {
        self.nodes.insert(public_key, location);
    }

    fn is_connected(&self) -> bool {
        self.last_inbound
            .is_some_and(|t| t.elapsed() < CONNECTED_WINDOW)
    }
}
