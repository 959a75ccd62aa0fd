//! Client address lookup across the router splice.
//!
//! The internal proxies only ever see the router as their peer. Before the
//! router forwards the first byte it records which real client owns the
//! spliced socket, keyed by that socket's local address, so the proxies can
//! put the real client into `X-Forwarded-For`.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<DashMap<SocketAddr, SocketAddr>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that connections from `spliced` belong to `client`.
    /// The entry lives as long as the returned guard.
    pub fn register(&self, spliced: SocketAddr, client: SocketAddr) -> PeerGuard {
        self.peers.insert(spliced, client);
        PeerGuard {
            peers: Arc::clone(&self.peers),
            spliced,
        }
    }

    /// Real client behind `peer`, or `peer` itself if it was not spliced.
    pub fn resolve(&self, peer: SocketAddr) -> SocketAddr {
        self.peers.get(&peer).map(|c| *c).unwrap_or(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[derive(Debug)]
pub struct PeerGuard {
    peers: Arc<DashMap<SocketAddr, SocketAddr>>,
    spliced: SocketAddr,
}

impl Drop for PeerGuard {
    fn drop(&mut self) {
        self.peers.remove(&self.spliced);
    }
}
