//! Peer table
//!
//! Concurrent store of remote peers with secondary indexes by overlay IP and
//! overlay MAC. All three maps update under one write lock, so a reader can
//! never observe a secondary entry pointing at a peer whose record disagrees.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use tokio::sync::RwLock;
use tracing::trace;

use crate::endpoint::MacAddr;
use crate::peer::RemotePeer;
use crate::PeerId;

#[derive(Default)]
struct Inner {
    peers: HashMap<PeerId, RemotePeer>,
    by_ip: HashMap<IpAddr, PeerId>,
    by_mac: HashMap<MacAddr, PeerId>,
}

/// Thread-safe peer store
#[derive(Default)]
pub struct PeerTable {
    inner: RwLock<Inner>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace a peer and synchronize both secondary indexes
    pub async fn upsert(&self, id: &PeerId, peer: RemotePeer) {
        let mut inner = self.inner.write().await;
        let new_ip = peer.overlay_ip;
        let new_mac = peer.overlay_mac;

        if let Some(old) = inner.peers.insert(id.clone(), peer) {
            if let Some(ip) = old.overlay_ip {
                if Some(ip) != new_ip && inner.by_ip.get(&ip) == Some(id) {
                    inner.by_ip.remove(&ip);
                }
            }
            if let Some(mac) = old.overlay_mac {
                if Some(mac) != new_mac && inner.by_mac.get(&mac) == Some(id) {
                    inner.by_mac.remove(&mac);
                }
            }
        }
        if let Some(ip) = new_ip {
            inner.by_ip.insert(ip, id.clone());
        }
        if let Some(mac) = new_mac {
            inner.by_mac.insert(mac, id.clone());
        }
    }

    /// Drop a peer and the index entries derived from it
    pub async fn remove(&self, id: &PeerId) -> Option<RemotePeer> {
        let mut inner = self.inner.write().await;
        let peer = inner.peers.remove(id)?;
        if let Some(ip) = peer.overlay_ip {
            if inner.by_ip.get(&ip) == Some(id) {
                inner.by_ip.remove(&ip);
            }
        }
        if let Some(mac) = peer.overlay_mac {
            if inner.by_mac.get(&mac) == Some(id) {
                inner.by_mac.remove(&mac);
            }
        }
        trace!("Removed peer {} from table", id);
        Some(peer)
    }

    /// Copy of a single peer
    pub async fn get(&self, id: &PeerId) -> Option<RemotePeer> {
        self.inner.read().await.peers.get(id).cloned()
    }

    pub async fn contains(&self, id: &PeerId) -> bool {
        self.inner.read().await.peers.contains_key(id)
    }

    /// Where to send a frame for this hardware address
    pub async fn resolve_by_mac(&self, mac: &MacAddr) -> Option<(SocketAddr, u16)> {
        let inner = self.inner.read().await;
        let id = inner.by_mac.get(mac)?;
        let peer = inner.peers.get(id)?;
        peer.chosen_endpoint.map(|addr| (addr, peer.proxy_id))
    }

    /// Peer id owning an overlay IP
    pub async fn resolve_by_ip(&self, ip: &IpAddr) -> Option<PeerId> {
        self.inner.read().await.by_ip.get(ip).cloned()
    }

    /// Consistent copy of the primary map for iteration outside the lock
    pub async fn snapshot(&self) -> HashMap<PeerId, RemotePeer> {
        self.inner.read().await.peers.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.peers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.peers.is_empty()
    }
}
