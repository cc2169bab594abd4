//! Forwarder (control peer)
//!
//! A plain UDP relay for peer pairs stuck behind symmetric NATs. The first
//! PROXY frame between two endpoints creates a bidirectional tunnel with a
//! small integer id; data frames carry that id in their header and are
//! passed to the other endpoint verbatim.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use tapmesh_net::{Datagram, TrackerClient, TrackerConfig, UdpTransport};
use tapmesh_proto::{Frame, FrameType};

/// A bidirectional endpoint pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub endpoint_a: SocketAddr,
    pub endpoint_b: SocketAddr,
}

impl Tunnel {
    fn bridges(&self, x: SocketAddr, y: SocketAddr) -> bool {
        (self.endpoint_a == x && self.endpoint_b == y)
            || (self.endpoint_a == y && self.endpoint_b == x)
    }

    fn other_side(&self, from: SocketAddr) -> Option<SocketAddr> {
        if from == self.endpoint_a {
            Some(self.endpoint_b)
        } else if from == self.endpoint_b {
            Some(self.endpoint_a)
        } else {
            None
        }
    }
}

/// UDP relay with a tunnel-id table
pub struct Forwarder {
    transport: Arc<UdpTransport>,
    tunnels: Mutex<HashMap<u16, Tunnel>>,
}

impl Forwarder {
    /// Bind the relay socket. Failing to bind is fatal at startup.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let transport = Arc::new(UdpTransport::bind(addr).await?);
        info!("Forwarder listening on {}", transport.local_addr());
        Ok(Self {
            transport,
            tunnels: Mutex::new(HashMap::new()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Register with the given trackers as an available control peer
    ///
    /// The fingerprint is date-scoped so stale registrations from previous
    /// days never collide with today's pool.
    pub async fn register(&self, trackers: &str) -> Result<Arc<TrackerClient>> {
        let config = TrackerConfig {
            routers: trackers.to_string(),
            fingerprint: relay_fingerprint(),
            declared_port: self.local_addr().port(),
            local_ips: tapmesh_net::discover_local_ips(),
        };
        let (discovered_tx, _discovered_rx) = mpsc::channel(1);
        let client = TrackerClient::connect(
            config,
            discovered_tx,
            Arc::new(tapmesh_net::Mailboxes::new()),
        )
        .await?;
        client.register_control_peer(self.local_addr().port()).await;
        Ok(client)
    }

    /// Relay loop; runs until the socket fails permanently
    pub async fn run(self: Arc<Self>) {
        let (tx, mut rx) = mpsc::channel(1024);
        self.transport.spawn_receiver(tx);
        while let Some(datagram) = rx.recv().await {
            self.handle_datagram(datagram).await;
        }
    }

    async fn handle_datagram(&self, datagram: Datagram) {
        let from = datagram.from;
        let frame = match Frame::decode(datagram.bytes.clone()) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Undecodable datagram from {}: {}", from, e);
                return;
            }
        };
        match frame.frame_type {
            FrameType::Proxy => self.handle_proxy(&frame, from).await,
            FrameType::Ping => debug!("Ping from {}", from),
            _ => self.relay(&datagram, frame.proxy_id).await,
        }
    }

    /// Tunnel negotiation: reuse the matching pair or allocate a fresh id
    async fn handle_proxy(&self, frame: &Frame, from: SocketAddr) {
        let payload = String::from_utf8_lossy(&frame.payload).to_string();
        let target: SocketAddr = match payload.parse() {
            Ok(addr) => addr,
            Err(_) => {
                warn!("Proxy request from {} with bad target '{}'", from, payload);
                return;
            }
        };

        let assigned = {
            let mut tunnels = self.tunnels.lock().await;
            match tunnels
                .iter()
                .find(|(_, tunnel)| tunnel.bridges(from, target))
                .map(|(id, _)| *id)
            {
                Some(id) => id,
                None => match lowest_free_id(&tunnels) {
                    Some(id) => {
                        debug!("New tunnel {} for {} <-> {}", id, from, target);
                        tunnels.insert(
                            id,
                            Tunnel {
                                endpoint_a: from,
                                endpoint_b: target,
                            },
                        );
                        id
                    }
                    None => {
                        warn!("Tunnel table full, declining {}", from);
                        0
                    }
                },
            }
        };

        let reply = Frame::proxy(assigned, frame.payload.clone());
        self.transport.send_best_effort(&reply, from).await;
    }

    /// Pass a data frame to the tunnel's other endpoint, untouched
    async fn relay(&self, datagram: &Datagram, proxy_id: u16) {
        let tunnel = {
            self.tunnels.lock().await.get(&proxy_id).cloned()
        };
        let Some(tunnel) = tunnel else {
            warn!("Tunnel {} is not registered", proxy_id);
            let reply = Frame::bad_tun(proxy_id);
            self.transport.send_best_effort(&reply, datagram.from).await;
            return;
        };
        match tunnel.other_side(datagram.from) {
            Some(other) => {
                if let Err(e) = self.transport.send_raw(&datagram.bytes, other).await {
                    debug!("Relay to {} failed: {}", other, e);
                }
            }
            None => warn!(
                "{} does not belong to tunnel {}, dropping",
                datagram.from, proxy_id
            ),
        }
    }

    /// Active tunnel count, for the stats reporter
    pub async fn tunnel_count(&self) -> usize {
        self.tunnels.lock().await.len()
    }
}

/// Smallest unused tunnel id, densely packed from 1
fn lowest_free_id(tunnels: &HashMap<u16, Tunnel>) -> Option<u16> {
    (1..=u16::MAX).find(|id| !tunnels.contains_key(id))
}

/// Date-scoped fingerprint for relay registrations
fn relay_fingerprint() -> String {
    let day = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        / 86_400;
    format!("cp{}", day)
}
