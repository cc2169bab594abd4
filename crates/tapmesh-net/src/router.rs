//! Tunnel router
//!
//! The local data plane. Outbound: frames read from the TAP device are
//! resolved by destination MAC and sent to the owning peer's endpoint.
//! Inbound: every datagram from the transport is classified by frame type
//! and either written to the TAP device or turned into an event for the
//! owning peer driver. A single bad datagram never stops either loop.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use tapmesh_proto::{Frame, FrameType};

use crate::codec::PayloadCodec;
use crate::endpoint::{frame_dest_mac, MacAddr};
use crate::peer::{Mailboxes, PeerEvent};
use crate::peer_table::PeerTable;
use crate::tap::TapDevice;
use crate::tracker::TrackerClient;
use crate::transport::{Datagram, UdpTransport};
use crate::PeerId;

/// Our identity on the virtual segment
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub mac: MacAddr,
    pub ip: std::net::IpAddr,
}

/// Local data plane for one client
pub struct TunnelRouter {
    transport: Arc<UdpTransport>,
    table: Arc<PeerTable>,
    tap: Arc<dyn TapDevice>,
    codec: Arc<dyn PayloadCodec>,
    tracker: Arc<TrackerClient>,
    mailboxes: Arc<Mailboxes>,
    identity: LocalIdentity,
}

impl TunnelRouter {
    pub fn new(
        transport: Arc<UdpTransport>,
        table: Arc<PeerTable>,
        tap: Arc<dyn TapDevice>,
        codec: Arc<dyn PayloadCodec>,
        tracker: Arc<TrackerClient>,
        mailboxes: Arc<Mailboxes>,
        identity: LocalIdentity,
    ) -> Self {
        Self {
            transport,
            table,
            tap,
            codec,
            tracker,
            mailboxes,
            identity,
        }
    }

    /// TAP -> network. Runs until the TAP device closes.
    pub async fn run_outbound(self: Arc<Self>) {
        loop {
            let frame = match self.tap.read_frame().await {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("TAP read failed, stopping outbound loop: {}", e);
                    return;
                }
            };
            self.route_outbound(&frame).await;
        }
    }

    async fn route_outbound(&self, l2_frame: &[u8]) {
        let Some(mac) = frame_dest_mac(l2_frame) else {
            trace!("Dropping runt frame ({} bytes)", l2_frame.len());
            return;
        };
        if !mac.is_unicast() {
            trace!("Dropping non-unicast frame for {}", mac);
            return;
        }
        let Some((endpoint, proxy_id)) = self.table.resolve_by_mac(&mac).await else {
            trace!("No route for {}", mac);
            return;
        };
        let payload = self.codec.seal(l2_frame);
        let frame_type = if self.codec.is_active() {
            FrameType::Enc
        } else {
            FrameType::Nenc
        };
        let frame = Frame::new(frame_type, proxy_id, payload);
        self.transport.send_best_effort(&frame, endpoint).await;
    }

    /// Network -> TAP / driver events. Runs until the transport closes.
    pub async fn run_inbound(self: Arc<Self>, mut rx: mpsc::Receiver<Datagram>) {
        while let Some(datagram) = rx.recv().await {
            self.dispatch(datagram).await;
        }
        debug!("Transport channel closed, stopping inbound loop");
    }

    async fn dispatch(&self, datagram: Datagram) {
        let from = datagram.from;
        let frame = match Frame::decode(datagram.bytes) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Undecodable datagram from {}: {}", from, e);
                return;
            }
        };
        match frame.frame_type {
            FrameType::Enc => match self.codec.open(&frame.payload) {
                Ok(inner) => {
                    if let Err(e) = self.tap.write_frame(&inner).await {
                        warn!("TAP write failed: {}", e);
                    }
                }
                Err(e) => debug!("Dropping undecipherable frame from {}: {}", from, e),
            },
            FrameType::Nenc => {
                if let Err(e) = self.tap.write_frame(&frame.payload).await {
                    warn!("TAP write failed: {}", e);
                }
            }
            FrameType::IntroReq => self.handle_intro_req(&frame, from).await,
            FrameType::Intro => self.handle_intro(&frame, from).await,
            FrameType::XpeerPing => self.handle_xpeer_ping(&frame, from).await,
            FrameType::Proxy => self.handle_proxy_reply(&frame, from).await,
            FrameType::BadTun => self.handle_bad_tun(&frame, from).await,
            FrameType::Ping => trace!("Forwarder ping from {}", from),
            FrameType::String => {
                trace!("String frame from {}: {:?}", from, frame.payload)
            }
        }
    }

    /// Hole-punch probe: note the live path and introduce ourselves back
    async fn handle_intro_req(&self, frame: &Frame, from: SocketAddr) {
        let Some(sender_id) = payload_field(&frame.payload, 0) else {
            debug!("Malformed intro request from {}", from);
            return;
        };
        self.notify(&sender_id, PeerEvent::Touch(from));

        let Some(our_id) = self.tracker.self_id().await else {
            return;
        };
        let payload = format!("{},{},{}", our_id, self.identity.mac, self.identity.ip);
        // Mirror the tunnel id so the reply takes the same path back
        let reply = Frame::new(FrameType::Intro, frame.proxy_id, payload.into_bytes());
        self.transport.send_best_effort(&reply, from).await;
    }

    /// The peer told us its overlay identity
    async fn handle_intro(&self, frame: &Frame, from: SocketAddr) {
        let text = String::from_utf8_lossy(&frame.payload);
        let mut parts = text.split(',');
        let (Some(id), Some(mac), Some(ip)) = (parts.next(), parts.next(), parts.next()) else {
            debug!("Malformed intro from {}: {:?}", from, text);
            return;
        };
        let (Ok(mac), Ok(ip)) = (mac.parse::<MacAddr>(), ip.parse()) else {
            debug!("Unparseable intro from {}: {:?}", from, text);
            return;
        };
        self.notify(&id.to_string(), PeerEvent::Intro { mac, ip, from });
    }

    async fn handle_xpeer_ping(&self, frame: &Frame, from: SocketAddr) {
        let text = String::from_utf8_lossy(&frame.payload);
        let mut parts = text.split(',');
        let (Some(kind), Some(peer_id)) = (parts.next(), parts.next()) else {
            debug!("Malformed keepalive from {}", from);
            return;
        };
        self.notify(&peer_id.to_string(), PeerEvent::Touch(from));
        if kind == "REQ" {
            if let Some(our_id) = self.tracker.self_id().await {
                let payload = format!("RESP,{}", our_id);
                let reply =
                    Frame::new(FrameType::XpeerPing, frame.proxy_id, payload.into_bytes());
                self.transport.send_best_effort(&reply, from).await;
            }
        }
    }

    /// A forwarder echoed the tunnel id it assigned us
    async fn handle_proxy_reply(&self, frame: &Frame, from: SocketAddr) {
        if frame.proxy_id == 0 {
            debug!("Forwarder {} declined a tunnel", from);
            return;
        }
        let Ok(target) = String::from_utf8_lossy(&frame.payload).parse::<SocketAddr>() else {
            debug!("Proxy reply from {} without a target address", from);
            return;
        };
        // The echoed target tells us which peer this tunnel bridges
        let snapshot = self.table.snapshot().await;
        let owner = snapshot
            .values()
            .find(|peer| peer.known_endpoints.contains(&target));
        match owner {
            Some(peer) => self.notify(
                &peer.id,
                PeerEvent::TunnelGrant {
                    forwarder: from,
                    tunnel: frame.proxy_id,
                },
            ),
            None => debug!("Tunnel grant from {} for unknown target {}", from, target),
        }
    }

    /// The forwarder lost our tunnel; tell the affected driver
    async fn handle_bad_tun(&self, frame: &Frame, from: SocketAddr) {
        let snapshot = self.table.snapshot().await;
        let owner = snapshot
            .values()
            .find(|peer| peer.proxy_id == frame.proxy_id && peer.forwarder == Some(from));
        match owner {
            Some(peer) => {
                self.tracker.send_bad_cp(from).await;
                self.notify(&peer.id, PeerEvent::TunnelDead);
            }
            None => debug!("BAD_TUN {} from {} matches no peer", frame.proxy_id, from),
        }
    }

    fn notify(&self, id: &PeerId, event: PeerEvent) {
        if let Some(mailbox) = self.mailboxes.get(id) {
            if mailbox.try_send(event).is_err() {
                trace!("Mailbox full for peer {}", id);
            }
        }
    }
}

fn payload_field(payload: &Bytes, index: usize) -> Option<String> {
    let text = String::from_utf8_lossy(payload);
    text.split(',').nth(index).map(|s| s.to_string())
}
