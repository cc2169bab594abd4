//! Per-peer connection state machine
//!
//! Every remote peer gets exactly one driver task that owns its state and
//! walks it through discovery, NAT traversal and teardown. Other tasks feed
//! the driver through its event mailbox; the driver treats those inputs as
//! advisory and applies them between ticks.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use tapmesh_proto::{Frame, FrameType};

use crate::endpoint::{is_private_ip, MacAddr};
use crate::peer_table::PeerTable;
use crate::tracker::TrackerClient;
use crate::transport::UdpTransport;
use crate::PeerId;

/// Cadence of the driver loop between state handlers
pub const STATE_TICK: Duration = Duration::from_millis(500);

/// Polling cadence inside waiting states
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Re-request interval and retry budget for declared endpoints
const NODE_RETRY: Duration = Duration::from_secs(1);
const NODE_RETRIES: u32 = 5;

/// How long to sit in WaitingForProxy before connecting anyway
const PROXY_DWELL: Duration = Duration::from_millis(4000);

/// Hole-punch burst shape
const BURST_ROUNDS: u32 = 10;
const BURST_SEND_GAP: Duration = Duration::from_millis(5);
const BURST_ROUND_GAP: Duration = Duration::from_millis(20);

/// Telemetry entries older than this do not count as live when routing
const TELEMETRY_FRESH: Duration = Duration::from_millis(10);

/// Keepalive interval in Connected
const KEEPALIVE: Duration = Duration::from_millis(3000);

/// Give up on a peer after this many trips through Init
const ATTEMPT_CAP: u8 = 5;

/// Length of a well-formed tracker-assigned id
const PEER_ID_LEN: usize = 36;

/// Gate serializing hole-punch bursts across all peer drivers
pub type PunchGate = Arc<Mutex<()>>;

/// Event mailboxes of the running peer drivers, keyed by peer id
pub type Mailboxes = DashMap<PeerId, mpsc::Sender<PeerEvent>>;

/// Connection state of a remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PeerState {
    /// Fresh or resetting; fields are cleared here
    Init = 0,
    /// Waiting for the tracker to deliver declared endpoints
    RequestedIp = 1,
    /// About to ask the tracker for a forwarder
    RequestingProxy = 2,
    /// Forwarder requested; dwell before connecting
    WaitingForProxy = 3,
    /// Hole-punch burst in flight
    Connecting = 4,
    /// Ranking live endpoints
    Routing = 5,
    /// Steady state
    Connected = 6,
    /// Tearing down
    Disconnect = 7,
    /// Terminal; the driver exits
    Stop = 8,
}

impl PeerState {
    pub fn code(&self) -> i32 {
        *self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Init),
            1 => Some(Self::RequestedIp),
            2 => Some(Self::RequestingProxy),
            3 => Some(Self::WaitingForProxy),
            4 => Some(Self::Connecting),
            5 => Some(Self::Routing),
            6 => Some(Self::Connected),
            7 => Some(Self::Disconnect),
            8 => Some(Self::Stop),
            _ => None,
        }
    }
}

/// One candidate address and when we last heard from it
#[derive(Debug, Clone)]
pub struct EndpointHealth {
    pub addr: SocketAddr,
    pub last_contact: Instant,
}

/// Client-side record of a remote peer
#[derive(Debug, Clone)]
pub struct RemotePeer {
    /// Tracker-assigned id
    pub id: PeerId,
    /// Candidate UDP addresses, LAN first after routing
    pub known_endpoints: Vec<SocketAddr>,
    /// Address currently used for data
    pub chosen_endpoint: Option<SocketAddr>,
    /// Forwarder bridging us, when direct transport failed
    pub forwarder: Option<SocketAddr>,
    /// Tunnel id on that forwarder, 0 when direct
    pub proxy_id: u16,
    /// Peer's address on the virtual segment
    pub overlay_ip: Option<IpAddr>,
    /// Peer's MAC on the virtual segment
    pub overlay_mac: Option<MacAddr>,
    /// Our view of the connection
    pub state: PeerState,
    /// Last state the peer reported for us, via received traffic
    pub remote_state: Option<PeerState>,
    /// Last time any datagram arrived from this peer
    pub last_contact: Instant,
    /// Keepalives sent since the last sign of life
    pub ping_count: u8,
    /// Trips through Init
    pub connection_attempts: u8,
    /// Live endpoint telemetry
    pub endpoints: Vec<EndpointHealth>,
    /// Most recent failure reason, reported to the tracker
    pub last_error: String,
}

impl RemotePeer {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            known_endpoints: Vec::new(),
            chosen_endpoint: None,
            forwarder: None,
            proxy_id: 0,
            overlay_ip: None,
            overlay_mac: None,
            state: PeerState::Init,
            remote_state: None,
            last_contact: Instant::now(),
            ping_count: 0,
            connection_attempts: 0,
            endpoints: Vec::new(),
            last_error: String::new(),
        }
    }

    /// Seed a peer discovered through `find` with its announced endpoint
    pub fn with_endpoint(id: PeerId, endpoint: SocketAddr) -> Self {
        let mut peer = Self::new(id);
        peer.known_endpoints.push(endpoint);
        peer
    }
}

/// Inputs applied to a driver between ticks
#[derive(Debug)]
pub enum PeerEvent {
    /// The peer reported its state for us
    RemoteState(PeerState),
    /// The peer introduced itself
    Intro {
        mac: MacAddr,
        ip: IpAddr,
        from: SocketAddr,
    },
    /// A datagram arrived from this address
    Touch(SocketAddr),
    /// A forwarder assigned us a tunnel
    TunnelGrant { forwarder: SocketAddr, tunnel: u16 },
    /// The forwarder no longer knows our tunnel
    TunnelDead,
}

/// Single-owner driver for one remote peer
pub struct PeerDriver {
    peer: RemotePeer,
    table: Arc<PeerTable>,
    tracker: Arc<TrackerClient>,
    transport: Arc<UdpTransport>,
    events: mpsc::Receiver<PeerEvent>,
    punch_gate: PunchGate,
    last_keepalive: Instant,
    tunnel_dead: bool,
}

impl PeerDriver {
    pub fn new(
        peer: RemotePeer,
        table: Arc<PeerTable>,
        tracker: Arc<TrackerClient>,
        transport: Arc<UdpTransport>,
        events: mpsc::Receiver<PeerEvent>,
        punch_gate: PunchGate,
    ) -> Self {
        // Backdated so the first Connected pass pings immediately
        let last_keepalive = Instant::now()
            .checked_sub(KEEPALIVE)
            .unwrap_or_else(Instant::now);
        Self {
            peer,
            table,
            tracker,
            transport,
            events,
            punch_gate,
            last_keepalive,
            tunnel_dead: false,
        }
    }

    /// Drive the peer until it stops, then remove it from the table
    pub async fn run(mut self) {
        info!("Starting driver for peer {}", self.peer.id);
        loop {
            if self.peer.state == PeerState::Stop {
                break;
            }
            // Nothing useful can happen before the tracker hands us an id
            if self.tracker.self_id().await.is_none() {
                self.drain_events();
                sleep(STATE_TICK).await;
                continue;
            }
            self.drain_events();
            match self.peer.state {
                PeerState::Init => self.state_init().await,
                PeerState::RequestedIp => self.state_requested_ip().await,
                PeerState::RequestingProxy => self.state_requesting_proxy().await,
                PeerState::WaitingForProxy => self.state_waiting_for_proxy().await,
                PeerState::Connecting => self.state_connecting().await,
                PeerState::Routing => self.state_routing().await,
                PeerState::Connected => self.state_connected().await,
                PeerState::Disconnect => self.state_disconnect().await,
                PeerState::Stop => {}
            }
            self.table.upsert(&self.peer.id, self.peer.clone()).await;
            sleep(STATE_TICK).await;
        }
        self.table.remove(&self.peer.id).await;
        info!("Peer {} has been stopped", self.peer.id);
    }

    async fn set_state(&mut self, state: PeerState) {
        trace!("Peer {}: {:?} -> {:?}", self.peer.id, self.peer.state, state);
        self.peer.state = state;
        self.tracker
            .send_state(&self.peer.id, state, &self.peer.last_error)
            .await;
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.apply_event(event);
        }
    }

    fn apply_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::RemoteState(state) => {
                self.peer.remote_state = Some(state);
            }
            PeerEvent::Intro { mac, ip, from } => {
                if self.peer.overlay_mac.is_none() {
                    debug!("Peer {} introduced itself as {} / {}", self.peer.id, mac, ip);
                }
                self.peer.overlay_mac = Some(mac);
                self.peer.overlay_ip = Some(ip);
                self.touch(from);
            }
            PeerEvent::Touch(addr) => self.touch(addr),
            PeerEvent::TunnelGrant { forwarder, tunnel } => {
                debug!(
                    "Peer {}: tunnel {} over forwarder {}",
                    self.peer.id, tunnel, forwarder
                );
                self.peer.forwarder = Some(forwarder);
                self.peer.proxy_id = tunnel;
                if !self.peer.known_endpoints.contains(&forwarder) {
                    self.peer.known_endpoints.push(forwarder);
                }
                self.touch(forwarder);
            }
            PeerEvent::TunnelDead => {
                warn!("Peer {}: forwarder dropped our tunnel", self.peer.id);
                let forwarder = self.peer.forwarder.take();
                self.peer.proxy_id = 0;
                if let Some(addr) = forwarder {
                    self.peer.endpoints.retain(|ep| ep.addr != addr);
                    self.peer.known_endpoints.retain(|a| *a != addr);
                }
                self.tunnel_dead = true;
            }
        }
    }

    fn touch(&mut self, addr: SocketAddr) {
        self.peer.last_contact = Instant::now();
        self.peer.ping_count = 0;
        match self.peer.endpoints.iter_mut().find(|ep| ep.addr == addr) {
            Some(entry) => entry.last_contact = Instant::now(),
            None => self.peer.endpoints.push(EndpointHealth {
                addr,
                last_contact: Instant::now(),
            }),
        }
    }

    /// Clear per-connection fields and ask the tracker for addresses
    async fn state_init(&mut self) {
        info!("Initializing peer {}", self.peer.id);
        self.peer.known_endpoints.clear();
        self.peer.endpoints.clear();
        self.peer.chosen_endpoint = None;
        self.peer.forwarder = None;
        self.peer.proxy_id = 0;
        self.peer.overlay_mac = None;
        self.peer.overlay_ip = None;
        self.peer.remote_state = None;
        self.tunnel_dead = false;
        self.peer.connection_attempts += 1;
        if self.peer.connection_attempts > ATTEMPT_CAP {
            self.peer.last_error = "too many unsuccessful connection attempts".to_string();
            warn!("Peer {}: {}", self.peer.id, self.peer.last_error);
            self.set_state(PeerState::Disconnect).await;
            return;
        }
        self.tracker.send_node(&self.peer.id).await;
        self.set_state(PeerState::RequestedIp).await;
    }

    /// Wait for declared endpoints, re-asking once a second
    async fn state_requested_ip(&mut self) {
        debug!("Waiting for addresses of peer {}", self.peer.id);
        let mut request_sent = Instant::now();
        let mut attempts = 0u32;
        loop {
            self.drain_events();
            if let Some(endpoints) = self.tracker.take_node_endpoints(&self.peer.id) {
                if !endpoints.is_empty() {
                    self.peer.known_endpoints = endpoints;
                    self.set_state(PeerState::RequestingProxy).await;
                    return;
                }
            }
            if request_sent.elapsed() > NODE_RETRY {
                attempts += 1;
                if attempts > NODE_RETRIES {
                    self.peer.last_error = "no endpoints received".to_string();
                    self.set_state(PeerState::Disconnect).await;
                    return;
                }
                debug!("No addresses for {} yet, asking again", self.peer.id);
                self.tracker.send_node(&self.peer.id).await;
                request_sent = Instant::now();
            }
            sleep(WAIT_POLL).await;
        }
    }

    async fn state_requesting_proxy(&mut self) {
        self.tracker.send_request_proxy(&self.peer.id).await;
        self.set_state(PeerState::WaitingForProxy).await;
    }

    /// Dwell while the tracker brokers a forwarder, then connect regardless
    async fn state_waiting_for_proxy(&mut self) {
        let started = Instant::now();
        while started.elapsed() < PROXY_DWELL {
            self.drain_events();
            if self.peer.forwarder.is_none() {
                if let Some(addr) = self.tracker.take_forwarder(&self.peer.id) {
                    self.negotiate_tunnel(addr).await;
                }
            }
            sleep(WAIT_POLL).await;
        }
        self.set_state(PeerState::Connecting).await;
    }

    /// Ask a forwarder for a tunnel toward this peer's primary endpoint
    async fn negotiate_tunnel(&mut self, forwarder: SocketAddr) {
        let target = match self.peer.known_endpoints.first() {
            Some(addr) => *addr,
            None => {
                debug!("Peer {}: no endpoint to tunnel toward", self.peer.id);
                return;
            }
        };
        debug!(
            "Peer {}: requesting tunnel to {} via {}",
            self.peer.id, target, forwarder
        );
        let frame = Frame::proxy(0, target.to_string().into_bytes());
        self.transport.send_best_effort(&frame, forwarder).await;
    }

    /// Fire the hole-punch burst in the background and move on to routing
    async fn state_connecting(&mut self) {
        let our_id = match self.tracker.self_id().await {
            Some(id) if id.len() == PEER_ID_LEN => id,
            _ => {
                warn!("No usable local id, aborting connection to {}", self.peer.id);
                self.peer.last_error = "local id missing".to_string();
                self.set_state(PeerState::Stop).await;
                return;
            }
        };

        let endpoints = self.peer.known_endpoints.clone();
        let forwarder = self.peer.forwarder;
        let tunnel = self.peer.proxy_id;
        let transport = Arc::clone(&self.transport);
        let gate = Arc::clone(&self.punch_gate);

        tokio::spawn(async move {
            // One burst in flight across all peers keeps the uplink sane
            let _punching = gate.lock().await;
            let mut counter = 0u16;
            for _ in 0..BURST_ROUNDS {
                for ep in &endpoints {
                    let proxy = if Some(*ep) == forwarder { tunnel } else { 0 };
                    let payload = format!("{},{},{}", our_id, ep, counter);
                    counter = (counter + 1) % 100;
                    let frame = Frame::new(FrameType::IntroReq, proxy, payload.into_bytes());
                    transport.send_best_effort(&frame, *ep).await;
                    sleep(BURST_SEND_GAP).await;
                }
                sleep(BURST_ROUND_GAP).await;
            }
        });

        self.set_state(PeerState::Routing).await;
    }

    /// Rank live endpoints LAN -> WAN -> forwarder and pick the head
    async fn state_routing(&mut self) {
        let candidates = std::mem::take(&mut self.peer.endpoints);
        self.peer.endpoints = rank_endpoints(candidates, self.peer.forwarder);

        match self.peer.endpoints.first() {
            Some(best) => {
                let proxied = Some(best.addr) == self.peer.forwarder;
                if self.peer.chosen_endpoint != Some(best.addr) {
                    debug!(
                        "Peer {}: routing via {}{}",
                        self.peer.id,
                        best.addr,
                        if proxied { " (forwarded)" } else { "" }
                    );
                }
                self.peer.chosen_endpoint = Some(best.addr);
                self.set_state(PeerState::Connected).await;
            }
            None => {
                self.peer.last_error = "no live endpoints".to_string();
                self.set_state(PeerState::Disconnect).await;
            }
        }
    }

    /// Steady state: keepalive, watch the remote hints, re-evaluate routes
    async fn state_connected(&mut self) {
        match self.peer.remote_state {
            Some(PeerState::Disconnect) | Some(PeerState::Stop) => {
                info!("Peer {} is going away", self.peer.id);
                self.set_state(PeerState::Disconnect).await;
                return;
            }
            Some(PeerState::Init) => {
                info!("Peer {} decided to reconnect", self.peer.id);
                self.peer.connection_attempts = 0;
                self.set_state(PeerState::Init).await;
                return;
            }
            _ => {}
        }

        if self.tunnel_dead {
            self.tunnel_dead = false;
            self.set_state(PeerState::Init).await;
            return;
        }

        if self.peer.overlay_mac.is_none() || self.peer.overlay_ip.is_none() {
            self.peer.last_error = "peer never introduced itself".to_string();
            self.set_state(PeerState::Disconnect).await;
            return;
        }

        if self.last_keepalive.elapsed() >= KEEPALIVE {
            self.last_keepalive = Instant::now();
            if let Some(our_id) = self.tracker.self_id().await {
                let payload = format!("REQ,{}", our_id);
                for ep in self.peer.endpoints.clone() {
                    let proxy = if Some(ep.addr) == self.peer.forwarder {
                        self.peer.proxy_id
                    } else {
                        0
                    };
                    let frame =
                        Frame::new(FrameType::XpeerPing, proxy, payload.clone().into_bytes());
                    self.transport.send_best_effort(&frame, ep.addr).await;
                }
                self.peer.ping_count = self.peer.ping_count.saturating_add(1);
            }
        }

        self.set_state(PeerState::Routing).await;
    }

    async fn state_disconnect(&mut self) {
        info!("Disconnecting peer {}", self.peer.id);
        self.set_state(PeerState::Stop).await;
    }
}

/// Drop stale telemetry and order the rest locals, internet, forwarders
fn rank_endpoints(
    candidates: Vec<EndpointHealth>,
    forwarder: Option<SocketAddr>,
) -> Vec<EndpointHealth> {
    let mut locals = Vec::new();
    let mut internet = Vec::new();
    let mut proxies = Vec::new();
    for ep in candidates {
        if ep.last_contact.elapsed() > TELEMETRY_FRESH {
            continue;
        }
        if Some(ep.addr) == forwarder {
            proxies.push(ep);
        } else if is_private_ip(ep.addr.ip()) {
            locals.push(ep);
        } else {
            internet.push(ep);
        }
    }
    locals.append(&mut internet);
    locals.append(&mut proxies);
    locals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes_roundtrip() {
        for code in 0..=8 {
            let state = PeerState::from_code(code).unwrap();
            assert_eq!(state.code(), code);
        }
        assert_eq!(PeerState::from_code(42), None);
    }

    #[test]
    fn test_new_peer_defaults() {
        let peer = RemotePeer::new("abc".to_string());
        assert_eq!(peer.state, PeerState::Init);
        assert_eq!(peer.connection_attempts, 0);
        assert!(peer.known_endpoints.is_empty());
        assert!(peer.overlay_mac.is_none());
    }

    #[test]
    fn test_endpoint_ranking_order() {
        let forwarder: SocketAddr = "198.51.100.1:3000".parse().unwrap();
        let lan: SocketAddr = "192.168.1.7:4000".parse().unwrap();
        let wan: SocketAddr = "203.0.113.9:4000".parse().unwrap();

        let candidates: Vec<EndpointHealth> = [forwarder, wan, lan]
            .into_iter()
            .map(|addr| EndpointHealth {
                addr,
                last_contact: Instant::now(),
            })
            .collect();

        let ranked = rank_endpoints(candidates, Some(forwarder));
        let order: Vec<SocketAddr> = ranked.iter().map(|ep| ep.addr).collect();
        // The private address must come out on top
        assert_eq!(order, vec![lan, wan, forwarder]);
    }

    #[tokio::test]
    async fn test_ranking_drops_stale_entries() {
        let addr: SocketAddr = "203.0.113.9:4000".parse().unwrap();
        let stale = EndpointHealth {
            addr,
            last_contact: Instant::now(),
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rank_endpoints(vec![stale], None).is_empty());
    }

    #[tokio::test]
    async fn test_driver_disconnects_after_node_retry_cap() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use tokio::net::UdpSocket;

        use crate::peer_table::PeerTable;
        use crate::tracker::{TrackerClient, TrackerConfig};
        use crate::transport::UdpTransport;
        use tapmesh_proto::{Command, ControlMessage, CONTROL_DATAGRAM_MAX};

        // A tracker that assigns an id but never answers `node`
        let tracker_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tracker_addr = tracker_sock.local_addr().unwrap();
        let node_requests = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&node_requests);
        tokio::spawn(async move {
            let mut buf = [0u8; CONTROL_DATAGRAM_MAX];
            loop {
                let Ok((len, from)) = tracker_sock.recv_from(&mut buf).await else {
                    break;
                };
                let Ok(msg) = ControlMessage::decode(&buf[..len]) else {
                    continue;
                };
                match msg.command() {
                    Some(Command::Conn) => {
                        let reply = ControlMessage::response(
                            Command::Conn,
                            "abcdefab-1111-2222-3333-abcdefabcdef",
                            "",
                        );
                        let _ = tracker_sock.send_to(&reply.encode().unwrap(), from).await;
                    }
                    Some(Command::Node) => {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    _ => {}
                }
            }
        });

        let (discovered_tx, _discovered_rx) = mpsc::channel(16);
        let tracker = TrackerClient::connect(
            TrackerConfig {
                routers: tracker_addr.to_string(),
                fingerprint: "net-test".to_string(),
                declared_port: 0,
                local_ips: Vec::new(),
            },
            discovered_tx,
            Arc::new(Mailboxes::new()),
        )
        .await
        .unwrap();

        let transport = Arc::new(
            UdpTransport::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
        let table = Arc::new(PeerTable::new());
        let (_event_tx, event_rx) = mpsc::channel(16);

        let id = "peer-z".to_string();
        let driver = PeerDriver::new(
            RemotePeer::new(id.clone()),
            Arc::clone(&table),
            tracker,
            transport,
            event_rx,
            PunchGate::default(),
        );
        let handle = tokio::spawn(driver.run());

        tokio::time::timeout(Duration::from_secs(20), handle)
            .await
            .expect("driver did not reach Stop in time")
            .unwrap();

        // The peer was surfaced to the table as a removal...
        assert!(!table.contains(&id).await);
        // ...after the initial request plus exactly five retries
        assert_eq!(node_requests.load(Ordering::SeqCst), 6);
    }
}
