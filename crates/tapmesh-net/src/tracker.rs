//! Tracker client
//!
//! Maintains one connected UDP socket per configured tracker, announces the
//! node with `conn`, refreshes the peer set with periodic `find`, and relays
//! tracker replies to whoever is waiting for them. Peer drivers talk to the
//! tracker exclusively through the small API at the bottom.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::interval;
use tracing::{debug, info, trace, warn};

use tapmesh_proto::{split_list, Command, ControlMessage, CONTROL_DATAGRAM_MAX};

use crate::error::{NetError, NetResult};
use crate::peer::{Mailboxes, PeerEvent, PeerState};
use crate::PeerId;

/// Default cadence for peer set refresh
pub const FIND_INTERVAL: Duration = Duration::from_secs(5);

/// Tracker client settings
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Comma-separated tracker addresses, `host:port,host:port,...`
    pub routers: String,
    /// Network fingerprint partitioning peers at the tracker
    pub fingerprint: String,
    /// Port our data socket listens on
    pub declared_port: u16,
    /// Local addresses we claim to own
    pub local_ips: Vec<IpAddr>,
}

/// A peer id announced by a tracker, with the endpoint it announced
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub id: PeerId,
    pub endpoint: Option<SocketAddr>,
}

struct TrackerConn {
    addr: SocketAddr,
    socket: Arc<UdpSocket>,
}

/// Client side of the bootstrap protocol
pub struct TrackerClient {
    config: TrackerConfig,
    conns: Vec<TrackerConn>,
    failed: Vec<String>,
    self_id: RwLock<Option<PeerId>>,
    node_replies: DashMap<PeerId, Vec<SocketAddr>>,
    forwarder_grants: DashMap<PeerId, SocketAddr>,
    pending_proxy: Mutex<VecDeque<PeerId>>,
    discovered_tx: mpsc::Sender<DiscoveredPeer>,
    mailboxes: Arc<Mailboxes>,
}

impl TrackerClient {
    /// Dial every configured tracker and start a read loop per connection
    ///
    /// Trackers that cannot be resolved or dialed land on the failed list;
    /// the client runs with whatever remains. All of them failing is a
    /// startup error.
    pub async fn connect(
        config: TrackerConfig,
        discovered_tx: mpsc::Sender<DiscoveredPeer>,
        mailboxes: Arc<Mailboxes>,
    ) -> NetResult<Arc<Self>> {
        let mut conns = Vec::new();
        let mut failed = Vec::new();

        for router in config.routers.split(',').filter(|r| !r.is_empty()) {
            match Self::dial(router).await {
                Ok(conn) => {
                    info!("Connected to tracker {} [{}]", router, conn.addr);
                    conns.push(conn);
                }
                Err(e) => {
                    warn!("Tracker {} unavailable: {}", router, e);
                    failed.push(router.to_string());
                }
            }
        }

        if conns.is_empty() {
            return Err(NetError::NoTrackers(config.routers.clone()));
        }

        let client = Arc::new(Self {
            config,
            conns,
            failed,
            self_id: RwLock::new(None),
            node_replies: DashMap::new(),
            forwarder_grants: DashMap::new(),
            pending_proxy: Mutex::new(VecDeque::new()),
            discovered_tx,
            mailboxes,
        });

        for index in 0..client.conns.len() {
            let this = Arc::clone(&client);
            tokio::spawn(async move { this.read_loop(index).await });
        }
        client.announce().await;

        Ok(client)
    }

    async fn dial(router: &str) -> NetResult<TrackerConn> {
        let addr = lookup_host(router)
            .await?
            .next()
            .ok_or_else(|| NetError::BadAddress(router.to_string()))?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;
        Ok(TrackerConn {
            addr,
            socket: Arc::new(socket),
        })
    }

    /// Send the initial `conn` on every connection
    async fn announce(&self) {
        let mut port = self.config.declared_port.to_string();
        for ip in &self.config.local_ips {
            port.push('|');
            port.push_str(&ip.to_string());
        }
        let mut msg = ControlMessage::new(Command::Conn);
        msg.port = port;
        self.broadcast(&msg).await;
    }

    /// Periodically refresh the peer set so new participants show up
    pub fn spawn_refresh(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                if this.self_id.read().await.is_some() {
                    this.send_find().await;
                } else {
                    // Never got (or lost) our id; ask again
                    this.announce().await;
                }
            }
        })
    }

    async fn read_loop(self: Arc<Self>, index: usize) {
        let conn = &self.conns[index];
        info!("Bootstrapping via {}", conn.addr);
        let mut buf = [0u8; CONTROL_DATAGRAM_MAX];
        loop {
            let len = match conn.socket.recv(&mut buf).await {
                Ok(len) => len,
                Err(e) => {
                    warn!("Tracker {} read error: {}", conn.addr, e);
                    continue;
                }
            };
            let msg = match ControlMessage::decode(&buf[..len]) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("Malformed message from tracker {}: {}", conn.addr, e);
                    continue;
                }
            };
            self.handle_message(index, msg).await;
        }
    }

    async fn handle_message(&self, index: usize, msg: ControlMessage) {
        let conn = &self.conns[index];
        match msg.command() {
            Some(Command::Conn) => {
                let mut id = self.self_id.write().await;
                match id.as_ref() {
                    None => {
                        info!("Tracker {} assigned us id {}", conn.addr, msg.id);
                        *id = Some(msg.id.clone());
                    }
                    Some(existing) if *existing != msg.id => {
                        debug!(
                            "Tracker {} assigned a different id {} (keeping {})",
                            conn.addr, msg.id, existing
                        );
                    }
                    Some(_) => {}
                }
                drop(id);
                // Ask for the peer set right away
                self.send_on(
                    index,
                    &ControlMessage::request(Command::Find, "", &self.config.fingerprint),
                )
                .await;
            }
            Some(Command::Ping) => {
                self.send_on(index, &ControlMessage::new(Command::Ping)).await;
            }
            Some(Command::Find) => {
                self.handle_find(&msg).await;
            }
            Some(Command::Node) => {
                let endpoints = parse_endpoints(&msg.dest);
                trace!("Addresses for {}: {:?}", msg.id, endpoints);
                self.node_replies.insert(msg.id.clone(), endpoints);
            }
            Some(Command::Cp) => {
                self.handle_cp_grant(&msg).await;
            }
            Some(Command::RegCp) => {
                info!("Tracker {} accepted us as a control peer", conn.addr);
            }
            Some(Command::Notify) => {
                // A peer reported the state it holds for us, relayed by the
                // tracker; id names the reporter.
                let Some(state) = msg.payload.parse::<i32>().ok().and_then(PeerState::from_code)
                else {
                    debug!("Bad state report '{}' from {}", msg.payload, msg.id);
                    return;
                };
                if let Some(mailbox) = self.mailboxes.get(&msg.id) {
                    let _ = mailbox.try_send(PeerEvent::RemoteState(state));
                }
            }
            Some(Command::Error) => {
                warn!("Tracker {} error: {}", conn.addr, msg.payload);
            }
            Some(other) => {
                debug!("Ignoring {} from tracker {}", other, conn.addr);
            }
            None => {
                debug!("Unknown command '{}' from tracker {}", msg.command, conn.addr);
            }
        }
    }

    async fn handle_find(&self, msg: &ControlMessage) {
        if msg.arguments == "0" {
            return;
        }
        let endpoints = split_list(&msg.dest);
        let ids = split_list(&msg.arguments);
        let self_id = self.self_id.read().await.clone();
        for (i, id) in ids.iter().enumerate() {
            if *id == "0" || Some(*id) == self_id.as_deref() {
                continue;
            }
            let discovered = DiscoveredPeer {
                id: id.to_string(),
                endpoint: endpoints.get(i).and_then(|e| e.parse().ok()),
            };
            if self.discovered_tx.send(discovered).await.is_err() {
                return;
            }
        }
    }

    async fn handle_cp_grant(&self, msg: &ControlMessage) {
        // Grants answer requests in order; an empty grant still consumes one
        let waiting = self.pending_proxy.lock().await.pop_front();
        let Some(peer_id) = waiting else {
            debug!("Unsolicited forwarder grant '{}'", msg.dest);
            return;
        };
        if msg.dest == "0" || msg.dest.is_empty() {
            debug!("No forwarder available for {}", peer_id);
            return;
        }
        match msg.dest.parse::<SocketAddr>() {
            Ok(addr) => {
                debug!("Forwarder {} granted for {}", addr, peer_id);
                self.forwarder_grants.insert(peer_id, addr);
            }
            Err(_) => warn!("Unparseable forwarder address '{}'", msg.dest),
        }
    }

    async fn broadcast(&self, msg: &ControlMessage) {
        for index in 0..self.conns.len() {
            self.send_on(index, msg).await;
        }
    }

    async fn send_on(&self, index: usize, msg: &ControlMessage) {
        let conn = &self.conns[index];
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode {}: {}", msg.command, e);
                return;
            }
        };
        if let Err(e) = conn.socket.send(&bytes).await {
            debug!("Failed to send {} to tracker {}: {}", msg.command, conn.addr, e);
        }
    }

    // --- API used by peer drivers -----------------------------------------

    /// Our tracker-assigned id, once a `conn` reply arrived
    pub async fn self_id(&self) -> Option<PeerId> {
        self.self_id.read().await.clone()
    }

    /// Trackers that could not be dialed at startup
    pub fn failed_routers(&self) -> &[String] {
        &self.failed
    }

    /// Ask for the declared endpoints of a peer
    pub async fn send_node(&self, id: &PeerId) {
        self.broadcast(&ControlMessage::request(Command::Node, id, ""))
            .await;
    }

    /// Refresh the peer set for our fingerprint
    pub async fn send_find(&self) {
        self.broadcast(&ControlMessage::request(
            Command::Find,
            "",
            &self.config.fingerprint,
        ))
        .await;
    }

    /// Request a forwarder on behalf of a peer driver
    pub async fn send_request_proxy(&self, id: &PeerId) {
        self.pending_proxy.lock().await.push_back(id.clone());
        self.broadcast(&ControlMessage::request(
            Command::Cp,
            id,
            &self.config.fingerprint,
        ))
        .await;
    }

    /// Report the state we hold for a peer
    pub async fn send_state(&self, id: &PeerId, state: PeerState, last_error: &str) {
        let mut msg = ControlMessage::request(Command::Notify, id, "");
        msg.payload = state.code().to_string();
        if !last_error.is_empty() {
            msg.arguments = last_error.to_string();
        }
        self.broadcast(&msg).await;
    }

    /// Tell the trackers a registration is going away
    pub async fn send_stop(&self, id: &PeerId) {
        self.broadcast(&ControlMessage::request(Command::Stop, id, ""))
            .await;
    }

    /// Report a forwarder that stopped answering
    pub async fn send_bad_cp(&self, addr: SocketAddr) {
        self.broadcast(&ControlMessage::request(
            Command::BadCp,
            "",
            &addr.to_string(),
        ))
        .await;
    }

    /// Register the local process as a control peer serving `data_port`
    pub async fn register_control_peer(&self, data_port: u16) {
        let mut msg = ControlMessage::new(Command::RegCp);
        msg.port = data_port.to_string();
        msg.hash = self.config.fingerprint.clone();
        self.broadcast(&msg).await;
    }

    /// Declared endpoints delivered for a peer, consuming them
    pub fn take_node_endpoints(&self, id: &PeerId) -> Option<Vec<SocketAddr>> {
        self.node_replies.remove(id).map(|(_, endpoints)| endpoints)
    }

    /// Forwarder granted for a peer, consuming it
    pub fn take_forwarder(&self, id: &PeerId) -> Option<SocketAddr> {
        self.forwarder_grants.remove(id).map(|(_, addr)| addr)
    }
}

fn parse_endpoints(list: &str) -> Vec<SocketAddr> {
    split_list(list)
        .into_iter()
        .filter_map(|e| e.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fake_tracker() -> (UdpSocket, String) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr.to_string())
    }

    fn test_config(routers: String) -> TrackerConfig {
        TrackerConfig {
            routers,
            fingerprint: "net-test".to_string(),
            declared_port: 4000,
            local_ips: vec!["192.168.1.2".parse().unwrap()],
        }
    }

    async fn connect_client(
        routers: String,
        tx: mpsc::Sender<DiscoveredPeer>,
    ) -> Arc<TrackerClient> {
        TrackerClient::connect(test_config(routers), tx, Arc::new(Mailboxes::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_conn_handshake_and_find() {
        let (tracker, addr) = fake_tracker().await;
        let (tx, _rx) = mpsc::channel(8);
        let client = connect_client(addr, tx).await;

        // Tracker sees the conn announcement with declared port and IPs
        let mut buf = [0u8; CONTROL_DATAGRAM_MAX];
        let (len, from) = tracker.recv_from(&mut buf).await.unwrap();
        let msg = ControlMessage::decode(&buf[..len]).unwrap();
        assert_eq!(msg.command(), Some(Command::Conn));
        assert_eq!(msg.port, "4000|192.168.1.2");

        // Assign an id; the client must store it and emit find
        let reply = ControlMessage::response(
            Command::Conn,
            "11111111-2222-3333-4444-555555555555",
            "",
        );
        tracker.send_to(&reply.encode().unwrap(), from).await.unwrap();

        let (len, _) = tracker.recv_from(&mut buf).await.unwrap();
        let msg = ControlMessage::decode(&buf[..len]).unwrap();
        assert_eq!(msg.command(), Some(Command::Find));
        assert_eq!(msg.hash, "net-test");

        assert_eq!(
            client.self_id().await.as_deref(),
            Some("11111111-2222-3333-4444-555555555555")
        );
    }

    #[tokio::test]
    async fn test_find_reply_discovers_peers() {
        let (tracker, addr) = fake_tracker().await;
        let (tx, mut rx) = mpsc::channel(8);
        let client = connect_client(addr, tx).await;

        let mut buf = [0u8; CONTROL_DATAGRAM_MAX];
        let (_, from) = tracker.recv_from(&mut buf).await.unwrap();

        let mut reply = ControlMessage::response(
            Command::Find,
            "",
            "203.0.113.1:4000,203.0.113.2:5000,",
        );
        reply.arguments = "peer-a,peer-b,".to_string();
        tracker.send_to(&reply.encode().unwrap(), from).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.id, "peer-a");
        assert_eq!(first.endpoint, Some("203.0.113.1:4000".parse().unwrap()));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.id, "peer-b");
        assert_eq!(second.endpoint, Some("203.0.113.2:5000".parse().unwrap()));

        drop(client);
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let (tracker, addr) = fake_tracker().await;
        let (tx, _rx) = mpsc::channel(8);
        let _client = connect_client(addr, tx).await;

        let mut buf = [0u8; CONTROL_DATAGRAM_MAX];
        let (_, from) = tracker.recv_from(&mut buf).await.unwrap(); // conn

        let ping = ControlMessage::new(Command::Ping);
        tracker.send_to(&ping.encode().unwrap(), from).await.unwrap();

        let (len, _) = tracker.recv_from(&mut buf).await.unwrap();
        let msg = ControlMessage::decode(&buf[..len]).unwrap();
        assert_eq!(msg.command(), Some(Command::Ping));
    }

    #[tokio::test]
    async fn test_node_and_cp_delivery() {
        let (tracker, addr) = fake_tracker().await;
        let (tx, _rx) = mpsc::channel(8);
        let client = connect_client(addr, tx).await;

        let mut buf = [0u8; CONTROL_DATAGRAM_MAX];
        let (_, from) = tracker.recv_from(&mut buf).await.unwrap(); // conn

        let peer = "peer-x".to_string();
        client.send_request_proxy(&peer).await;

        // node reply lands in the delivery table
        let node = ControlMessage::response(Command::Node, "peer-x", "10.1.0.4:4000,");
        tracker.send_to(&node.encode().unwrap(), from).await.unwrap();
        // cp grant is matched to the pending request
        let cp = ControlMessage::response(Command::Cp, "", "198.51.100.9:7000");
        tracker.send_to(&cp.encode().unwrap(), from).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(
            client.take_node_endpoints(&peer).unwrap(),
            vec!["10.1.0.4:4000".parse::<SocketAddr>().unwrap()]
        );
        assert!(client.take_node_endpoints(&peer).is_none());
        assert_eq!(
            client.take_forwarder(&peer).unwrap(),
            "198.51.100.9:7000".parse::<SocketAddr>().unwrap()
        );
        assert!(client.take_forwarder(&peer).is_none());
    }

    #[tokio::test]
    async fn test_notify_relays_remote_state() {
        let (tracker, addr) = fake_tracker().await;
        let (tx, _rx) = mpsc::channel(8);
        let mailboxes = Arc::new(Mailboxes::new());
        let _client =
            TrackerClient::connect(test_config(addr), tx, Arc::clone(&mailboxes))
                .await
                .unwrap();

        let (peer_tx, mut peer_rx) = mpsc::channel(8);
        mailboxes.insert("peer-r".to_string(), peer_tx);

        let mut buf = [0u8; CONTROL_DATAGRAM_MAX];
        let (_, from) = tracker.recv_from(&mut buf).await.unwrap(); // conn

        let mut report = ControlMessage::request(Command::Notify, "peer-r", "");
        report.payload = PeerState::Connected.code().to_string();
        tracker.send_to(&report.encode().unwrap(), from).await.unwrap();

        match tokio::time::timeout(Duration::from_secs(1), peer_rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            PeerEvent::RemoteState(state) => assert_eq!(state, PeerState::Connected),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_tracker_lands_on_failed_list() {
        let (tracker, good) = fake_tracker().await;
        let routers = format!("not-a-real-host.invalid:6881,{}", good);
        let (tx, _rx) = mpsc::channel(8);
        let client = connect_client(routers, tx).await;
        assert_eq!(client.failed_routers(), ["not-a-real-host.invalid:6881"]);
        drop(tracker);
    }
}
