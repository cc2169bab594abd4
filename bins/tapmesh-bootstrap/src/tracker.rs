//! Tracker service
//!
//! UDP rendezvous for tapmesh segments. Keeps a live registry of nodes keyed
//! by their reflexive address, partitions them by network fingerprint,
//! answers peer-set and endpoint queries, and brokers forwarder allocations.
//! Silent nodes are evicted by the ping sweep.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tapmesh_proto::{join_list, Command, ControlMessage, CONTROL_DATAGRAM_MAX};

/// Sweep cadence for node liveness
pub const PING_SWEEP: Duration = Duration::from_secs(25);

/// Nodes are dropped after this many unanswered sweeps
pub const MISSED_PING_LIMIT: u32 = 4;

/// A node registered with this tracker
#[derive(Debug, Clone)]
pub struct RegisteredNode {
    /// Tracker-assigned UUID
    pub id: String,
    /// Reflexive address the node's datagrams arrive from
    pub connection_address: SocketAddr,
    /// `reflexive-ip:declared-port`, set once `conn` arrives
    pub endpoint: String,
    /// Addresses the node claims to own
    pub declared_ips: Vec<IpAddr>,
    /// Port the node declared for its data socket
    pub declared_port: u16,
    /// Network fingerprint, recorded on the first `find`
    pub fingerprint: String,
    /// Last time the node answered a ping
    pub last_ping: Instant,
    /// Sweeps since the node last answered
    pub missed_pings: u32,
    /// Marked before removal
    pub disabled: bool,
    /// Whether the node registered as a control peer
    pub is_control_peer: bool,
}

/// A validated forwarder available for brokering
#[derive(Debug, Clone)]
pub struct ForwarderRecord {
    pub addr: SocketAddr,
    pub fingerprint: String,
    pub last_validated: Instant,
}

/// The tracker itself
pub struct TrackerService {
    socket: Arc<UdpSocket>,
    nodes: Mutex<Vec<RegisteredNode>>,
    forwarders: Mutex<Vec<ForwarderRecord>>,
}

impl TrackerService {
    /// Bind the tracker socket. Failing to bind is fatal at startup.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("Tracker listening on {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
            nodes: Mutex::new(Vec::new()),
            forwarders: Mutex::new(Vec::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive loop; never returns under normal operation
    pub async fn run(&self) -> Result<()> {
        let mut buf = [0u8; CONTROL_DATAGRAM_MAX];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, from)) => self.handle_packet(&buf[..len], from).await,
                Err(e) => warn!("Tracker receive error: {}", e),
            }
        }
    }

    /// Kick off the periodic liveness sweep
    pub fn spawn_ping_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(PING_SWEEP);
            // The first tick fires immediately; skip it so fresh nodes are
            // not penalized at startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.sweep().await;
            }
        })
    }

    /// One liveness cycle: ping everyone, evict nodes past the limit
    pub async fn sweep(&self) {
        let mut targets = Vec::new();
        {
            let mut nodes = self.nodes.lock().await;
            let mut remove = Vec::new();
            for (index, node) in nodes.iter_mut().enumerate() {
                node.missed_pings += 1;
                targets.push(node.connection_address);
                if node.missed_pings >= MISSED_PING_LIMIT {
                    node.disabled = true;
                    remove.push(index);
                }
            }
            // Descending order keeps the remaining indexes valid
            for index in remove.into_iter().rev() {
                let node = nodes.remove(index);
                info!(
                    "{} silent for {:?}, disconnecting {}",
                    node.connection_address,
                    node.last_ping.elapsed(),
                    node.id
                );
            }
        }
        let ping = ControlMessage::new(Command::Ping);
        for addr in targets {
            self.send(&ping, addr).await;
        }
    }

    async fn handle_packet(&self, data: &[u8], from: SocketAddr) {
        self.register_if_new(from).await;

        let msg = match ControlMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Malformed datagram from {}: {}", from, e);
                return;
            }
        };

        let response = match msg.command() {
            Some(Command::Conn) => self.handle_conn(&msg, from).await,
            Some(Command::Find) => self.handle_find(&msg, from).await,
            Some(Command::Ping) => self.handle_ping(from).await,
            Some(Command::Node) => self.handle_node(&msg).await,
            Some(Command::RegCp) => self.handle_regcp(&msg, from).await,
            Some(Command::Cp) => self.handle_cp().await,
            Some(Command::BadCp) => self.handle_badcp(&msg).await,
            Some(Command::Notify) => self.handle_notify(&msg, from).await,
            Some(Command::Stop) => self.handle_stop(from).await,
            Some(other) => {
                debug!("Ignoring {} from {}", other, from);
                None
            }
            None => {
                warn!("Unknown command '{}' from {}", msg.command, from);
                None
            }
        };

        if let Some(response) = response {
            self.send(&response, from).await;
        }
    }

    /// First contact: insert a node with a fresh unique id
    async fn register_if_new(&self, from: SocketAddr) {
        let mut nodes = self.nodes.lock().await;
        if nodes.iter().any(|n| n.connection_address == from) {
            return;
        }
        let id = unique_node_id(&nodes);
        info!("New peer connected: {} ({})", from, id);
        nodes.push(RegisteredNode {
            id,
            connection_address: from,
            endpoint: String::new(),
            declared_ips: Vec::new(),
            declared_port: 0,
            fingerprint: String::new(),
            last_ping: Instant::now(),
            missed_pings: 0,
            disabled: false,
            is_control_peer: false,
        });
    }

    /// `conn`: refine the node's declared endpoint, reply with its id
    async fn handle_conn(&self, msg: &ControlMessage, from: SocketAddr) -> Option<ControlMessage> {
        let mut parts = msg.port.split('|');
        let port: u16 = match parts.next().and_then(|p| p.parse().ok()) {
            Some(port) => port,
            None => {
                debug!("conn from {} with unusable port '{}'", from, msg.port);
                return None;
            }
        };
        let declared_ips: Vec<IpAddr> = parts.filter_map(|ip| ip.parse().ok()).collect();

        let mut nodes = self.nodes.lock().await;
        let node = nodes.iter_mut().find(|n| n.connection_address == from)?;
        node.endpoint = format!("{}:{}", from.ip(), port);
        node.declared_port = port;
        node.declared_ips = declared_ips;
        debug!("Node {} declares endpoint {}", node.id, node.endpoint);
        Some(ControlMessage::response(Command::Conn, &node.id, ""))
    }

    /// `find`: record the fingerprint and return every other member of it
    async fn handle_find(&self, msg: &ControlMessage, from: SocketAddr) -> Option<ControlMessage> {
        let mut nodes = self.nodes.lock().await;
        if let Some(node) = nodes
            .iter_mut()
            .find(|n| n.connection_address == from && n.fingerprint.is_empty())
        {
            debug!("Registering fingerprint '{}' for {}", msg.hash, from);
            node.fingerprint = msg.hash.clone();
        }

        let mut endpoints = Vec::new();
        let mut ids = Vec::new();
        for node in nodes.iter() {
            if node.fingerprint != msg.hash || node.connection_address == from {
                continue;
            }
            if node.endpoint.is_empty() || node.disabled {
                continue;
            }
            endpoints.push(node.endpoint.clone());
            ids.push(node.id.clone());
        }

        // Both fields stay at the "0" placeholder when nobody matches
        let mut response = ControlMessage::new(Command::Find);
        if !endpoints.is_empty() {
            response.dest = join_list(&endpoints);
            response.arguments = join_list(&ids);
        }
        Some(response)
    }

    /// `ping`: the node is alive
    async fn handle_ping(&self, from: SocketAddr) -> Option<ControlMessage> {
        let mut nodes = self.nodes.lock().await;
        if let Some(node) = nodes.iter_mut().find(|n| n.connection_address == from) {
            node.missed_pings = 0;
            node.last_ping = Instant::now();
        }
        None
    }

    /// `node`: declared endpoints of one peer, by id
    async fn handle_node(&self, msg: &ControlMessage) -> Option<ControlMessage> {
        let nodes = self.nodes.lock().await;
        let node = nodes.iter().find(|n| n.id == msg.id)?;
        let mut endpoints: Vec<String> = node
            .declared_ips
            .iter()
            .map(|ip| format!("{}:{}", ip, node.declared_port))
            .collect();
        if !node.endpoint.is_empty() && !endpoints.contains(&node.endpoint) {
            endpoints.push(node.endpoint.clone());
        }
        Some(ControlMessage::response(
            Command::Node,
            &node.id,
            &join_list(&endpoints),
        ))
    }

    /// `regcp`: validate and pool a forwarder
    async fn handle_regcp(&self, msg: &ControlMessage, from: SocketAddr) -> Option<ControlMessage> {
        let port: u16 = match msg.port.parse() {
            Ok(port) => port,
            Err(_) => {
                warn!("regcp from {} with unusable port '{}'", from, msg.port);
                return None;
            }
        };
        let claimed = SocketAddr::new(from.ip(), port);

        // Validation happens off-lock; re-check for a racing registration
        {
            let forwarders = self.forwarders.lock().await;
            if forwarders.iter().any(|f| f.addr.ip() == claimed.ip()) {
                // The stale entry ages out via badcp; the peer can re-register then
                warn!("Control peer {} is already pooled, ignoring", claimed.ip());
                return None;
            }
        }
        if !validate_forwarder(claimed).await {
            warn!("Control peer {} failed validation, ignoring", claimed);
            return None;
        }
        {
            let mut forwarders = self.forwarders.lock().await;
            if forwarders.iter().any(|f| f.addr.ip() == claimed.ip()) {
                return None;
            }
            info!("Pooled control peer {}", claimed);
            forwarders.push(ForwarderRecord {
                addr: claimed,
                fingerprint: msg.hash.clone(),
                last_validated: Instant::now(),
            });
        }

        let mut nodes = self.nodes.lock().await;
        if let Some(node) = nodes.iter_mut().find(|n| n.connection_address == from) {
            node.is_control_peer = true;
        }
        Some(ControlMessage::new(Command::RegCp))
    }

    /// `cp`: hand out the first forwarder that still answers
    async fn handle_cp(&self) -> Option<ControlMessage> {
        let candidates: Vec<SocketAddr> = {
            self.forwarders.lock().await.iter().map(|f| f.addr).collect()
        };
        for addr in candidates {
            if validate_forwarder(addr).await {
                let mut forwarders = self.forwarders.lock().await;
                if let Some(record) = forwarders.iter_mut().find(|f| f.addr == addr) {
                    record.last_validated = Instant::now();
                }
                return Some(ControlMessage::response(Command::Cp, "", &addr.to_string()));
            }
        }
        Some(ControlMessage::response(Command::Cp, "", ""))
    }

    /// `badcp`: re-check the named forwarder, drop it if dead, offer another
    async fn handle_badcp(&self, msg: &ControlMessage) -> Option<ControlMessage> {
        let reported: Option<SocketAddr> = msg.hash.parse().ok();
        if let Some(addr) = reported {
            let known = {
                self.forwarders.lock().await.iter().any(|f| f.addr == addr)
            };
            if known && !validate_forwarder(addr).await {
                info!("Dropping dead control peer {}", addr);
                self.forwarders.lock().await.retain(|f| f.addr != addr);
            }
        }
        self.handle_cp().await
    }

    /// `notify`: relay a state report to the peer it concerns
    async fn handle_notify(&self, msg: &ControlMessage, from: SocketAddr) -> Option<ControlMessage> {
        let (reporter_id, subject_addr) = {
            let nodes = self.nodes.lock().await;
            let reporter = nodes.iter().find(|n| n.connection_address == from)?;
            let subject = nodes.iter().find(|n| n.id == msg.id)?;
            debug!(
                "{} reports state {} for {} ({})",
                reporter.id, msg.payload, subject.id, msg.arguments
            );
            (reporter.id.clone(), subject.connection_address)
        };
        let mut relay = ControlMessage::request(Command::Notify, &reporter_id, "");
        relay.payload = msg.payload.clone();
        relay.arguments = msg.arguments.clone();
        self.send(&relay, subject_addr).await;
        None
    }

    /// `stop`: the node is leaving; drop it ahead of the sweep
    async fn handle_stop(&self, from: SocketAddr) -> Option<ControlMessage> {
        let mut nodes = self.nodes.lock().await;
        if let Some(index) = nodes.iter().position(|n| n.connection_address == from) {
            let node = nodes.remove(index);
            info!("Node {} left the segment", node.id);
        }
        None
    }

    async fn send(&self, msg: &ControlMessage, to: SocketAddr) {
        match msg.encode() {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, to).await {
                    warn!("Failed to send {} to {}: {}", msg.command, to, e);
                }
            }
            Err(e) => warn!("Failed to encode {}: {}", msg.command, e),
        }
    }

    /// Registered node count, for the stats reporter
    pub async fn node_count(&self) -> usize {
        self.nodes.lock().await.len()
    }

    pub async fn forwarder_count(&self) -> usize {
        self.forwarders.lock().await.len()
    }

    /// Registered nodes that announced themselves as control peers
    pub async fn control_peer_count(&self) -> usize {
        self.nodes
            .lock()
            .await
            .iter()
            .filter(|n| n.is_control_peer)
            .count()
    }
}

/// Generate a node id that collides with no existing registration
fn unique_node_id(existing: &[RegisteredNode]) -> String {
    loop {
        let id = Uuid::new_v4().to_string();
        if !existing.iter().any(|n| n.id == id) {
            return id;
        }
    }
}

/// Probe a forwarder address
///
/// UDP offers no handshake: connecting and sending an empty datagram accepts
/// any silent host, and a closed port only surfaces as an error on the send
/// after the ICMP reply lands. Hence the double send.
async fn validate_forwarder(addr: SocketAddr) -> bool {
    let Ok(socket) = UdpSocket::bind("0.0.0.0:0").await else {
        return false;
    };
    if socket.connect(addr).await.is_err() {
        return false;
    }
    if socket.send(&[]).await.is_err() {
        return false;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    socket.send(&[]).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    async fn start_tracker() -> (Arc<TrackerService>, SocketAddr) {
        let service = Arc::new(
            TrackerService::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
        let addr = service.local_addr().unwrap();
        let runner = Arc::clone(&service);
        tokio::spawn(async move { runner.run().await });
        (service, addr)
    }

    struct TestClient {
        socket: UdpSocket,
        tracker: SocketAddr,
    }

    impl TestClient {
        async fn new(tracker: SocketAddr) -> Self {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            Self { socket, tracker }
        }

        async fn send(&self, msg: &ControlMessage) {
            self.socket
                .send_to(&msg.encode().unwrap(), self.tracker)
                .await
                .unwrap();
        }

        async fn recv(&self) -> ControlMessage {
            let mut buf = [0u8; CONTROL_DATAGRAM_MAX];
            let (len, _) = timeout(Duration::from_secs(2), self.socket.recv_from(&mut buf))
                .await
                .expect("no reply from tracker")
                .unwrap();
            ControlMessage::decode(&buf[..len]).unwrap()
        }

        async fn connect(&self, port: u16) -> String {
            let mut conn = ControlMessage::new(Command::Conn);
            conn.port = port.to_string();
            self.send(&conn).await;
            let reply = self.recv().await;
            assert_eq!(reply.command(), Some(Command::Conn));
            reply.id
        }

        async fn find(&self, hash: &str) -> ControlMessage {
            self.send(&ControlMessage::request(Command::Find, "", hash))
                .await;
            let reply = self.recv().await;
            assert_eq!(reply.command(), Some(Command::Find));
            reply
        }
    }

    #[tokio::test]
    async fn test_bootstrap_and_discover() {
        let (_service, tracker) = start_tracker().await;

        let p1 = TestClient::new(tracker).await;
        let p2 = TestClient::new(tracker).await;

        let id1 = p1.connect(4000).await;
        let id2 = p2.connect(5000).await;
        assert_eq!(id1.len(), 36);
        assert_ne!(id1, id2);

        // P1 joins the segment first
        let reply = p1.find("net-X").await;
        assert_eq!(reply.dest, "0");

        // P2's first find returns P1's observed endpoint
        let reply = p2.find("net-X").await;
        let expected1 = format!("{}:4000", p1.socket.local_addr().unwrap().ip());
        assert_eq!(reply.dest, format!("{},", expected1));
        assert_eq!(reply.arguments, format!("{},", id1));

        // P1's next find returns P2
        let reply = p1.find("net-X").await;
        let expected2 = format!("{}:5000", p2.socket.local_addr().unwrap().ip());
        assert_eq!(reply.dest, format!("{},", expected2));
        assert_eq!(reply.arguments, format!("{},", id2));
    }

    #[tokio::test]
    async fn test_find_lists_every_other_member_once() {
        let (_service, tracker) = start_tracker().await;

        let mut clients = Vec::new();
        for port in [4000u16, 5000, 6000] {
            let client = TestClient::new(tracker).await;
            client.connect(port).await;
            client.find("net-X").await;
            clients.push((client, port));
        }

        for (client, own_port) in &clients {
            let reply = client.find("net-X").await;
            let dest = reply.dest;
            let own = format!(
                "{}:{}",
                client.socket.local_addr().unwrap().ip(),
                own_port
            );
            assert!(!dest.contains(&own), "{} listed itself: {}", own, dest);
            for (other, other_port) in &clients {
                if other_port == own_port {
                    continue;
                }
                let endpoint = format!(
                    "{}:{}",
                    other.socket.local_addr().unwrap().ip(),
                    other_port
                );
                assert_eq!(
                    dest.matches(&endpoint).count(),
                    1,
                    "{} not listed exactly once in {}",
                    endpoint,
                    dest
                );
            }
        }
    }

    #[tokio::test]
    async fn test_find_is_scoped_by_fingerprint() {
        let (_service, tracker) = start_tracker().await;

        let p1 = TestClient::new(tracker).await;
        let p2 = TestClient::new(tracker).await;
        p1.connect(4000).await;
        p2.connect(5000).await;
        p1.find("net-A").await;

        // A different fingerprint sees nothing
        let reply = p2.find("net-B").await;
        assert_eq!(reply.dest, "0");
        assert_eq!(reply.arguments, "0");
    }

    #[tokio::test]
    async fn test_node_returns_declared_endpoints() {
        let (_service, tracker) = start_tracker().await;

        let p1 = TestClient::new(tracker).await;
        let mut conn = ControlMessage::new(Command::Conn);
        conn.port = "4000|192.168.7.7|10.0.0.7".to_string();
        p1.send(&conn).await;
        let id = p1.recv().await.id;

        let p2 = TestClient::new(tracker).await;
        p2.send(&ControlMessage::request(Command::Node, &id, ""))
            .await;
        let reply = p2.recv().await;
        assert_eq!(reply.command(), Some(Command::Node));
        assert_eq!(reply.id, id);
        let reflexive = format!("{}:4000", p1.socket.local_addr().unwrap().ip());
        assert_eq!(
            reply.dest,
            format!("192.168.7.7:4000,10.0.0.7:4000,{},", reflexive)
        );
    }

    #[tokio::test]
    async fn test_forwarder_allocation_and_badcp() {
        let (_service, tracker) = start_tracker().await;

        // A socket standing in for the control peer's data plane
        let cp_data = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let cp_addr = cp_data.local_addr().unwrap();

        let cp = TestClient::new(tracker).await;
        cp.connect(cp_addr.port()).await;
        let mut regcp = ControlMessage::new(Command::RegCp);
        regcp.port = cp_addr.port().to_string();
        cp.send(&regcp).await;
        let reply = cp.recv().await;
        assert_eq!(reply.command(), Some(Command::RegCp));

        // A client asks for a forwarder and gets the pooled one
        let p1 = TestClient::new(tracker).await;
        p1.connect(4000).await;
        p1.send(&ControlMessage::request(Command::Cp, "", "net-X"))
            .await;
        let reply = p1.recv().await;
        assert_eq!(reply.command(), Some(Command::Cp));
        assert_eq!(reply.dest, cp_addr.to_string());

        // Stop the control peer, report it, and the pool drains
        drop(cp_data);
        p1.send(&ControlMessage::request(
            Command::BadCp,
            "",
            &cp_addr.to_string(),
        ))
        .await;
        let reply = p1.recv().await;
        assert_eq!(reply.command(), Some(Command::Cp));
        assert_eq!(reply.dest, "0");

        p1.send(&ControlMessage::request(Command::Cp, "", "net-X"))
            .await;
        let reply = p1.recv().await;
        assert_eq!(reply.dest, "0");
    }

    #[tokio::test]
    async fn test_duplicate_control_peer_ip_is_rejected() {
        let (service, tracker) = start_tracker().await;

        let cp_data = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let cp_addr = cp_data.local_addr().unwrap();

        let cp = TestClient::new(tracker).await;
        cp.connect(cp_addr.port()).await;
        let mut regcp = ControlMessage::new(Command::RegCp);
        regcp.port = cp_addr.port().to_string();
        cp.send(&regcp).await;
        cp.recv().await;
        assert_eq!(service.forwarder_count().await, 1);

        // Same IP again: silently ignored
        let other_data = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut regcp = ControlMessage::new(Command::RegCp);
        regcp.port = other_data.local_addr().unwrap().port().to_string();
        cp.send(&regcp).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(service.forwarder_count().await, 1);
    }

    #[tokio::test]
    async fn test_missed_ping_eviction() {
        let (service, tracker) = start_tracker().await;

        let p1 = TestClient::new(tracker).await;
        let id1 = p1.connect(4000).await;
        p1.find("net-X").await;
        assert_eq!(service.node_count().await, 1);

        // Four silent sweeps and the node is gone
        for _ in 0..MISSED_PING_LIMIT {
            service.sweep().await;
        }
        assert_eq!(service.node_count().await, 0);

        // And no longer shows up in find
        let p2 = TestClient::new(tracker).await;
        p2.connect(5000).await;
        let reply = p2.find("net-X").await;
        assert!(!reply.dest.contains("4000"));
        assert!(!reply.arguments.contains(&id1));
    }

    #[tokio::test]
    async fn test_ping_reply_resets_missed_count() {
        let (service, tracker) = start_tracker().await;

        let p1 = TestClient::new(tracker).await;
        p1.connect(4000).await;

        for _ in 0..MISSED_PING_LIMIT - 1 {
            service.sweep().await;
        }
        // The node answers one probe
        p1.send(&ControlMessage::new(Command::Ping)).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        service.sweep().await;
        assert_eq!(service.node_count().await, 1);
    }

    #[tokio::test]
    async fn test_stop_removes_registration() {
        let (service, tracker) = start_tracker().await;
        let p1 = TestClient::new(tracker).await;
        let id = p1.connect(4000).await;
        p1.send(&ControlMessage::request(Command::Stop, &id, ""))
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(service.node_count().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_datagrams_are_dropped() {
        let (service, tracker) = start_tracker().await;
        let p1 = TestClient::new(tracker).await;
        p1.socket.send_to(b"\xff\xfe garbage", tracker).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // The source was still registered, and the tracker keeps running
        assert_eq!(service.node_count().await, 1);
        let id = p1.connect(4000).await;
        assert_eq!(id.len(), 36);
    }

    #[test]
    fn test_unique_node_id_avoids_collisions() {
        let mut existing = Vec::new();
        for _ in 0..64 {
            let id = unique_node_id(&existing);
            assert_eq!(id.len(), 36);
            assert!(!existing.iter().any(|n: &RegisteredNode| n.id == id));
            existing.push(RegisteredNode {
                id,
                connection_address: "127.0.0.1:1".parse().unwrap(),
                endpoint: String::new(),
                declared_ips: Vec::new(),
                declared_port: 0,
                fingerprint: String::new(),
                last_ping: Instant::now(),
                missed_pings: 0,
                disabled: false,
                is_control_peer: false,
            });
        }
    }
}
