//! tapmesh client networking
//!
//! Everything a node needs to join a virtual segment:
//! - UDP transport with a resilient receive loop
//! - the peer table with overlay IP and MAC indexes
//! - the tracker (bootstrap) client
//! - one state-machine driver per remote peer
//! - the tunnel router bridging the TAP device and the overlay

pub mod codec;
pub mod endpoint;
pub mod error;
pub mod peer;
pub mod peer_table;
pub mod router;
pub mod tap;
pub mod tracker;
pub mod transport;

/// Tracker-assigned peer identifier (a UUID in string form)
pub type PeerId = String;

pub use codec::{PayloadCodec, PlainCodec};
pub use endpoint::{discover_local_ips, is_private_ip, MacAddr};
pub use error::{NetError, NetResult};
pub use peer::{Mailboxes, PeerDriver, PeerEvent, PeerState, PunchGate, RemotePeer};
pub use peer_table::PeerTable;
pub use router::{LocalIdentity, TunnelRouter};
pub use tap::{ChannelTap, ChannelTapHandle, TapDevice};
pub use tracker::{DiscoveredPeer, TrackerClient, TrackerConfig, FIND_INTERVAL};
pub use transport::{Datagram, UdpTransport, UdpTransportBuilder};
