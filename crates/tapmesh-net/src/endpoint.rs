//! Endpoint classification and overlay addressing helpers
//!
//! The routing stage ranks candidate endpoints LAN first, public internet
//! second, forwarders last; the predicates here make that call. The module
//! also owns the overlay MAC type and the local-address discovery used to
//! fill the declared-address list in `conn`.

use std::fmt;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::str::FromStr;

use rand::RngCore;
use tracing::debug;

use crate::error::{NetError, NetResult};

/// Returns true for addresses that only make sense on the local segment
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                // fc00::/7 unique local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// A MAC address on the virtual segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Generate a random locally-administered unicast MAC
    pub fn generate() -> Self {
        let mut bytes = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes[0] = (bytes[0] | 0x02) & 0xFE;
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Broadcast and multicast destinations are not routable to a single peer
    pub fn is_unicast(&self) -> bool {
        self.0[0] & 0x01 == 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| NetError::BadAddress(s.to_string()))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| NetError::BadAddress(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(NetError::BadAddress(s.to_string()));
        }
        Ok(Self(bytes))
    }
}

/// Destination MAC of an Ethernet frame, if the frame is long enough
pub fn frame_dest_mac(frame: &[u8]) -> Option<MacAddr> {
    if frame.len() < 14 {
        return None;
    }
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&frame[..6]);
    Some(MacAddr(mac))
}

/// Best-effort discovery of local unicast addresses
///
/// Connecting a UDP socket does not send anything; it just asks the kernel
/// which source address it would pick for that destination. Probing a public
/// and a private destination catches both the WAN-facing and the LAN-facing
/// interface on a typical host.
pub fn discover_local_ips() -> Vec<IpAddr> {
    let mut ips = Vec::new();
    for probe in ["203.0.113.1:9", "192.168.0.1:9", "10.0.0.1:9"] {
        if let Some(ip) = source_ip_for(probe) {
            if !ips.contains(&ip) {
                ips.push(ip);
            }
        }
    }
    debug!("Discovered local addresses: {:?}", ips);
    ips
}

fn source_ip_for(dest: &str) -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(dest).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_unspecified() {
        None
    } else {
        Some(ip)
    }
}

/// Parse a `host:port` endpoint string
pub fn parse_endpoint(s: &str) -> NetResult<SocketAddr> {
    s.parse()
        .map_err(|_| NetError::BadAddress(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_private_ip_classes() {
        assert!(is_private_ip("10.4.2.1".parse().unwrap()));
        assert!(is_private_ip("172.20.0.9".parse().unwrap()));
        assert!(is_private_ip("192.168.1.1".parse().unwrap()));
        assert!(is_private_ip("127.0.0.1".parse().unwrap()));
        assert!(!is_private_ip("8.8.8.8".parse().unwrap()));
        assert!(!is_private_ip("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn test_generated_macs_are_unique_and_unicast() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let mac = MacAddr::generate();
            assert!(mac.is_unicast());
            assert_eq!(mac.0[0] & 0x02, 0x02);
            assert!(seen.insert(mac), "same MAC was generated twice");
        }
    }

    #[test]
    fn test_mac_display_parse_roundtrip() {
        let mac = MacAddr([0x06, 0x1b, 0x00, 0xfe, 0x7a, 0x01]);
        let parsed: MacAddr = mac.to_string().parse().unwrap();
        assert_eq!(mac, parsed);
        assert!("06:1b:00".parse::<MacAddr>().is_err());
        assert!("zz:zz:zz:zz:zz:zz".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_frame_dest_mac() {
        let mut frame = vec![0u8; 64];
        frame[..6].copy_from_slice(&[2, 4, 6, 8, 10, 12]);
        assert_eq!(frame_dest_mac(&frame), Some(MacAddr([2, 4, 6, 8, 10, 12])));
        assert_eq!(frame_dest_mac(&frame[..10]), None);
    }
}
