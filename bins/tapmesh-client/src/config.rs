//! Client configuration

use std::net::IpAddr;

/// Settings for one client instance
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Tracker addresses, `host:port,host:port,...`
    pub trackers: String,
    /// Network fingerprint of the segment to join
    pub fingerprint: String,
    /// UDP port for the data socket (0 picks an ephemeral port)
    pub listen_port: u16,
    /// TAP device name
    pub tap_name: String,
    /// Our address on the virtual segment
    pub overlay_ip: IpAddr,
    /// Our MAC on the virtual segment; generated when absent
    pub overlay_mac: Option<String>,
}
