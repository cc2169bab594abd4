//! Tracker control plane messages
//!
//! Clients and trackers exchange flat bencoded dictionaries over UDP. Every
//! value is a string and the keys are single letters to keep datagrams well
//! under the 512-byte cap.

use serde::{Deserialize, Serialize};

use crate::error::{ProtoError, ProtoResult};

/// Upper bound for a tracker-plane datagram
pub const CONTROL_DATAGRAM_MAX: usize = 512;

/// Commands understood by the tracker and its clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Connection handshake; tracker replies with the assigned peer id
    Conn,
    /// Peer set query by network fingerprint
    Find,
    /// Declared-endpoint query for a single peer id
    Node,
    /// Liveness probe (both directions)
    Ping,
    /// Register the sender as a forwarder (control peer)
    RegCp,
    /// Report an unreachable forwarder
    BadCp,
    /// Request a forwarder address
    Cp,
    /// Per-peer state report from a client
    Notify,
    /// Load report (reserved)
    Load,
    /// Client is leaving the segment
    Stop,
    /// Overlay address assignment (reserved)
    Dhcp,
    /// Error reply
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Conn => "conn",
            Command::Find => "find",
            Command::Node => "node",
            Command::Ping => "ping",
            Command::RegCp => "regcp",
            Command::BadCp => "badcp",
            Command::Cp => "cp",
            Command::Notify => "notify",
            Command::Load => "load",
            Command::Stop => "stop",
            Command::Dhcp => "dhcp",
            Command::Error => "error",
        }
    }

    /// Parse a wire command string. Unknown commands return `None` so the
    /// caller can log and drop.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "conn" => Some(Command::Conn),
            "find" => Some(Command::Find),
            "node" => Some(Command::Node),
            "ping" => Some(Command::Ping),
            "regcp" => Some(Command::RegCp),
            "badcp" => Some(Command::BadCp),
            "cp" => Some(Command::Cp),
            "notify" => Some(Command::Notify),
            "load" => Some(Command::Load),
            "stop" => Some(Command::Stop),
            "dhcp" => Some(Command::Dhcp),
            "error" => Some(Command::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single control-plane dictionary
///
/// Fields default to `"0"` when not meaningful for a given command, matching
/// what the other side expects. Keys are declared in sorted order so encoding
/// yields a canonical bencode dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Auxiliary arguments (command specific)
    #[serde(rename = "a", default = "zero")]
    pub arguments: String,

    /// Command name
    #[serde(rename = "c", default)]
    pub command: String,

    /// Destination list: comma-joined endpoints on responses
    #[serde(rename = "d", default = "zero")]
    pub dest: String,

    /// Network fingerprint, or a command-specific selector
    #[serde(rename = "h", default = "zero")]
    pub hash: String,

    /// Sender id, or `"0"` before assignment
    #[serde(rename = "i", default = "zero")]
    pub id: String,

    /// Declared listening port plus `|`-separated local addresses (on `conn`)
    #[serde(rename = "p", default = "zero")]
    pub port: String,

    /// Opaque payload
    #[serde(rename = "y", default = "zero")]
    pub payload: String,
}

fn zero() -> String {
    "0".to_string()
}

impl ControlMessage {
    /// Build a message with defaults for every field but the command
    pub fn new(command: Command) -> Self {
        Self {
            arguments: zero(),
            command: command.as_str().to_string(),
            dest: zero(),
            hash: zero(),
            id: zero(),
            port: zero(),
            payload: zero(),
        }
    }

    /// Build a request carrying id and hash, the usual client shape
    pub fn request(command: Command, id: &str, hash: &str) -> Self {
        let mut msg = Self::new(command);
        if !id.is_empty() {
            msg.id = id.to_string();
        }
        if !hash.is_empty() {
            msg.hash = hash.to_string();
        }
        msg
    }

    /// Build a response carrying id and dest, the usual tracker shape
    pub fn response(command: Command, id: &str, dest: &str) -> Self {
        let mut msg = Self::new(command);
        if !id.is_empty() {
            msg.id = id.to_string();
        }
        if !dest.is_empty() {
            msg.dest = dest.to_string();
        }
        msg
    }

    /// Parsed command, if the string matches a known one
    pub fn command(&self) -> Option<Command> {
        Command::parse(&self.command)
    }

    /// Encode into a bencoded dictionary
    pub fn encode(&self) -> ProtoResult<Vec<u8>> {
        serde_bencode::to_bytes(self).map_err(|e| ProtoError::Bencode(e.to_string()))
    }

    /// Decode from raw datagram bytes. Never panics on malformed input.
    pub fn decode(data: &[u8]) -> ProtoResult<Self> {
        serde_bencode::from_bytes(data).map_err(|e| ProtoError::Bencode(e.to_string()))
    }
}

/// Split a comma-joined list, skipping empty elements
///
/// Tracker responses carry a trailing comma, so the parser has to tolerate
/// empty trailing entries.
pub fn split_list(list: &str) -> Vec<&str> {
    list.split(',').filter(|s| !s.is_empty()).collect()
}

/// Join elements into a comma-terminated list, the tracker's `dest` shape
pub fn join_list<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for item in items {
        out.push_str(item.as_ref());
        out.push(',');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let msg = ControlMessage::request(Command::Find, "some-id", "net-X");
        let bytes = msg.encode().unwrap();
        let decoded = ControlMessage::decode(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_conn_roundtrip_with_port() {
        let mut msg = ControlMessage::request(Command::Conn, "", "");
        msg.port = "4000|192.168.1.10|10.1.0.4".to_string();
        let bytes = msg.encode().unwrap();
        assert!(bytes.len() <= CONTROL_DATAGRAM_MAX);
        let decoded = ControlMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.command(), Some(Command::Conn));
        assert_eq!(decoded.port, "4000|192.168.1.10|10.1.0.4");
        assert_eq!(decoded.id, "0");
    }

    #[test]
    fn test_malformed_input() {
        assert!(ControlMessage::decode(b"not bencode at all").is_err());
        assert!(ControlMessage::decode(b"").is_err());
        assert!(ControlMessage::decode(b"i42e").is_err());
    }

    #[test]
    fn test_unknown_command_is_preserved() {
        let mut msg = ControlMessage::new(Command::Ping);
        msg.command = "frobnicate".to_string();
        let decoded = ControlMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.command(), None);
        assert_eq!(decoded.command, "frobnicate");
    }

    #[test]
    fn test_split_list_tolerates_trailing_comma() {
        assert_eq!(
            split_list("10.0.0.1:4000,10.0.0.2:5000,"),
            vec!["10.0.0.1:4000", "10.0.0.2:5000"]
        );
        assert_eq!(split_list(""), Vec::<&str>::new());
        assert_eq!(split_list(",,"), Vec::<&str>::new());
    }

    #[test]
    fn test_join_list_trailing_comma() {
        assert_eq!(join_list(["a:1", "b:2"]), "a:1,b:2,");
        assert_eq!(join_list(Vec::<&str>::new()), "");
    }
}
