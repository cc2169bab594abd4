//! Network layer error types

use thiserror::Error;

/// Errors raised by the tapmesh networking layer
#[derive(Debug, Error)]
pub enum NetError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire codec error
    #[error("codec error: {0}")]
    Proto(#[from] tapmesh_proto::ProtoError),

    /// Address could not be resolved or parsed
    #[error("bad address: {0}")]
    BadAddress(String),

    /// No tracker connection could be established
    #[error("no reachable trackers in '{0}'")]
    NoTrackers(String),

    /// Peer is not present in the table
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// Destination MAC has no table entry
    #[error("no route for hardware address {0}")]
    NoRoute(String),

    /// Payload codec rejected a frame
    #[error("payload codec error: {0}")]
    Codec(String),

    /// TAP device failure
    #[error("tap device error: {0}")]
    Tap(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for network operations
pub type NetResult<T> = Result<T, NetError>;
