//! tapmesh wire formats
//!
//! Two framings live here:
//! - the tracker control plane: flat bencoded dictionaries over UDP
//! - the overlay data plane: a fixed 8-byte header followed by an opaque
//!   payload

pub mod control;
pub mod error;
pub mod frame;

pub use control::{join_list, split_list, Command, ControlMessage, CONTROL_DATAGRAM_MAX};
pub use error::{ProtoError, ProtoResult};
pub use frame::{Frame, FrameType, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD};
