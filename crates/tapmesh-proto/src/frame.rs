//! Overlay frame format
//!
//! Wire format (little-endian):
//! [Type: 2 bytes][Length: 2 bytes][Proxy ID: 2 bytes][Reserved: 2 bytes][Payload]
//!
//! `proxy_id` is non-zero when the frame should pass through a forwarder; the
//! forwarder uses it as the tunnel key.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtoError, ProtoResult};

/// Fixed header size
pub const FRAME_HEADER_SIZE: usize = 8;

/// Largest payload the u16 length field can describe
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Overlay frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FrameType {
    /// Plain string message
    String = 0,
    /// Introduction: id, overlay MAC and overlay IP of the sender
    Intro = 1,
    /// Request for an introduction; doubles as the hole-punch probe
    IntroReq = 2,
    /// Data frame, payload not encrypted
    Nenc = 3,
    /// Data frame, payload passed through the crypto codec
    Enc = 4,
    /// Forwarder-internal liveness probe
    Ping = 5,
    /// Cross-peer keepalive
    XpeerPing = 6,
    /// Tunnel negotiation with a forwarder
    Proxy = 7,
    /// Forwarder reports an unknown tunnel id
    BadTun = 8,
}

impl TryFrom<u16> for FrameType {
    type Error = ProtoError;

    fn try_from(value: u16) -> Result<Self, ProtoError> {
        match value {
            0 => Ok(Self::String),
            1 => Ok(Self::Intro),
            2 => Ok(Self::IntroReq),
            3 => Ok(Self::Nenc),
            4 => Ok(Self::Enc),
            5 => Ok(Self::Ping),
            6 => Ok(Self::XpeerPing),
            7 => Ok(Self::Proxy),
            8 => Ok(Self::BadTun),
            other => Err(ProtoError::UnknownFrameType(other)),
        }
    }
}

/// A single overlay frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,

    /// Tunnel id when traversing a forwarder, 0 otherwise
    pub proxy_id: u16,

    /// Opaque payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(frame_type: FrameType, proxy_id: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            proxy_id,
            payload: payload.into(),
        }
    }

    /// Introduction request carrying the sender id and target endpoint
    pub fn intro_req(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameType::IntroReq, 0, payload)
    }

    /// Introduction reply
    pub fn intro(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Intro, 0, payload)
    }

    /// Tunnel negotiation frame; payload is the intended peer address string
    pub fn proxy(proxy_id: u16, payload: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Proxy, proxy_id, payload)
    }

    /// Cross-peer keepalive
    pub fn xpeer_ping(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameType::XpeerPing, 0, payload)
    }

    /// Unknown-tunnel notification, echoing the dead id
    pub fn bad_tun(proxy_id: u16) -> Self {
        Self::new(FrameType::BadTun, proxy_id, Bytes::new())
    }

    /// Serialize header and payload
    pub fn encode(&self) -> ProtoResult<Bytes> {
        if self.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(ProtoError::PayloadTooLarge(self.payload.len()));
        }
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u16_le(self.frame_type as u16);
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_u16_le(self.proxy_id);
        buf.put_u16_le(0); // reserved
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parse a frame from a received datagram
    pub fn decode(mut data: Bytes) -> ProtoResult<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(ProtoError::FrameTooShort(data.len()));
        }
        let raw_type = data.get_u16_le();
        let length = data.get_u16_le() as usize;
        let proxy_id = data.get_u16_le();
        let _reserved = data.get_u16_le();

        if data.len() < length {
            return Err(ProtoError::FrameTruncated {
                expected: length,
                actual: data.len(),
            });
        }

        let frame_type = FrameType::try_from(raw_type)?;
        let payload = data.slice(..length);

        Ok(Self {
            frame_type,
            proxy_id,
            payload,
        })
    }

    /// Total encoded size
    pub fn size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}
