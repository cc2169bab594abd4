//! Payload codec seam
//!
//! The cryptographic envelope around tunneled frames is supplied from
//! outside; the router only cares about sealing on the way out and opening
//! on the way in. `PlainCodec` is the null implementation used when the
//! segment runs unencrypted, in which case data frames go out as NENC.

use crate::error::{NetError, NetResult};

/// Byte-level encoder/decoder for tunneled payloads
pub trait PayloadCodec: Send + Sync {
    /// Wrap an outbound L2 frame
    fn seal(&self, frame: &[u8]) -> Vec<u8>;

    /// Unwrap an inbound payload back into an L2 frame
    fn open(&self, payload: &[u8]) -> NetResult<Vec<u8>>;

    /// Whether sealed frames should be marked ENC on the wire
    fn is_active(&self) -> bool;
}

/// Pass-through codec
#[derive(Debug, Default)]
pub struct PlainCodec;

impl PayloadCodec for PlainCodec {
    fn seal(&self, frame: &[u8]) -> Vec<u8> {
        frame.to_vec()
    }

    fn open(&self, payload: &[u8]) -> NetResult<Vec<u8>> {
        Ok(payload.to_vec())
    }

    fn is_active(&self) -> bool {
        false
    }
}

/// XOR keystream codec for tests and smoke runs; not a real cipher
#[cfg(test)]
pub(crate) struct XorCodec(pub u8);

#[cfg(test)]
impl PayloadCodec for XorCodec {
    fn seal(&self, frame: &[u8]) -> Vec<u8> {
        frame.iter().map(|b| b ^ self.0).collect()
    }

    fn open(&self, payload: &[u8]) -> NetResult<Vec<u8>> {
        if payload.is_empty() {
            return Err(NetError::Codec("empty payload".to_string()));
        }
        Ok(payload.iter().map(|b| b ^ self.0).collect())
    }

    fn is_active(&self) -> bool {
        true
    }
}
