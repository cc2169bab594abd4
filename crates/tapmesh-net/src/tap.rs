//! TAP device seam
//!
//! Creating and configuring the platform TAP interface happens outside this
//! crate; the router only needs a frame source and sink. `ChannelTap` backs
//! the seam with in-memory channels, which is what the tests and the
//! loopback smoke mode of the client use.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::error::{NetError, NetResult};

/// A Layer-2 device on the virtual segment
#[async_trait]
pub trait TapDevice: Send + Sync {
    /// Read the next Ethernet frame leaving the local host
    async fn read_frame(&self) -> NetResult<Bytes>;

    /// Write an Ethernet frame arriving from the segment
    async fn write_frame(&self, frame: &[u8]) -> NetResult<()>;

    /// Device name, for logs
    fn name(&self) -> &str;
}

/// Channel-backed TAP device
pub struct ChannelTap {
    name: String,
    outbound: Mutex<mpsc::Receiver<Bytes>>,
    inbound: mpsc::Sender<Bytes>,
}

/// Test/host side handles for a `ChannelTap`
pub struct ChannelTapHandle {
    /// Inject a frame as if the OS wrote it to the device
    pub inject: mpsc::Sender<Bytes>,
    /// Frames the router delivered to the device
    pub delivered: mpsc::Receiver<Bytes>,
}

impl ChannelTap {
    /// Create a device plus its host-side handles
    pub fn new(name: &str, capacity: usize) -> (Self, ChannelTapHandle) {
        let (inject_tx, inject_rx) = mpsc::channel(capacity);
        let (deliver_tx, deliver_rx) = mpsc::channel(capacity);
        (
            Self {
                name: name.to_string(),
                outbound: Mutex::new(inject_rx),
                inbound: deliver_tx,
            },
            ChannelTapHandle {
                inject: inject_tx,
                delivered: deliver_rx,
            },
        )
    }
}

#[async_trait]
impl TapDevice for ChannelTap {
    async fn read_frame(&self) -> NetResult<Bytes> {
        let mut rx = self.outbound.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| NetError::Tap("device closed".to_string()))
    }

    async fn write_frame(&self, frame: &[u8]) -> NetResult<()> {
        self.inbound
            .send(Bytes::copy_from_slice(frame))
            .await
            .map_err(|_| NetError::Tap("device closed".to_string()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_tap_roundtrip() {
        let (tap, mut handle) = ChannelTap::new("tap-test", 8);

        handle.inject.send(Bytes::from_static(b"frame-out")).await.unwrap();
        assert_eq!(&tap.read_frame().await.unwrap()[..], b"frame-out");

        tap.write_frame(b"frame-in").await.unwrap();
        assert_eq!(&handle.delivered.recv().await.unwrap()[..], b"frame-in");
    }
}
