//! UDP transport
//!
//! One socket per role. Sends are best-effort: anything the kernel refuses
//! is logged and dropped, never surfaced to a state machine. The receive
//! loop hands raw datagrams to a dispatcher channel and survives any single
//! failure.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use tapmesh_proto::Frame;

use crate::error::NetResult;

/// A raw datagram with its source address
#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: SocketAddr,
    pub bytes: Bytes,
}

/// UDP transport for overlay frames
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind to the given address
    pub async fn bind(addr: SocketAddr) -> NetResult<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        debug!("UDP transport bound to {}", local_addr);
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    /// Local socket address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send an encoded frame
    pub async fn send_frame(&self, frame: &Frame, addr: SocketAddr) -> NetResult<()> {
        let bytes = frame.encode()?;
        trace!("Sending {} bytes to {}", bytes.len(), addr);
        self.socket.send_to(&bytes, addr).await?;
        Ok(())
    }

    /// Send a frame, logging failure instead of returning it
    pub async fn send_best_effort(&self, frame: &Frame, addr: SocketAddr) {
        if let Err(e) = self.send_frame(frame, addr).await {
            debug!("Dropped frame to {}: {}", addr, e);
        }
    }

    /// Send raw bytes
    pub async fn send_raw(&self, bytes: &[u8], addr: SocketAddr) -> NetResult<()> {
        self.socket.send_to(bytes, addr).await?;
        Ok(())
    }

    /// Start the receive loop, feeding datagrams into `tx`
    ///
    /// Returns when the dispatcher side of the channel goes away.
    pub fn spawn_receiver(self: &Arc<Self>, tx: mpsc::Sender<Datagram>) -> tokio::task::JoinHandle<()> {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match transport.socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        let datagram = Datagram {
                            from,
                            bytes: Bytes::copy_from_slice(&buf[..len]),
                        };
                        if tx.send(datagram).await.is_err() {
                            debug!("Dispatcher channel closed, stopping receiver");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Receive error on {}: {}", transport.local_addr, e);
                    }
                }
            }
        })
    }
}

/// Builder with socket options applied before tokio takes over
pub struct UdpTransportBuilder {
    bind_addr: SocketAddr,
    recv_buffer_size: Option<usize>,
    send_buffer_size: Option<usize>,
}

impl UdpTransportBuilder {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            recv_buffer_size: None,
            send_buffer_size: None,
        }
    }

    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = Some(size);
        self
    }

    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    pub fn build(self) -> NetResult<UdpTransport> {
        use socket2::{Domain, Protocol, Socket, Type};

        let domain = if self.bind_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&self.bind_addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket = UdpSocket::from_std(std_socket)?;
        let local_addr = tokio_socket.local_addr()?;
        debug!("UDP transport bound to {} with custom options", local_addr);

        Ok(UdpTransport {
            socket: Arc::new(tokio_socket),
            local_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapmesh_proto::FrameType;

    #[tokio::test]
    async fn test_bind_and_local_addr() {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert!(transport.local_addr().port() > 0);
    }

    #[tokio::test]
    async fn test_send_recv_frame() {
        let a = Arc::new(
            UdpTransport::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
        let b = Arc::new(
            UdpTransport::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );

        let (tx, mut rx) = mpsc::channel(4);
        b.spawn_receiver(tx);

        let frame = Frame::new(FrameType::XpeerPing, 0, &b"REQ,abc"[..]);
        a.send_frame(&frame, b.local_addr()).await.unwrap();

        let datagram = rx.recv().await.unwrap();
        assert_eq!(datagram.from, a.local_addr());
        let decoded = Frame::decode(datagram.bytes).unwrap();
        assert_eq!(decoded.frame_type, FrameType::XpeerPing);
        assert_eq!(&decoded.payload[..], b"REQ,abc");
    }

    #[tokio::test]
    async fn test_builder_options() {
        let transport = UdpTransportBuilder::new("127.0.0.1:0".parse().unwrap())
            .recv_buffer_size(1 << 18)
            .send_buffer_size(1 << 18)
            .build()
            .unwrap();
        assert!(transport.local_addr().port() > 0);
    }
}
