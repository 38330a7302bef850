//! Datagram transport for RTU-over-UDP gateways.

use bytes::BytesMut;
use futures::future::BoxFuture;
use tokio::net::UdpSocket;

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Largest datagram a gateway is expected to return.
const MAX_DATAGRAM_SIZE: usize = 512;

/// Connected UDP socket to a `host:port` gateway.
pub struct UdpTransport {
    address: String,
    socket: Option<UdpSocket>,
}

impl UdpTransport {
    /// Creates a transport for the given `host:port`.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            socket: None,
        }
    }
}

impl Transport for UdpTransport {
    fn connect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.socket.is_some() {
                return Ok(());
            }

            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(self.address.as_str()).await?;
            tracing::debug!("bound {} for {}", socket.local_addr()?, self.address);

            self.socket = Some(socket);
            Ok(())
        })
    }

    fn disconnect(&mut self) {
        self.socket = None;
    }

    fn send<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let socket = self.socket.as_ref().ok_or(Error::NotConnected)?;
            socket.send(data).await?;
            Ok(())
        })
    }

    fn recv<'a>(&'a mut self, buf: &'a mut BytesMut) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let socket = self.socket.as_ref().ok_or(Error::NotConnected)?;
            buf.reserve(MAX_DATAGRAM_SIZE);
            Ok(socket.recv_buf(buf).await?)
        })
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    fn address(&self) -> &str {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_roundtrip() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = peer.local_addr().unwrap().to_string();

        let mut transport = UdpTransport::new(addr);
        transport.connect().await.unwrap();
        transport.send(&[0x01, 0x04]).await.unwrap();

        let mut datagram = [0u8; 8];
        let (n, from) = peer.recv_from(&mut datagram).await.unwrap();
        assert_eq!(&datagram[..n], &[0x01, 0x04]);
        peer.send_to(&[0x01, 0x84, 0x02], from).await.unwrap();

        let mut buf = BytesMut::new();
        let n = transport.recv(&mut buf).await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..], &[0x01, 0x84, 0x02]);
    }
}
