//! TCP transport for Modbus gateways and TCP-native devices.

use std::io;
use std::time::Duration;

use bytes::BytesMut;
use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Default time allowed for establishing the connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Stream transport to a `host:port` endpoint.
pub struct TcpTransport {
    address: String,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    /// Creates a transport for the given `host:port`.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stream: None,
        }
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.stream.is_some() {
                return Ok(());
            }

            tracing::debug!("connecting to {}", self.address);
            let stream = tokio::time::timeout(
                self.connect_timeout,
                TcpStream::connect(self.address.as_str()),
            )
            .await
            .map_err(|_| Error::Timeout {
                timeout_ms: self.connect_timeout.as_millis() as u64,
            })??;

            if let Err(e) = stream.set_nodelay(true) {
                tracing::warn!("failed to set TCP_NODELAY on {}: {}", self.address, e);
            }

            self.stream = Some(stream);
            Ok(())
        })
    }

    fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("closed connection to {}", self.address);
        }
    }

    fn send<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
            stream.write_all(data).await?;
            Ok(())
        })
    }

    fn recv<'a>(&'a mut self, buf: &'a mut BytesMut) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
            match stream.read_buf(buf).await? {
                0 => Err(Error::Io(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection closed by peer",
                ))),
                n => Ok(n),
            }
        })
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn address(&self) -> &str {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_roundtrip_and_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 16];
                let n = socket.read(&mut buf).await.unwrap();
                socket.write_all(&buf[..n]).await.unwrap();
            }
        });

        let mut transport = TcpTransport::new(addr);
        transport.connect().await.unwrap();
        assert!(transport.is_connected());

        transport.send(b"ping").await.unwrap();
        let mut buf = BytesMut::new();
        while buf.len() < 4 {
            transport.recv(&mut buf).await.unwrap();
        }
        assert_eq!(&buf[..], b"ping");

        transport.disconnect();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.send(b"x").await.unwrap_err(),
            Error::NotConnected
        ));

        transport.connect().await.unwrap();
        assert!(transport.is_connected());
    }
}
