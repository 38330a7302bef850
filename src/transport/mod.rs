//! Byte links carrying Modbus frames.
//!
//! A transport moves raw bytes only. Framing, checksums and request/response
//! matching live in [`crate::connection::BusConnection`].

pub mod serial;
pub mod tcp;
pub mod udp;

use bytes::BytesMut;
use futures::future::BoxFuture;

use crate::error::Result;

/// Trait for byte link implementations.
pub trait Transport: Send {
    /// Opens the link. Does nothing if already open.
    fn connect(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Releases the underlying handle. The next [`connect`](Self::connect)
    /// reopens it.
    fn disconnect(&mut self);

    /// Writes a complete frame.
    fn send<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Reads whatever is available into `buf`, returning the byte count.
    ///
    /// Callers bound the wait with their own deadline.
    fn recv<'a>(&'a mut self, buf: &'a mut BytesMut) -> BoxFuture<'a, Result<usize>>;

    /// Returns true if connected.
    fn is_connected(&self) -> bool;

    /// Returns the endpoint this link talks to.
    fn address(&self) -> &str;
}

pub use serial::{Comset, SerialConfig, SerialTransport};
pub use tcp::TcpTransport;
pub use udp::UdpTransport;
