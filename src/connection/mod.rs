//! Connections: a byte link plus the Modbus client speaking over it.
//!
//! A [`Connection`] is owned by exactly one [`Manager`](crate::Manager) and
//! is driven by a single polling task, so none of its operations lock.

pub mod bus;
pub mod mock;

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::{Error, Result};
use crate::protocol::{Framing, FunctionCode, MAX_READ_REGISTERS};
use crate::transport::{Comset, SerialConfig};

pub use bus::BusConnection;
pub use mock::{MockClient, MockConnection};

/// Register-level Modbus client.
pub trait ModbusClient: Send {
    /// Reads `quantity` holding registers starting at `address`.
    fn read_holding_registers(&mut self, address: u16, quantity: u16) -> BoxFuture<'_, Result<Bytes>>;

    /// Reads `quantity` input registers starting at `address`.
    fn read_input_registers(&mut self, address: u16, quantity: u16) -> BoxFuture<'_, Result<Bytes>>;

    /// Dispatches a read by function code.
    fn read(
        &mut self,
        function: FunctionCode,
        address: u16,
        quantity: u16,
    ) -> BoxFuture<'_, Result<Bytes>> {
        match function {
            FunctionCode::ReadHoldingRegisters => self.read_holding_registers(address, quantity),
            FunctionCode::ReadInputRegisters => self.read_input_registers(address, quantity),
        }
    }
}

/// A physical or simulated link to a set of slaves.
pub trait Connection: Send {
    /// Returns the endpoint string (device path or `host:port`).
    fn address(&self) -> &str;

    /// Returns the protocol client for the currently selected slave.
    fn client(&mut self) -> &mut dyn ModbusClient;

    /// Selects the slave address for subsequent operations.
    ///
    /// Serial-framed links wait for the bus to settle when the address
    /// changes.
    fn slave(&mut self, id: u8) -> BoxFuture<'_, ()>;

    /// Sets the response timeout and returns the previous one.
    fn timeout(&mut self, timeout: Duration) -> Duration;

    /// Releases the link. The next operation reopens it.
    fn close(&mut self);

    /// Injects a logger for raw bus traffic.
    fn logger(&mut self, logger: Arc<dyn BusLogger>);
}

/// Direction of a logged frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sent => "->",
            Self::Received => "<-",
        })
    }
}

/// Sink for raw bus traffic.
pub trait BusLogger: Send + Sync {
    /// Called for every frame written to or read from the link.
    fn frame(&self, address: &str, direction: Direction, data: &[u8]);
}

/// Discards all traffic. The default logger.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl BusLogger for NoopLogger {
    fn frame(&self, _address: &str, _direction: Direction, _data: &[u8]) {}
}

/// Renders traffic as hex at `trace` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl BusLogger for TracingLogger {
    fn frame(&self, address: &str, direction: Direction, data: &[u8]) {
        tracing::trace!(target: "meterd::bus", "{} {} {}", address, direction, hex::encode(data));
    }
}

/// Rejects reads the protocol cannot express.
pub(crate) fn check_quantity(quantity: u16) -> Result<()> {
    if quantity == 0 || quantity > MAX_READ_REGISTERS {
        return Err(Error::InvalidOperation {
            reason: format!("cannot read {quantity} registers"),
        });
    }
    Ok(())
}

/// Kind of endpoint named by an adapter string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Adapter {
    /// In-memory simulated bus.
    Mock,
    /// Network endpoint (`host:port`).
    Network(String),
    /// Local serial device path.
    Serial(String),
}

impl Adapter {
    /// Classifies an adapter string.
    ///
    /// `mock` selects the simulated bus, anything ending in `:<port>` is a
    /// network endpoint, everything else a serial device.
    #[must_use]
    pub fn parse(adapter: &str) -> Self {
        if adapter == "mock" {
            return Self::Mock;
        }
        match adapter.rsplit_once(':') {
            Some((_, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
                Self::Network(adapter.to_string())
            }
            _ => Self::Serial(adapter.to_string()),
        }
    }
}

/// Parameters applied when opening an adapter.
#[derive(Debug, Clone, Default)]
pub struct AdapterOptions {
    /// Baud rate for serial adapters (0 selects the default).
    pub baud_rate: u32,
    /// Line settings for serial adapters.
    pub comset: Comset,
    /// Framing override. Network adapters default to TCP, serial to RTU.
    pub framing: Option<Framing>,
    /// Carry RTU frames over UDP instead of TCP.
    pub udp: bool,
}

impl AdapterOptions {
    /// Sets the baud rate.
    #[must_use]
    pub const fn baud_rate(mut self, rate: u32) -> Self {
        self.baud_rate = rate;
        self
    }

    /// Sets the line settings.
    #[must_use]
    pub const fn comset(mut self, comset: Comset) -> Self {
        self.comset = comset;
        self
    }

    /// Overrides the framing.
    #[must_use]
    pub const fn framing(mut self, framing: Framing) -> Self {
        self.framing = Some(framing);
        self
    }

    /// Selects UDP for network adapters.
    #[must_use]
    pub const fn udp(mut self, udp: bool) -> Self {
        self.udp = udp;
        self
    }
}

/// Opens a connection for an adapter string.
///
/// Nothing touches the link until the first read.
///
/// # Errors
///
/// Returns a configuration error for a missing serial device or an
/// unsupported framing/link combination.
pub fn open(adapter: &str, options: &AdapterOptions) -> Result<Box<dyn Connection>> {
    match Adapter::parse(adapter) {
        Adapter::Mock => Ok(Box::new(MockConnection::new())),
        Adapter::Network(address) => {
            let framing = options.framing.unwrap_or(Framing::Tcp);
            tracing::info!("creating {:?} connection for {}", framing, address);
            match (framing, options.udp) {
                (Framing::Tcp, false) => Ok(Box::new(BusConnection::tcp(address))),
                (Framing::Rtu, false) => Ok(Box::new(BusConnection::rtu_over_tcp(address))),
                (Framing::Ascii, false) => Ok(Box::new(BusConnection::ascii_over_tcp(address))),
                (Framing::Rtu, true) => Ok(Box::new(BusConnection::rtu_over_udp(address))),
                (framing, true) => Err(Error::config(format!(
                    "{framing:?} framing is not supported over UDP"
                ))),
            }
        }
        Adapter::Serial(path) => {
            if !Path::new(&path).exists() {
                return Err(Error::config(format!("serial device {path} not found")));
            }
            let mut config = SerialConfig::new(path).comset(options.comset);
            if options.baud_rate > 0 {
                config = config.baud_rate(options.baud_rate);
            }
            tracing::info!(
                "creating serial connection for {} ({} baud, {})",
                config.port,
                config.baud_rate,
                config.comset
            );
            match options.framing.unwrap_or(Framing::Rtu) {
                Framing::Rtu => Ok(Box::new(BusConnection::rtu(config))),
                Framing::Ascii => Ok(Box::new(BusConnection::ascii(config))),
                Framing::Tcp => Err(Error::config(format!(
                    "TCP framing requires a network adapter, got {}",
                    config.port
                ))),
            }
        }
    }
}
