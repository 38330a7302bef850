//! Serial RS-485 transport implementation.

use std::fmt;
use std::io;
use std::str::FromStr;

use bytes::BytesMut;
use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Default baud rate for RS-485 meters.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Data bits, parity and stop bits of a serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Comset {
    /// 8 data bits, no parity, 1 stop bit.
    #[default]
    N81,
    /// 8 data bits, even parity, 1 stop bit.
    E81,
    /// 8 data bits, odd parity, 1 stop bit.
    O81,
    /// 8 data bits, no parity, 2 stop bits.
    N82,
}

impl Comset {
    /// Returns the line parity.
    #[must_use]
    pub const fn parity(self) -> Parity {
        match self {
            Self::N81 | Self::N82 => Parity::None,
            Self::E81 => Parity::Even,
            Self::O81 => Parity::Odd,
        }
    }

    /// Returns the number of stop bits.
    #[must_use]
    pub const fn stop_bits(self) -> StopBits {
        match self {
            Self::N82 => StopBits::Two,
            _ => StopBits::One,
        }
    }
}

impl FromStr for Comset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "8N1" => Ok(Self::N81),
            "8E1" => Ok(Self::E81),
            "8O1" => Ok(Self::O81),
            "8N2" => Ok(Self::N82),
            _ => Err(Error::config(format!("invalid comset {s:?}"))),
        }
    }
}

impl fmt::Display for Comset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::N81 => "8N1",
            Self::E81 => "8E1",
            Self::O81 => "8O1",
            Self::N82 => "8N2",
        })
    }
}

/// Configuration for serial transport.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Line settings.
    pub comset: Comset,
}

impl SerialConfig {
    /// Creates a new serial configuration with default settings.
    #[must_use]
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            comset: Comset::default(),
        }
    }

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
}

/// Serial transport over a local tty.
pub struct SerialTransport {
    config: SerialConfig,
    stream: Option<SerialStream>,
}

impl SerialTransport {
    /// Creates a new serial transport with the given configuration.
    #[must_use]
    pub const fn new(config: SerialConfig) -> Self {
        Self {
            config,
            stream: None,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &SerialConfig {
        &self.config
    }
}

impl Transport for SerialTransport {
    fn connect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.stream.is_some() {
                return Ok(());
            }

            tracing::info!(
                "opening serial port {} ({} baud, {})",
                self.config.port,
                self.config.baud_rate,
                self.config.comset
            );

            let stream = tokio_serial::new(&self.config.port, self.config.baud_rate)
                .data_bits(DataBits::Eight)
                .parity(self.config.comset.parity())
                .stop_bits(self.config.comset.stop_bits())
                .open_native_async()?;

            self.stream = Some(stream);
            Ok(())
        })
    }

    fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("closed serial port {}", self.config.port);
        }
    }

    fn send<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
            stream.write_all(data).await?;
            stream.flush().await?;
            Ok(())
        })
    }

    fn recv<'a>(&'a mut self, buf: &'a mut BytesMut) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
            match stream.read_buf(buf).await? {
                0 => Err(Error::Io(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "serial port closed",
                ))),
                n => Ok(n),
            }
        })
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn address(&self) -> &str {
        &self.config.port
    }
}
