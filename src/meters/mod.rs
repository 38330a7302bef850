//! Meter strategies and the device capability surface.
//!
//! A [`Device`] is either a register-map device driven by a
//! [`Producer`](rs485::Producer) or a self-describing SunSpec device. Both
//! expose the same four operations against a supplied
//! [`ModbusClient`]:
//!
//! - `initialize` interrogates the device once and fills the descriptor
//! - `descriptor` returns what was learned, without bus access
//! - `probe` performs a single cheap read
//! - `query` reads the full register set for one polling cycle

pub mod measurement;
pub mod registry;
pub mod rs485;
pub mod sunspec;
pub mod transform;

use serde::Serialize;

use crate::connection::ModbusClient;
use crate::error::Result;

pub use measurement::{Measurement, MeasurementResult};
pub use registry::Registry;
pub use rs485::{Operation, Producer, Rs485Device};
pub use sunspec::SunSpecDevice;
pub use transform::{Encoding, Transform};

/// Static identification of a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceDescriptor {
    /// Meter type as configured, e.g. `SDM` or `SUNS`.
    #[serde(rename = "Type")]
    pub device_type: String,
    pub manufacturer: String,
    pub model: String,
    pub options: String,
    pub version: String,
    pub serial: String,
    /// Logical device index behind one slave id.
    #[serde(rename = "SubDevice")]
    pub subdevice: u8,
}

/// A meter addressed on a connection.
pub enum Device {
    /// Register-map device.
    Rs485(Rs485Device),
    /// SunSpec model device.
    SunSpec(SunSpecDevice),
}

impl Device {
    /// Performs one-time interrogation.
    ///
    /// The connection must have the device's slave selected. Failures are
    /// transient and retried by the caller.
    pub async fn initialize(&mut self, client: &mut dyn ModbusClient) -> Result<()> {
        match self {
            Self::Rs485(device) => device.initialize(client).await,
            Self::SunSpec(device) => device.initialize(client).await,
        }
    }

    /// Returns the device descriptor.
    #[must_use]
    pub const fn descriptor(&self) -> &DeviceDescriptor {
        match self {
            Self::Rs485(device) => device.descriptor(),
            Self::SunSpec(device) => device.descriptor(),
        }
    }

    /// Reads a single basic register, typically L1 voltage.
    pub async fn probe(&mut self, client: &mut dyn ModbusClient) -> Result<MeasurementResult> {
        match self {
            Self::Rs485(device) => device.probe(client).await,
            Self::SunSpec(device) => device.probe(client).await,
        }
    }

    /// Reads every supported register.
    ///
    /// A single failed read fails the whole call. NaN values are returned
    /// as-is.
    pub async fn query(&mut self, client: &mut dyn ModbusClient) -> Result<Vec<MeasurementResult>> {
        match self {
            Self::Rs485(device) => device.query(client).await,
            Self::SunSpec(device) => device.query(client).await,
        }
    }
}

/// Decodes text held in registers, dropping NUL and space padding.
pub(crate) fn register_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

impl From<Rs485Device> for Device {
    fn from(device: Rs485Device) -> Self {
        Self::Rs485(device)
    }
}

impl From<SunSpecDevice> for Device {
    fn from(device: SunSpecDevice) -> Self {
        Self::SunSpec(device)
    }
}
