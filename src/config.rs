//! Adapter and device configuration.
//!
//! [`Config`] is the deserializable shape of a configuration file.
//! [`ConfigHandler`] turns it, or command-line style device specs such as
//! `SDM:1@/dev/ttyUSB0`, into one [`Manager`] per adapter.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::connection::{self, Adapter, AdapterOptions};
use crate::error::{Error, Result};
use crate::handler::{Handler, HandlerConfig};
use crate::manager::Manager;
use crate::meters::{Device, Registry, Rs485Device, SunSpecDevice, sunspec};
use crate::protocol::Framing;
use crate::transport::Comset;

/// Communication parameters of one adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Serial device path, `host:port` or `mock`.
    pub device: String,
    /// Serial baud rate, 0 for the default.
    pub baudrate: u32,
    /// Serial line settings, e.g. `8N1`. Empty for the default.
    pub comset: String,
    /// Framing override.
    pub framing: Option<Framing>,
    /// Carry RTU frames over UDP.
    pub udp: bool,
}

/// One device to poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Meter type, e.g. `SDM` or `SUNS`.
    #[serde(rename = "type")]
    pub meter_type: String,
    /// Modbus slave id.
    pub id: u8,
    /// Logical device index behind the slave id.
    pub subdevice: u8,
    /// Optional display name.
    pub name: String,
    /// Adapter the device is attached to. May be omitted when exactly one
    /// adapter exists.
    pub adapter: String,
}

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub adapters: Vec<AdapterConfig>,
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    /// Parses a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for malformed input.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config(format!("invalid configuration: {e}")))
    }
}

struct Binding {
    manager: Manager,
    /// Plain Modbus TCP, where every device is treated as SunSpec.
    tcp: bool,
}

/// Creates managers and devices from configuration.
pub struct ConfigHandler<'a> {
    registry: &'a Registry,
    default_adapter: Option<String>,
    managers: BTreeMap<String, Binding>,
}

impl<'a> ConfigHandler<'a> {
    /// Creates a handler resolving meter types through `registry`.
    #[must_use]
    pub const fn new(registry: &'a Registry) -> Self {
        Self {
            registry,
            default_adapter: None,
            managers: BTreeMap::new(),
        }
    }

    /// Sets the adapter used by device specs without `@adapter`.
    #[must_use]
    pub fn default_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.default_adapter = Some(adapter.into());
        self
    }

    /// Creates every adapter, then every device, of `config`.
    ///
    /// # Errors
    ///
    /// Returns the first configuration error.
    pub fn apply(&mut self, config: &Config) -> Result<()> {
        for adapter in &config.adapters {
            self.create_adapter(adapter)?;
        }
        for device in &config.devices {
            self.create_device(device)?;
        }
        Ok(())
    }

    /// Opens an adapter unless one with the same device string exists.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid comset, a missing serial
    /// device or an unsupported framing.
    pub fn create_adapter(&mut self, config: &AdapterConfig) -> Result<()> {
        if config.device.is_empty() {
            return Err(Error::config("adapter without device"));
        }
        if self.managers.contains_key(&config.device) {
            return Ok(());
        }

        let mut options = AdapterOptions::default()
            .baud_rate(config.baudrate)
            .udp(config.udp);
        if !config.comset.is_empty() {
            options = options.comset(config.comset.parse::<Comset>()?);
        }
        if let Some(framing) = config.framing {
            options = options.framing(framing);
        }

        self.open(&config.device, &options)
    }

    fn open(&mut self, adapter: &str, options: &AdapterOptions) -> Result<()> {
        let connection = connection::open(adapter, options)?;
        let tcp = matches!(Adapter::parse(adapter), Adapter::Network(_))
            && matches!(options.framing, None | Some(Framing::Tcp))
            && !options.udp;

        self.managers.insert(
            adapter.to_string(),
            Binding {
                manager: Manager::new(connection),
                tcp,
            },
        );
        Ok(())
    }

    fn binding(&mut self, adapter: &str) -> Result<&mut Binding> {
        if !self.managers.contains_key(adapter) {
            self.open(adapter, &AdapterOptions::default())?;
        }
        self.managers
            .get_mut(adapter)
            .ok_or_else(|| Error::config(format!("adapter {adapter} not available")))
    }

    fn create_meter(&self, meter_type: &str, subdevice: u8, tcp: bool) -> Result<Device> {
        let meter_type = meter_type.trim().to_ascii_uppercase();
        if meter_type.is_empty() {
            return Err(Error::config("empty meter type"));
        }

        if tcp || sunspec::is_sunspec_type(&meter_type) {
            return Ok(SunSpecDevice::new(&meter_type, subdevice).into());
        }
        let producer = self.registry.create(&meter_type)?;
        Ok(Rs485Device::new(producer).into())
    }

    fn add(&mut self, adapter: &str, meter_type: &str, id: u8, subdevice: u8) -> Result<()> {
        let tcp = self.binding(adapter)?.tcp;
        let device = self.create_meter(meter_type, subdevice, tcp)?;
        self.binding(adapter)?
            .manager
            .add(id, subdevice, device)
            .map_err(|e| Error::config(format!("{meter_type}:{id} on {adapter}: {e}")))?;

        tracing::info!("config: added {} device {}.{} on {}", meter_type, id, subdevice, adapter);
        Ok(())
    }

    /// Adds a configured device.
    ///
    /// A device without adapter uses the only configured adapter.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an ambiguous adapter, an unknown
    /// meter type or a duplicate id.
    pub fn create_device(&mut self, config: &DeviceConfig) -> Result<()> {
        let adapter = if config.adapter.is_empty() {
            let mut adapters = self.managers.keys();
            match (adapters.next(), adapters.next()) {
                (Some(adapter), None) => {
                    tracing::info!(
                        "config: using default adapter {} for device {}:{}",
                        adapter,
                        config.meter_type,
                        config.id
                    );
                    adapter.clone()
                }
                _ => {
                    return Err(Error::config(format!(
                        "missing adapter for device {}:{}",
                        config.meter_type, config.id
                    )));
                }
            }
        } else {
            config.adapter.clone()
        };

        self.add(&adapter, &config.meter_type, config.id, config.subdevice)
    }

    /// Adds a device from a `TYPE:ID[.SUB][@ADAPTER]` spec.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a malformed spec or any error of
    /// [`create_device`](Self::create_device).
    pub fn create_device_from_spec(&mut self, spec: &str) -> Result<()> {
        let (meter, adapter) = match spec.split_once('@') {
            Some((_, adapter)) if adapter.contains('@') => {
                return Err(Error::config(format!("cannot parse device spec {spec}")));
            }
            Some((meter, adapter)) => (meter, adapter.to_string()),
            None => (spec, self.default_adapter.clone().unwrap_or_default()),
        };
        if adapter.is_empty() {
            return Err(Error::config(format!("missing adapter for device spec {spec}")));
        }

        let Some((meter_type, address)) = meter.split_once(':') else {
            return Err(Error::config(format!("cannot parse device definition {meter}")));
        };
        if meter_type.trim().is_empty() {
            return Err(Error::config(format!("meter type empty in {meter}")));
        }

        let (id, subdevice) = match address.split_once('.') {
            Some((id, subdevice)) => (id, subdevice),
            None => (address, "0"),
        };
        let id = id
            .parse::<u8>()
            .map_err(|e| Error::config(format!("invalid device id {id}: {e}")))?;
        let subdevice = subdevice
            .parse::<u8>()
            .map_err(|e| Error::config(format!("invalid subdevice {subdevice}: {e}")))?;

        self.add(&adapter, meter_type, id, subdevice)
    }

    /// Iterates adapters and their managers in adapter order.
    pub fn managers(&self) -> impl Iterator<Item = (&str, &Manager)> {
        self.managers
            .iter()
            .map(|(adapter, binding)| (adapter.as_str(), &binding.manager))
    }

    /// Creates one handler per adapter, numbered from 1.
    #[must_use]
    pub fn into_handlers(self, config: HandlerConfig) -> Vec<Handler> {
        self.managers
            .into_values()
            .enumerate()
            .map(|(index, binding)| Handler::with_config(index + 1, binding.manager, config))
            .collect()
    }
}
