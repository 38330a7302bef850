//! SunSpec devices.
//!
//! SunSpec devices describe themselves: a `SunS` marker at a well-known base
//! address is followed by a chain of `(id, length, data)` model blocks
//! terminated by id `0xFFFF`. Each common block (model 1) starts a new
//! logical device, so one slave may expose several sub-devices.
//!
//! Supported models:
//!
//! - 101, 102, 103: single, split and three phase inverters
//! - 201, 202, 203, 204: single, split and three phase meters
//!
//! Values are integers with a separate power-of-ten scale factor register.

use super::{DeviceDescriptor, Measurement, MeasurementResult, register_text};
use crate::connection::ModbusClient;
use crate::error::{Error, Result};
use crate::protocol::MAX_READ_REGISTERS;

/// `SunS` as two big-endian registers.
pub const SUNSPEC_SIGNATURE: [u8; 4] = *b"SunS";

/// Base addresses probed for the signature, in order.
pub const BASE_ADDRESSES: [u16; 3] = [40000, 0, 50000];

/// Model id terminating the chain.
const END_OF_CHAIN: u16 = 0xFFFF;

/// Common block model id.
const COMMON_MODEL: u16 = 1;

/// Guard against malformed chains.
const MAX_MODELS: usize = 64;

/// Meter types served by this device variant.
pub const SUNSPEC_TYPES: [&str; 6] = ["KOSTAL", "SE", "SMA", "SOLAREDGE", "SUNS", "SUNSPEC"];

/// Returns true if `meter_type` names a SunSpec device.
#[must_use]
pub fn is_sunspec_type(meter_type: &str) -> bool {
    SUNSPEC_TYPES
        .iter()
        .any(|t| t.eq_ignore_ascii_case(meter_type))
}

/// Register representation of a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Uint16,
    Int16,
    Acc32,
}

/// A value inside a model block.
#[derive(Debug, Clone, Copy)]
struct Point {
    measurement: Measurement,
    offset: usize,
    kind: Kind,
    /// Offset of the scale factor register.
    scale: usize,
    /// Unit conversion applied after scaling.
    divider: f64,
}

const fn point(measurement: Measurement, offset: usize, kind: Kind, scale: usize) -> Point {
    Point {
        measurement,
        offset,
        kind,
        scale,
        divider: 1.0,
    }
}

const fn converted(measurement: Measurement, offset: usize, kind: Kind, scale: usize, divider: f64) -> Point {
    Point {
        measurement,
        offset,
        kind,
        scale,
        divider,
    }
}

/// Models 101 to 103. Power factor is in percent, energy in Wh.
const INVERTER_POINTS: &[Point] = &[
    point(Measurement::Current, 0, Kind::Uint16, 4),
    point(Measurement::CurrentL1, 1, Kind::Uint16, 4),
    point(Measurement::CurrentL2, 2, Kind::Uint16, 4),
    point(Measurement::CurrentL3, 3, Kind::Uint16, 4),
    point(Measurement::VoltageL1, 8, Kind::Uint16, 11),
    point(Measurement::VoltageL2, 9, Kind::Uint16, 11),
    point(Measurement::VoltageL3, 10, Kind::Uint16, 11),
    point(Measurement::Power, 12, Kind::Int16, 13),
    point(Measurement::Frequency, 14, Kind::Uint16, 15),
    point(Measurement::ApparentPower, 16, Kind::Int16, 17),
    point(Measurement::ReactivePower, 18, Kind::Int16, 19),
    converted(Measurement::Cosphi, 20, Kind::Int16, 21, 100.0),
    converted(Measurement::Export, 22, Kind::Acc32, 24, 1000.0),
    point(Measurement::DCCurrent, 25, Kind::Uint16, 26),
    point(Measurement::DCVoltage, 27, Kind::Uint16, 28),
    point(Measurement::DCPower, 29, Kind::Int16, 30),
    point(Measurement::HeatSinkTemp, 31, Kind::Int16, 35),
];

/// Models 201 to 204.
const METER_POINTS: &[Point] = &[
    point(Measurement::Current, 0, Kind::Int16, 4),
    point(Measurement::CurrentL1, 1, Kind::Int16, 4),
    point(Measurement::CurrentL2, 2, Kind::Int16, 4),
    point(Measurement::CurrentL3, 3, Kind::Int16, 4),
    point(Measurement::Voltage, 5, Kind::Int16, 13),
    point(Measurement::VoltageL1, 6, Kind::Int16, 13),
    point(Measurement::VoltageL2, 7, Kind::Int16, 13),
    point(Measurement::VoltageL3, 8, Kind::Int16, 13),
    point(Measurement::Frequency, 14, Kind::Int16, 15),
    point(Measurement::Power, 16, Kind::Int16, 20),
    point(Measurement::PowerL1, 17, Kind::Int16, 20),
    point(Measurement::PowerL2, 18, Kind::Int16, 20),
    point(Measurement::PowerL3, 19, Kind::Int16, 20),
    point(Measurement::ApparentPower, 21, Kind::Int16, 25),
    point(Measurement::ApparentPowerL1, 22, Kind::Int16, 25),
    point(Measurement::ApparentPowerL2, 23, Kind::Int16, 25),
    point(Measurement::ApparentPowerL3, 24, Kind::Int16, 25),
    point(Measurement::ReactivePower, 26, Kind::Int16, 30),
    point(Measurement::ReactivePowerL1, 27, Kind::Int16, 30),
    point(Measurement::ReactivePowerL2, 28, Kind::Int16, 30),
    point(Measurement::ReactivePowerL3, 29, Kind::Int16, 30),
    converted(Measurement::Cosphi, 31, Kind::Int16, 35, 100.0),
    converted(Measurement::CosphiL1, 32, Kind::Int16, 35, 100.0),
    converted(Measurement::CosphiL2, 33, Kind::Int16, 35, 100.0),
    converted(Measurement::CosphiL3, 34, Kind::Int16, 35, 100.0),
    converted(Measurement::Export, 36, Kind::Acc32, 52, 1000.0),
    converted(Measurement::ExportL1, 38, Kind::Acc32, 52, 1000.0),
    converted(Measurement::ExportL2, 40, Kind::Acc32, 52, 1000.0),
    converted(Measurement::ExportL3, 42, Kind::Acc32, 52, 1000.0),
    converted(Measurement::Import, 44, Kind::Acc32, 52, 1000.0),
    converted(Measurement::ImportL1, 46, Kind::Acc32, 52, 1000.0),
    converted(Measurement::ImportL2, 48, Kind::Acc32, 52, 1000.0),
    converted(Measurement::ImportL3, 50, Kind::Acc32, 52, 1000.0),
];

fn points(model: u16) -> Option<&'static [Point]> {
    match model {
        101..=103 => Some(INVERTER_POINTS),
        201..=204 => Some(METER_POINTS),
        _ => None,
    }
}

/// Location of one model in the register space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ModelBlock {
    id: u16,
    /// First data register, after the id/length header.
    address: u16,
    length: u16,
}

/// Register contents of a model block.
struct BlockData<'a>(&'a [u8]);

impl BlockData<'_> {
    fn register(&self, offset: usize) -> Option<u16> {
        let b = self.0.get(offset * 2..offset * 2 + 2)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Returns the scaled value, NaN for "not implemented" markers.
    fn value(&self, point: &Point, kostal: bool) -> f64 {
        let raw = match point.kind {
            Kind::Uint16 => match self.register(point.offset) {
                Some(0xFFFF) | None => return f64::NAN,
                Some(v) => f64::from(v),
            },
            Kind::Int16 => match self.register(point.offset) {
                Some(0x8000) | None => return f64::NAN,
                Some(v) => f64::from(i16::from_be_bytes(v.to_be_bytes())),
            },
            Kind::Acc32 => {
                let (Some(hi), Some(lo)) = (
                    self.register(point.offset),
                    self.register(point.offset + 1),
                ) else {
                    return f64::NAN;
                };
                let v = (u32::from(hi) << 16) | u32::from(lo);
                if kostal && v > 0x7FFF_FFFF {
                    // Kostal reports negative energy as two's complement
                    f64::from(i32::from_be_bytes(v.to_be_bytes()).unsigned_abs())
                } else {
                    f64::from(v)
                }
            }
        };

        let scale = match self.register(point.scale) {
            Some(0x8000) | None => return f64::NAN,
            Some(sf) => i32::from(i16::from_be_bytes(sf.to_be_bytes())),
        };

        raw * 10f64.powi(scale) / point.divider
    }
}

/// Number of addressable registers.
const REGISTER_SPACE: u32 = 0x1_0000;

/// Reads `length` registers, splitting into protocol-sized requests.
async fn read_registers(client: &mut dyn ModbusClient, address: u16, length: u16) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(length as usize * 2);
    let mut offset = 0;
    while offset < length {
        let count = (length - offset).min(MAX_READ_REGISTERS);
        let start = address
            .checked_add(offset)
            .ok_or_else(|| Error::protocol("model block exceeds register space"))?;
        data.extend_from_slice(&client.read_holding_registers(start, count).await?);
        offset += count;
    }
    Ok(data)
}

/// Device discovered through the SunSpec model chain.
#[derive(Debug, Clone)]
pub struct SunSpecDevice {
    descriptor: DeviceDescriptor,
    models: Vec<ModelBlock>,
}

impl SunSpecDevice {
    /// Creates an uninitialized device.
    #[must_use]
    pub fn new(meter_type: &str, subdevice: u8) -> Self {
        Self {
            descriptor: DeviceDescriptor {
                device_type: meter_type.to_string(),
                manufacturer: meter_type.to_string(),
                subdevice,
                ..Default::default()
            },
            models: Vec::new(),
        }
    }

    pub(crate) const fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Returns the ids of the supported models found during initialization.
    #[must_use]
    pub fn model_ids(&self) -> Vec<u16> {
        self.models.iter().map(|m| m.id).collect()
    }

    async fn find_base(client: &mut dyn ModbusClient) -> Result<u16> {
        let mut last_error = None;
        for base in BASE_ADDRESSES {
            match client.read_holding_registers(base, 2).await {
                Ok(bytes) if bytes[..] == SUNSPEC_SIGNATURE => return Ok(base),
                Ok(_) => {}
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Device {
            message: "sunspec: device not found".into(),
        }))
    }

    /// Walks the model chain, grouping models into logical devices.
    async fn discover(client: &mut dyn ModbusClient, base: u16) -> Result<Vec<Vec<ModelBlock>>> {
        let mut devices: Vec<Vec<ModelBlock>> = Vec::new();
        let mut address = u32::from(base) + 2;

        for _ in 0..MAX_MODELS {
            if address + 2 > REGISTER_SPACE {
                break;
            }
            let header_address = address as u16;

            let header = match client.read_holding_registers(header_address, 2).await {
                Ok(header) if header.len() == 4 => header,
                Ok(_) => return Err(Error::protocol("short sunspec model header")),
                Err(e) if devices.is_empty() => return Err(e),
                Err(e) => {
                    tracing::warn!("sunspec: model chain partially read: {}", e);
                    break;
                }
            };

            let id = u16::from_be_bytes([header[0], header[1]]);
            let length = u16::from_be_bytes([header[2], header[3]]);
            if id == END_OF_CHAIN || length == 0 {
                break;
            }

            let end = address + 2 + u32::from(length);
            if end > REGISTER_SPACE {
                return Err(Error::protocol(format!(
                    "sunspec model {id} at {header_address} with length {length} exceeds register space"
                )));
            }

            let block = ModelBlock {
                id,
                address: header_address + 2,
                length,
            };
            match devices.last_mut() {
                Some(models) if id != COMMON_MODEL => models.push(block),
                _ => devices.push(vec![block]),
            }

            address = end;
        }

        Ok(devices)
    }

    async fn read_common(&mut self, client: &mut dyn ModbusClient, common: ModelBlock) -> Result<()> {
        if common.id != COMMON_MODEL || common.length < 64 {
            return Err(Error::Device {
                message: format!("sunspec: invalid common block (model {})", common.id),
            });
        }

        let data = read_registers(client, common.address, 64).await?;
        self.descriptor.manufacturer = register_text(&data[0..32]);
        self.descriptor.model = register_text(&data[32..64]);
        self.descriptor.options = register_text(&data[64..80]);
        self.descriptor.version = register_text(&data[80..96]);
        self.descriptor.serial = register_text(&data[96..128]);
        Ok(())
    }

    pub(crate) async fn initialize(&mut self, client: &mut dyn ModbusClient) -> Result<()> {
        let base = Self::find_base(client).await?;
        let devices = Self::discover(client, base).await?;

        let subdevice = self.descriptor.subdevice;
        let Some(models) = devices.into_iter().nth(subdevice as usize) else {
            return Err(Error::Device {
                message: format!("sunspec: subdevice {subdevice} not found"),
            });
        };

        self.read_common(client, models[0]).await?;

        let mut supported: Vec<ModelBlock> = models
            .into_iter()
            .skip(1)
            .filter(|m| points(m.id).is_some())
            .collect();
        // A three phase inverter may also publish the single phase model
        if supported.iter().any(|m| m.id == 103) {
            supported.retain(|m| !matches!(m.id, 101 | 102));
        }

        tracing::debug!(
            "sunspec: {} {} at base {} with models {:?}",
            self.descriptor.manufacturer,
            self.descriptor.model,
            base,
            supported.iter().map(|m| m.id).collect::<Vec<_>>()
        );

        self.models = supported;
        Ok(())
    }

    fn is_kostal(&self) -> bool {
        self.descriptor.manufacturer.eq_ignore_ascii_case("KOSTAL")
    }

    pub(crate) async fn probe(&self, client: &mut dyn ModbusClient) -> Result<MeasurementResult> {
        let model = self.models.first().ok_or(Error::NotInitialized)?;
        let data = read_registers(client, model.address, model.length).await?;
        let block = BlockData(&data);

        let point = points(model.id)
            .and_then(|points| points.iter().find(|p| p.measurement == Measurement::VoltageL1))
            .ok_or_else(|| Error::Device {
                message: format!("sunspec: model {} has no probe point", model.id),
            })?;

        let value = block.value(point, self.is_kostal());
        if value.is_nan() {
            return Err(Error::Device {
                message: "sunspec: probe returned NaN".into(),
            });
        }
        Ok(MeasurementResult::new(point.measurement, value))
    }

    pub(crate) async fn query(&self, client: &mut dyn ModbusClient) -> Result<Vec<MeasurementResult>> {
        if self.models.is_empty() {
            return Err(Error::NotInitialized);
        }

        let kostal = self.is_kostal();
        let mut results = Vec::new();
        for model in &self.models {
            let Some(points) = points(model.id) else {
                continue;
            };
            let data = read_registers(client, model.address, model.length).await?;
            let block = BlockData(&data);
            results.extend(
                points
                    .iter()
                    .map(|p| MeasurementResult::new(p.measurement, block.value(p, kostal))),
            );
        }
        Ok(results)
    }
}
