//! ABB A/B-series meters.
//!
//! Values are scaled integers in holding registers. All-ones register
//! contents mean "not available" and decode to NaN.

use futures::future::BoxFuture;

use super::{Operation, Opcodes, Producer};
use crate::connection::ModbusClient;
use crate::error::Result;
use crate::meters::{DeviceDescriptor, Encoding, Measurement, Transform, register_text};
use crate::protocol::FunctionCode;

/// Serial number register (2 registers).
const MID_SERIAL: u16 = 0x8900;

/// Firmware version register (8 registers of text).
const MID_FIRMWARE: u16 = 0x8908;

/// Meter type register (6 registers of text).
const MID_TYPE: u16 = 0x8960;

/// Register map of the ABB A/B-series.
#[derive(Debug, Clone)]
pub struct AbbProducer {
    opcodes: Opcodes,
}

impl AbbProducer {
    /// Creates the producer.
    #[must_use]
    pub fn new() -> Self {
        use Measurement::{
            Cosphi, CosphiL1, CosphiL2, CosphiL3, CurrentL1, CurrentL2, CurrentL3, Export,
            ExportL1, ExportL2, ExportL3, Frequency, Import, ImportL1, ImportL2, ImportL3, Power,
            PowerL1, PowerL2, PowerL3, VoltageL1, VoltageL2, VoltageL3,
        };

        let opcodes = Opcodes::from([
            (VoltageL1, 0x5B00),
            (VoltageL2, 0x5B02),
            (VoltageL3, 0x5B04),
            (CurrentL1, 0x5B0C),
            (CurrentL2, 0x5B0E),
            (CurrentL3, 0x5B10),
            (Cosphi, 0x5B3A),
            (CosphiL1, 0x5B3B),
            (CosphiL2, 0x5B3C),
            (CosphiL3, 0x5B3D),
            (Frequency, 0x5B2C),
            (Power, 0x5B14),
            (PowerL1, 0x5B16),
            (PowerL2, 0x5B18),
            (PowerL3, 0x5B1A),
            (Import, 0x5000),
            (ImportL1, 0x5460),
            (ImportL2, 0x5464),
            (ImportL3, 0x5468),
            (Export, 0x5004),
            (ExportL1, 0x546C),
            (ExportL2, 0x5470),
            (ExportL3, 0x5474),
        ]);

        Self { opcodes }
    }

    fn operation(&self, measurement: Measurement) -> Option<Operation> {
        use Measurement as M;

        let (encoding, scaler) = match measurement {
            M::VoltageL1 | M::VoltageL2 | M::VoltageL3 => (Encoding::Uint32, 10.0),
            M::CurrentL1 | M::CurrentL2 | M::CurrentL3 => (Encoding::Uint32, 100.0),
            M::Cosphi | M::CosphiL1 | M::CosphiL2 | M::CosphiL3 => (Encoding::Int16, 1000.0),
            M::Frequency => (Encoding::Uint16, 100.0),
            M::Power | M::PowerL1 | M::PowerL2 | M::PowerL3 => (Encoding::Int32, 100.0),
            _ => (Encoding::Uint64, 100.0),
        };

        Some(Operation {
            function: FunctionCode::ReadHoldingRegisters,
            address: self.opcodes.get(measurement)?,
            count: (encoding.size() / 2) as u16,
            measurement,
            transform: Transform::new(encoding).scaled(scaler).nan_aware(),
        })
    }
}

impl Default for AbbProducer {
    fn default() -> Self {
        Self::new()
    }
}

impl Producer for AbbProducer {
    fn type_name(&self) -> &'static str {
        "ABB"
    }

    fn description(&self) -> &'static str {
        "ABB A/B-Series meters"
    }

    fn produce(&self) -> Vec<Operation> {
        self.opcodes
            .iter()
            .filter_map(|(measurement, _)| self.operation(measurement))
            .collect()
    }

    fn probe(&self) -> Operation {
        Operation {
            function: FunctionCode::ReadHoldingRegisters,
            address: 0x5B00,
            count: 2,
            measurement: Measurement::VoltageL1,
            transform: Transform::new(Encoding::Uint32).scaled(10.0).nan_aware(),
        }
    }

    /// Reads the MID identification block. Missing registers are ignored.
    fn initialize<'a>(
        &'a self,
        client: &'a mut dyn ModbusClient,
        descriptor: &'a mut DeviceDescriptor,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Ok(bytes) = client.read_holding_registers(MID_SERIAL, 2).await {
                if let Ok(raw) = <[u8; 4]>::try_from(&bytes[..]) {
                    descriptor.serial = format!("{:4x}", u32::from_be_bytes(raw));
                }
            }
            if let Ok(bytes) = client.read_holding_registers(MID_FIRMWARE, 8).await {
                descriptor.version = register_text(&bytes);
            }
            if let Ok(bytes) = client.read_holding_registers(MID_TYPE, 6).await {
                descriptor.model = register_text(&bytes);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MockClient;

    #[test]
    fn test_abb_operations() {
        let operations = AbbProducer::new().produce();
        assert_eq!(operations.len(), 23);
        assert!(operations.iter().all(|op| op.validate().is_ok()));

        let import = operations
            .iter()
            .find(|op| op.measurement == Measurement::Import)
            .unwrap();
        assert_eq!(import.count, 4);
        assert_eq!(import.transform.encoding(), Encoding::Uint64);

        let frequency = operations
            .iter()
            .find(|op| op.measurement == Measurement::Frequency)
            .unwrap();
        assert_eq!(frequency.count, 1);
        assert_eq!(frequency.transform.apply(&[0x13, 0x88]).unwrap(), 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_reads_mid_block() {
        let producer = AbbProducer::new();
        let mut client = MockClient::new();
        let mut descriptor = DeviceDescriptor::default();

        producer
            .initialize(&mut client, &mut descriptor)
            .await
            .unwrap();
        assert!(!descriptor.serial.is_empty());
        assert_eq!(client.reads(), 3);
    }
}
