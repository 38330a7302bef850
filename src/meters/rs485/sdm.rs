//! Eastron SDM630 and compatible meters.
//!
//! Every value is an IEEE 754 float in two input registers. The table is a
//! superset of the smaller SDM models; single-phase devices answer the L1
//! and total registers only.

use super::{Operation, Opcodes, Producer};
use crate::meters::{Encoding, Measurement, Transform};
use crate::protocol::FunctionCode;

/// Register map of the SDM630.
#[derive(Debug, Clone)]
pub struct SdmProducer {
    opcodes: Opcodes,
}

impl SdmProducer {
    /// Creates the producer.
    #[must_use]
    pub fn new() -> Self {
        use Measurement::{
            ApparentPower, Cosphi, CosphiL1, CosphiL2, CosphiL3, CurrentL1, CurrentL2, CurrentL3,
            Export, ExportL1, ExportL2, ExportL3, Frequency, Import, ImportL1, ImportL2, ImportL3,
            ImportPower, Power, PowerL1, PowerL2, PowerL3, ReactivePower, Sum, SumL1, SumL2,
            SumL3, THD, THDL1, THDL2, THDL3, VoltageL1, VoltageL2, VoltageL3,
        };

        let opcodes = Opcodes::from([
            (VoltageL1, 0x0000),
            (VoltageL2, 0x0002),
            (VoltageL3, 0x0004),
            (CurrentL1, 0x0006),
            (CurrentL2, 0x0008),
            (CurrentL3, 0x000A),
            (PowerL1, 0x000C),
            (PowerL2, 0x000E),
            (PowerL3, 0x0010),
            (Power, 0x0034),
            (ApparentPower, 0x0038),
            (ReactivePower, 0x003C),
            (ImportPower, 0x0054),
            (CosphiL1, 0x001E),
            (CosphiL2, 0x0020),
            (CosphiL3, 0x0022),
            (Cosphi, 0x003E),
            (Frequency, 0x0046),
            (Import, 0x0048),
            (Export, 0x004A),
            (THDL1, 0x00EA),
            (THDL2, 0x00EC),
            (THDL3, 0x00EE),
            (THD, 0x00F8),
            (Sum, 0x0156),
            (ImportL1, 0x015A),
            (ImportL2, 0x015C),
            (ImportL3, 0x015E),
            (ExportL1, 0x0160),
            (ExportL2, 0x0162),
            (ExportL3, 0x0164),
            (SumL1, 0x0166),
            (SumL2, 0x0168),
            (SumL3, 0x016A),
        ]);

        Self { opcodes }
    }

    const fn operation(measurement: Measurement, address: u16) -> Operation {
        Operation {
            function: FunctionCode::ReadInputRegisters,
            address,
            count: 2,
            measurement,
            transform: Transform::new(Encoding::Float32),
        }
    }
}

impl Default for SdmProducer {
    fn default() -> Self {
        Self::new()
    }
}

impl Producer for SdmProducer {
    fn type_name(&self) -> &'static str {
        "SDM"
    }

    fn description(&self) -> &'static str {
        "Eastron SDM630"
    }

    fn produce(&self) -> Vec<Operation> {
        self.opcodes
            .iter()
            .map(|(measurement, address)| Self::operation(measurement, address))
            .collect()
    }

    fn probe(&self) -> Operation {
        Self::operation(Measurement::VoltageL1, 0x0000)
    }
}
