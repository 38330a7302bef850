//! Physical quantities read from meters.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::error::{Error, Result};

macro_rules! measurements {
    ($($variant:ident => $description:literal, $unit:literal;)*) => {
        /// Measurement kind in IEC 61850 style notation.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[allow(clippy::upper_case_acronyms)]
        pub enum Measurement {
            $($variant,)*
        }

        impl Measurement {
            /// Every known measurement, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant,)*];

            /// Returns the IEC 61850 name, e.g. `VoltageL1`.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($variant),)*
                }
            }

            const fn details(self) -> (&'static str, &'static str) {
                match self {
                    $(Self::$variant => ($description, $unit),)*
                }
            }
        }
    };
}

measurements! {
    Frequency => "Frequency", "Hz";
    Current => "Current", "A";
    CurrentL1 => "L1 Current", "A";
    CurrentL2 => "L2 Current", "A";
    CurrentL3 => "L3 Current", "A";
    Voltage => "Voltage", "V";
    VoltageL1 => "L1 Voltage", "V";
    VoltageL2 => "L2 Voltage", "V";
    VoltageL3 => "L3 Voltage", "V";
    Power => "Power", "W";
    PowerL1 => "L1 Power", "W";
    PowerL2 => "L2 Power", "W";
    PowerL3 => "L3 Power", "W";
    ImportPower => "Import Power", "W";
    ImportPowerL1 => "L1 Import Power", "W";
    ImportPowerL2 => "L2 Import Power", "W";
    ImportPowerL3 => "L3 Import Power", "W";
    ExportPower => "Export Power", "W";
    ExportPowerL1 => "L1 Export Power", "W";
    ExportPowerL2 => "L2 Export Power", "W";
    ExportPowerL3 => "L3 Export Power", "W";
    ReactivePower => "Reactive Power", "var";
    ReactivePowerL1 => "L1 Reactive Power", "var";
    ReactivePowerL2 => "L2 Reactive Power", "var";
    ReactivePowerL3 => "L3 Reactive Power", "var";
    ApparentPower => "Apparent Power", "VA";
    ApparentPowerL1 => "L1 Apparent Power", "VA";
    ApparentPowerL2 => "L2 Apparent Power", "VA";
    ApparentPowerL3 => "L3 Apparent Power", "VA";
    Cosphi => "Power Factor Cosphi", "";
    CosphiL1 => "L1 Power Factor Cosphi", "";
    CosphiL2 => "L2 Power Factor Cosphi", "";
    CosphiL3 => "L3 Power Factor Cosphi", "";
    THD => "Average voltage to neutral THD", "%";
    THDL1 => "L1 Voltage to neutral THD", "%";
    THDL2 => "L2 Voltage to neutral THD", "%";
    THDL3 => "L3 Voltage to neutral THD", "%";
    Sum => "Total Energy Sum", "kWh";
    SumT1 => "Tariff 1 Energy Sum", "kWh";
    SumT2 => "Tariff 2 Energy Sum", "kWh";
    SumL1 => "L1 Energy Sum", "kWh";
    SumL2 => "L2 Energy Sum", "kWh";
    SumL3 => "L3 Energy Sum", "kWh";
    Import => "Total Import Energy", "kWh";
    ImportT1 => "Tariff 1 Import Energy", "kWh";
    ImportT2 => "Tariff 2 Import Energy", "kWh";
    ImportL1 => "L1 Import Energy", "kWh";
    ImportL2 => "L2 Import Energy", "kWh";
    ImportL3 => "L3 Import Energy", "kWh";
    Export => "Total Export Energy", "kWh";
    ExportT1 => "Tariff 1 Export Energy", "kWh";
    ExportT2 => "Tariff 2 Export Energy", "kWh";
    ExportL1 => "L1 Export Energy", "kWh";
    ExportL2 => "L2 Export Energy", "kWh";
    ExportL3 => "L3 Export Energy", "kWh";
    ReactiveSum => "Total Reactive Energy", "kvarh";
    ReactiveSumT1 => "Tariff 1 Reactive Energy", "kvarh";
    ReactiveSumT2 => "Tariff 2 Reactive Energy", "kvarh";
    ReactiveSumL1 => "L1 Reactive Energy", "kvarh";
    ReactiveSumL2 => "L2 Reactive Energy", "kvarh";
    ReactiveSumL3 => "L3 Reactive Energy", "kvarh";
    ReactiveImport => "Reactive Import Energy", "kvarh";
    ReactiveImportT1 => "Tariff 1 Reactive Import Energy", "kvarh";
    ReactiveImportT2 => "Tariff 2 Reactive Import Energy", "kvarh";
    ReactiveImportL1 => "L1 Reactive Import Energy", "kvarh";
    ReactiveImportL2 => "L2 Reactive Import Energy", "kvarh";
    ReactiveImportL3 => "L3 Reactive Import Energy", "kvarh";
    ReactiveExport => "Reactive Export Energy", "kvarh";
    ReactiveExportT1 => "Tariff 1 Reactive Export Energy", "kvarh";
    ReactiveExportT2 => "Tariff 2 Reactive Export Energy", "kvarh";
    ReactiveExportL1 => "L1 Reactive Export Energy", "kvarh";
    ReactiveExportL2 => "L2 Reactive Export Energy", "kvarh";
    ReactiveExportL3 => "L3 Reactive Export Energy", "kvarh";
    DCCurrent => "DC Current", "A";
    DCVoltage => "DC Voltage", "V";
    DCPower => "DC Power", "W";
    HeatSinkTemp => "Heat Sink Temperature", "°C";
    DCCurrentS1 => "String 1 Current", "A";
    DCVoltageS1 => "String 1 Voltage", "V";
    DCPowerS1 => "String 1 Power", "W";
    DCEnergyS1 => "String 1 Generation", "kWh";
    DCCurrentS2 => "String 2 Current", "A";
    DCVoltageS2 => "String 2 Voltage", "V";
    DCPowerS2 => "String 2 Power", "W";
    DCEnergyS2 => "String 2 Generation", "kWh";
    DCCurrentS3 => "String 3 Current", "A";
    DCVoltageS3 => "String 3 Voltage", "V";
    DCPowerS3 => "String 3 Power", "W";
    DCEnergyS3 => "String 3 Generation", "kWh";
    ChargeState => "Charge State", "%";
    BatteryVoltage => "Battery Voltage", "V";
    PhaseAngle => "Phase Angle", "°";
}

impl Measurement {
    /// Returns the unit abbreviation, empty for dimensionless values.
    #[must_use]
    pub const fn unit(self) -> &'static str {
        self.details().1
    }

    /// Returns the human-readable description including the unit,
    /// e.g. `L1 Voltage (V)`.
    #[must_use]
    pub fn description(self) -> String {
        let (description, unit) = self.details();
        if unit.is_empty() {
            description.to_string()
        } else {
            format!("{description} ({unit})")
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Measurement {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::config(format!("unknown measurement {s:?}")))
    }
}

impl Serialize for Measurement {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// One decoded reading.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementResult {
    /// What was measured.
    pub measurement: Measurement,
    /// Decoded value. May be NaN when the device reports "not available".
    pub value: f64,
    /// When the value was read.
    pub timestamp: DateTime<Utc>,
}

impl MeasurementResult {
    /// Creates a result stamped with the current time.
    #[must_use]
    pub fn new(measurement: Measurement, value: f64) -> Self {
        Self {
            measurement,
            value,
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for MeasurementResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {:.2}{}",
            self.measurement,
            self.value,
            self.measurement.unit()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurement_names() {
        assert_eq!(Measurement::VoltageL1.name(), "VoltageL1");
        assert_eq!(Measurement::THD.to_string(), "THD");
        assert_eq!(Measurement::ALL.len(), 92);
    }

    #[test]
    fn test_measurement_description() {
        assert_eq!(Measurement::VoltageL1.description(), "L1 Voltage (V)");
        assert_eq!(Measurement::Import.description(), "Total Import Energy (kWh)");
        assert_eq!(Measurement::Cosphi.description(), "Power Factor Cosphi");
    }

    #[test]
    fn test_measurement_parse() {
        assert_eq!("voltagel2".parse::<Measurement>().unwrap(), Measurement::VoltageL2);
        assert!("Wattage".parse::<Measurement>().is_err());
    }

    #[test]
    fn test_result_display() {
        let result = MeasurementResult::new(Measurement::Frequency, 50.014);
        assert_eq!(result.to_string(), "Frequency: 50.01Hz");
    }
}
