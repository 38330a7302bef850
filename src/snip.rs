//! Messages emitted by the polling loop.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::meters::{DeviceDescriptor, Measurement, MeasurementResult};
use crate::runtime::RuntimeSnapshot;

/// One decoded measurement of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnip {
    /// Device identity, e.g. `SDM1.1`.
    pub device: String,
    pub measurement: Measurement,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl QuerySnip {
    /// Attributes a measurement result to a device.
    #[must_use]
    pub fn new(device: impl Into<String>, result: MeasurementResult) -> Self {
        Self {
            device: device.into(),
            measurement: result.measurement,
            value: result.value,
            timestamp: result.timestamp,
        }
    }
}

impl Serialize for QuerySnip {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("QuerySnip", 5)?;
        s.serialize_field("Device", &self.device)?;
        s.serialize_field("Value", &self.value)?;
        s.serialize_field("IEC61850", self.measurement.name())?;
        s.serialize_field("Description", &self.measurement.description())?;
        s.serialize_field("Timestamp", &self.timestamp.timestamp_millis())?;
        s.end()
    }
}

impl fmt::Display for QuerySnip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Dev: {}, IEC: {}, Value: {:.3}",
            self.device, self.measurement, self.value
        )
    }
}

/// Health event for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ControlSnip {
    /// Device identity, e.g. `SDM1.1`.
    pub device: String,
    /// Outcome of the operation that produced the event.
    pub online: bool,
    pub message: String,
    /// Runtime state after the operation.
    pub status: RuntimeSnapshot,
    pub descriptor: DeviceDescriptor,
}

impl fmt::Display for ControlSnip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.online { "online" } else { "offline" };
        write!(f, "Dev: {} ({}): {}", self.device, state, self.message)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn snip() -> QuerySnip {
        QuerySnip {
            device: "SDM1.1".into(),
            measurement: Measurement::VoltageL1,
            value: 230.123_456,
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
        }
    }

    #[test]
    fn test_query_snip_json() {
        let json = serde_json::to_value(snip()).unwrap();
        assert_eq!(json["Device"], "SDM1.1");
        assert_eq!(json["IEC61850"], "VoltageL1");
        assert_eq!(json["Description"], "L1 Voltage (V)");
        assert_eq!(json["Timestamp"], 1_700_000_000_123_i64);
        assert!((json["Value"].as_f64().unwrap() - 230.123_456).abs() < 1e-9);
    }

    #[test]
    fn test_query_snip_display() {
        assert_eq!(snip().to_string(), "Dev: SDM1.1, IEC: VoltageL1, Value: 230.123");
    }

    #[test]
    fn test_control_snip_json() {
        let snip = ControlSnip {
            device: "ABB2.7".into(),
            online: false,
            message: "request timed out after 300ms".into(),
            status: RuntimeSnapshot {
                initialized: true,
                online: false,
                requests: 3,
                errors: 3,
            },
            descriptor: DeviceDescriptor::default(),
        };
        let json = serde_json::to_value(&snip).unwrap();
        assert_eq!(json["Device"], "ABB2.7");
        assert_eq!(json["Online"], false);
        assert_eq!(json["Status"]["Errors"], 3);
        assert_eq!(
            snip.to_string(),
            "Dev: ABB2.7 (offline): request timed out after 300ms"
        );
    }
}
