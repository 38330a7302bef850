//! Register-map devices.
//!
//! A [`Producer`] describes one meter family as a list of [`Operation`]s.
//! [`Rs485Device`] executes them against the bus.

pub mod abb;
pub mod sdm;

use futures::future::BoxFuture;

use super::{DeviceDescriptor, Measurement, MeasurementResult, Transform};
use crate::connection::ModbusClient;
use crate::error::{Error, Result};
use crate::protocol::FunctionCode;

pub use abb::AbbProducer;
pub use sdm::SdmProducer;

/// A single register read and how to decode it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Operation {
    pub function: FunctionCode,
    /// First register address.
    pub address: u16,
    /// Number of registers.
    pub count: u16,
    pub measurement: Measurement,
    pub transform: Transform,
}

impl Operation {
    /// Checks that the operation can be executed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`] for a zero register count or a
    /// transform wider than the registers read.
    pub fn validate(&self) -> Result<()> {
        if self.count == 0 {
            return Err(Error::InvalidOperation {
                reason: format!("{} reads no registers", self.measurement),
            });
        }
        if self.transform.encoding().size() > self.count as usize * 2 {
            return Err(Error::InvalidOperation {
                reason: format!(
                    "{} decodes {:?} from {} registers",
                    self.measurement,
                    self.transform.encoding(),
                    self.count
                ),
            });
        }
        Ok(())
    }

    /// Executes the read and decodes the result.
    pub async fn execute(&self, client: &mut dyn ModbusClient) -> Result<MeasurementResult> {
        self.validate()?;
        let bytes = client.read(self.function, self.address, self.count).await?;
        let value = self.transform.apply(&bytes)?;
        Ok(MeasurementResult::new(self.measurement, value))
    }
}

/// Ordered mapping of measurements to register addresses.
#[derive(Debug, Clone, Default)]
pub struct Opcodes(Vec<(Measurement, u16)>);

impl Opcodes {
    /// Returns the register for `measurement`.
    #[must_use]
    pub fn get(&self, measurement: Measurement) -> Option<u16> {
        self.0
            .iter()
            .find(|(m, _)| *m == measurement)
            .map(|&(_, address)| address)
    }

    /// Iterates in table order.
    pub fn iter(&self) -> impl Iterator<Item = (Measurement, u16)> + '_ {
        self.0.iter().copied()
    }
}

impl<const N: usize> From<[(Measurement, u16); N]> for Opcodes {
    fn from(table: [(Measurement, u16); N]) -> Self {
        Self(table.to_vec())
    }
}

/// Describes the registers of one meter family.
pub trait Producer: Send + Sync {
    /// Type name used in configuration, e.g. `SDM`.
    fn type_name(&self) -> &'static str;

    /// Human-readable model family.
    fn description(&self) -> &'static str;

    /// All operations of one polling cycle.
    fn produce(&self) -> Vec<Operation>;

    /// A cheap operation suited for detecting the device.
    fn probe(&self) -> Operation;

    /// Device-specific interrogation, e.g. reading the serial number.
    fn initialize<'a>(
        &'a self,
        _client: &'a mut dyn ModbusClient,
        _descriptor: &'a mut DeviceDescriptor,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Device executing a producer's operations.
///
/// Operations are served from a ring: a failed query resumes at the failed
/// operation on the next call, so every register is read at the same rate
/// even on a flaky bus.
pub struct Rs485Device {
    producer: Box<dyn Producer>,
    descriptor: DeviceDescriptor,
    operations: Vec<Operation>,
    cursor: usize,
}

impl Rs485Device {
    /// Creates a device for the given producer.
    #[must_use]
    pub fn new(producer: Box<dyn Producer>) -> Self {
        let operations = producer.produce();
        let descriptor = DeviceDescriptor {
            device_type: producer.type_name().to_string(),
            manufacturer: producer.type_name().to_string(),
            model: producer.description().to_string(),
            ..Default::default()
        };
        Self {
            producer,
            descriptor,
            operations,
            cursor: 0,
        }
    }

    pub(crate) async fn initialize(&mut self, client: &mut dyn ModbusClient) -> Result<()> {
        self.descriptor = DeviceDescriptor {
            device_type: self.producer.type_name().to_string(),
            manufacturer: self.producer.type_name().to_string(),
            model: self.producer.description().to_string(),
            subdevice: self.descriptor.subdevice,
            ..Default::default()
        };
        self.producer.initialize(client, &mut self.descriptor).await
    }

    pub(crate) const fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub(crate) async fn probe(&self, client: &mut dyn ModbusClient) -> Result<MeasurementResult> {
        self.producer.probe().execute(client).await
    }

    pub(crate) async fn query(
        &mut self,
        client: &mut dyn ModbusClient,
    ) -> Result<Vec<MeasurementResult>> {
        let total = self.operations.len();
        let mut results = Vec::with_capacity(total);

        for _ in 0..total {
            let operation = self.operations[self.cursor];
            results.push(operation.execute(client).await?);
            self.cursor = (self.cursor + 1) % total;
        }

        Ok(results)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;

    use super::*;
    use crate::meters::Encoding;

    /// Client answering with the low address byte, failing reads of `fail_on`.
    pub(crate) struct ScriptedClient {
        pub reads: Vec<u16>,
        pub fail_on: Option<u16>,
    }

    impl ModbusClient for ScriptedClient {
        fn read_holding_registers(&mut self, address: u16, quantity: u16) -> BoxFuture<'_, Result<Bytes>> {
            self.read_input_registers(address, quantity)
        }

        fn read_input_registers(&mut self, address: u16, quantity: u16) -> BoxFuture<'_, Result<Bytes>> {
            self.reads.push(address);
            let fail = self.fail_on == Some(address);
            Box::pin(async move {
                if fail {
                    return Err(Error::Timeout { timeout_ms: 1 });
                }
                let mut data = vec![0u8; quantity as usize * 2];
                data[1] = (address & 0xff) as u8;
                Ok(Bytes::from(data))
            })
        }
    }

    /// Producer over three holding registers.
    #[derive(Default)]
    pub(crate) struct TestProducer {
        pub initialized: Arc<AtomicUsize>,
    }

    impl Producer for TestProducer {
        fn type_name(&self) -> &'static str {
            "TEST"
        }

        fn description(&self) -> &'static str {
            "Test meter"
        }

        fn produce(&self) -> Vec<Operation> {
            [
                (Measurement::VoltageL1, 1),
                (Measurement::VoltageL2, 2),
                (Measurement::VoltageL3, 3),
            ]
            .into_iter()
            .map(|(measurement, address)| Operation {
                function: FunctionCode::ReadHoldingRegisters,
                address,
                count: 1,
                measurement,
                transform: Transform::new(Encoding::Uint16),
            })
            .collect()
        }

        fn probe(&self) -> Operation {
            self.produce()[0]
        }

        fn initialize<'a>(
            &'a self,
            _client: &'a mut dyn ModbusClient,
            descriptor: &'a mut DeviceDescriptor,
        ) -> BoxFuture<'a, Result<()>> {
            self.initialized.fetch_add(1, Ordering::SeqCst);
            descriptor.serial = "0042".into();
            Box::pin(async { Ok(()) })
        }
    }

    fn device() -> Rs485Device {
        Rs485Device::new(Box::new(TestProducer {
            initialized: Arc::new(AtomicUsize::new(0)),
        }))
    }

    #[tokio::test]
    async fn test_query_reads_all_operations() {
        let mut device = device();
        let mut client = ScriptedClient {
            reads: Vec::new(),
            fail_on: None,
        };

        let results = device.query(&mut client).await.unwrap();
        assert_eq!(client.reads, vec![1, 2, 3]);
        assert_eq!(results.len(), 3);
        assert_eq!(results[1].measurement, Measurement::VoltageL2);
        assert_eq!(results[1].value, 2.0);
    }

    #[tokio::test]
    async fn test_failed_query_resumes_at_failed_operation() {
        let mut device = device();
        let mut client = ScriptedClient {
            reads: Vec::new(),
            fail_on: Some(2),
        };

        assert!(device.query(&mut client).await.is_err());
        assert_eq!(client.reads, vec![1, 2]);

        client.fail_on = None;
        client.reads.clear();
        let results = device.query(&mut client).await.unwrap();
        assert_eq!(client.reads, vec![2, 3, 1]);
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn test_initialize_fills_descriptor() {
        let mut device = device();
        let mut client = ScriptedClient {
            reads: Vec::new(),
            fail_on: None,
        };

        device.initialize(&mut client).await.unwrap();
        let descriptor = device.descriptor();
        assert_eq!(descriptor.device_type, "TEST");
        assert_eq!(descriptor.model, "Test meter");
        assert_eq!(descriptor.serial, "0042");
    }

    #[tokio::test]
    async fn test_invalid_operation_skips_bus() {
        let mut client = ScriptedClient {
            reads: Vec::new(),
            fail_on: None,
        };
        let operation = Operation {
            function: FunctionCode::ReadInputRegisters,
            address: 0,
            count: 0,
            measurement: Measurement::Power,
            transform: Transform::new(Encoding::Float32),
        };

        let err = operation.execute(&mut client).await.unwrap_err();
        assert!(matches!(err, Error::InvalidOperation { .. }));
        assert!(client.reads.is_empty());

        let narrow = Operation { count: 1, ..operation };
        assert!(narrow.validate().is_err());
    }
}
