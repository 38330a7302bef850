//! Binding of one connection to the devices addressed on it.

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::meters::Device;

/// A device registered on a manager.
pub struct Entry {
    /// Modbus slave id.
    pub id: u8,
    /// Logical device index behind the slave id.
    pub subdevice: u8,
    /// The device strategy.
    pub device: Device,
}

/// A device with its slave selected on the connection.
pub struct Slot<'a> {
    pub id: u8,
    pub subdevice: u8,
    pub connection: &'a mut dyn Connection,
    pub device: &'a mut Device,
}

/// Owns one [`Connection`] and the devices reachable over it.
///
/// Devices are kept in registration order, which is the order a polling
/// pass visits them in.
pub struct Manager {
    connection: Box<dyn Connection>,
    devices: Vec<Entry>,
}

impl Manager {
    /// Creates a manager without devices.
    #[must_use]
    pub fn new(connection: Box<dyn Connection>) -> Self {
        Self {
            connection,
            devices: Vec::new(),
        }
    }

    /// Registers a device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateDevice`] if `(id, subdevice)` is already
    /// registered. The existing registration is kept.
    pub fn add(&mut self, id: u8, subdevice: u8, device: impl Into<Device>) -> Result<()> {
        if self
            .devices
            .iter()
            .any(|e| e.id == id && e.subdevice == subdevice)
        {
            return Err(Error::DuplicateDevice { id, subdevice });
        }

        self.devices.push(Entry {
            id,
            subdevice,
            device: device.into(),
        });
        Ok(())
    }

    /// Returns the number of registered devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Returns true if no device is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Iterates devices in registration order without touching the bus.
    pub fn all(&self) -> impl Iterator<Item = &Entry> {
        self.devices.iter()
    }

    /// Selects the slave of the device at `index` and hands out the
    /// connection together with the device.
    ///
    /// Returns `None` past the last device.
    pub async fn select(&mut self, index: usize) -> Option<Slot<'_>> {
        let entry = self.devices.get_mut(index)?;
        self.connection.slave(entry.id).await;
        Some(Slot {
            id: entry.id,
            subdevice: entry.subdevice,
            connection: self.connection.as_mut(),
            device: &mut entry.device,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures::future::BoxFuture;

    use super::*;
    use crate::connection::{BusLogger, MockClient, ModbusClient};
    use crate::meters::{Rs485Device, SunSpecDevice};
    use crate::meters::rs485::tests::TestProducer;

    /// Records selected slave ids.
    struct RecordingConnection {
        client: MockClient,
        selected: Arc<Mutex<Vec<u8>>>,
    }

    impl Connection for RecordingConnection {
        fn address(&self) -> &str {
            "recording"
        }

        fn client(&mut self) -> &mut dyn ModbusClient {
            &mut self.client
        }

        fn slave(&mut self, id: u8) -> BoxFuture<'_, ()> {
            self.selected.lock().unwrap().push(id);
            Box::pin(async {})
        }

        fn timeout(&mut self, timeout: Duration) -> Duration {
            timeout
        }

        fn close(&mut self) {}

        fn logger(&mut self, _logger: Arc<dyn BusLogger>) {}
    }

    fn recording() -> (Manager, Arc<Mutex<Vec<u8>>>) {
        let selected = Arc::new(Mutex::new(Vec::new()));
        let conn = RecordingConnection {
            client: MockClient::new(),
            selected: Arc::clone(&selected),
        };
        (Manager::new(Box::new(conn)), selected)
    }

    #[test]
    fn test_duplicate_rejected() {
        let (mut manager, _) = recording();
        manager.add(1, 0, Rs485Device::new(Box::new(TestProducer::default()))).unwrap();
        manager.add(1, 1, SunSpecDevice::new("SUNS", 1)).unwrap();

        let err = manager
            .add(1, 0, SunSpecDevice::new("SUNS", 0))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateDevice { id: 1, subdevice: 0 }));

        assert_eq!(manager.len(), 2);
        let first = manager.all().next().unwrap();
        assert!(matches!(first.device, Device::Rs485(_)));
    }

    #[tokio::test]
    async fn test_select_in_registration_order() {
        let (mut manager, selected) = recording();
        for id in [7, 3, 5] {
            manager
                .add(id, 0, Rs485Device::new(Box::new(TestProducer::default())))
                .unwrap();
        }

        let ids: Vec<u8> = manager.all().map(|e| e.id).collect();
        assert_eq!(ids, vec![7, 3, 5]);
        assert!(selected.lock().unwrap().is_empty());

        let mut index = 0;
        while let Some(slot) = manager.select(index).await {
            assert_eq!(slot.connection.address(), "recording");
            index += 1;
        }
        assert_eq!(index, 3);
        assert_eq!(*selected.lock().unwrap(), vec![7, 3, 5]);
    }

    #[tokio::test]
    async fn test_select_past_end() {
        let (mut manager, selected) = recording();
        assert!(manager.is_empty());
        assert!(manager.select(0).await.is_none());
        assert!(selected.lock().unwrap().is_empty());
    }
}
