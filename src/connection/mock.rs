//! Simulated bus returning random register contents.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use rand::Rng;

use super::{BusLogger, Connection, ModbusClient, check_quantity};
use crate::error::{Error, Result};

/// Default simulated response latency.
pub const DEFAULT_RESPONSE_TIME: Duration = Duration::from_millis(10);

/// Client answering every read with random bytes after a fixed latency.
#[derive(Debug, Clone)]
pub struct MockClient {
    error_rate: u8,
    response_time: Duration,
    timeout: Duration,
    reads: Arc<AtomicU64>,
}

impl MockClient {
    /// Creates a client that never fails.
    #[must_use]
    pub fn new() -> Self {
        Self {
            error_rate: 0,
            response_time: DEFAULT_RESPONSE_TIME,
            timeout: Duration::from_secs(1),
            reads: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Sets the percentage of reads that fail, clamped to 100.
    #[must_use]
    pub fn error_rate(mut self, percent: u8) -> Self {
        self.error_rate = percent.min(100);
        self
    }

    /// Sets the simulated latency.
    #[must_use]
    pub const fn response_time(mut self, latency: Duration) -> Self {
        self.response_time = latency;
        self
    }

    /// Returns the number of reads attempted so far.
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Returns a handle observing the read count after the client has been
    /// moved into a connection.
    #[must_use]
    pub fn read_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.reads)
    }

    async fn read(&mut self, quantity: u16) -> Result<Bytes> {
        check_quantity(quantity)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.response_time).await;

        let mut rng = rand::thread_rng();
        if self.error_rate > 0 && rng.gen_range(0..100) < self.error_rate {
            return Err(Error::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            });
        }

        let mut data = vec![0u8; quantity as usize * 2];
        rng.fill(&mut data[..]);
        Ok(Bytes::from(data))
    }
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ModbusClient for MockClient {
    fn read_holding_registers(&mut self, _address: u16, quantity: u16) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(self.read(quantity))
    }

    fn read_input_registers(&mut self, _address: u16, quantity: u16) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(self.read(quantity))
    }
}

/// Connection wrapping a [`MockClient`].
#[derive(Debug, Clone, Default)]
pub struct MockConnection {
    client: MockClient,
}

impl MockConnection {
    /// Creates a connection with a never-failing client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a connection around the given client.
    #[must_use]
    pub const fn with_client(client: MockClient) -> Self {
        Self { client }
    }
}

impl Connection for MockConnection {
    fn address(&self) -> &str {
        "mock"
    }

    fn client(&mut self) -> &mut dyn ModbusClient {
        &mut self.client
    }

    fn slave(&mut self, _id: u8) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn timeout(&mut self, timeout: Duration) -> Duration {
        std::mem::replace(&mut self.client.timeout, timeout)
    }

    fn close(&mut self) {}

    fn logger(&mut self, _logger: Arc<dyn BusLogger>) {}
}
