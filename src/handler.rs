//! Polling pass over the devices of one manager.
//!
//! A [`Handler`] visits every device in registration order:
//!
//! 1. select the slave on the connection
//! 2. initialize the device once, backing off for `init_delay` on failure
//! 3. skip devices that are offline and still inside their retry timeout
//! 4. query with up to `max_retry` attempts `retry_delay` apart
//!
//! A successful query emits one [`QuerySnip`] per non-NaN value and a
//! success [`ControlSnip`]. Exhausting the retries closes the connection,
//! marks the device offline and emits a failure [`ControlSnip`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::manager::{Manager, Slot};
use crate::meters::{Device, DeviceDescriptor};
use crate::runtime::{DEFAULT_RETRY_TIMEOUT, RuntimeInfo, RuntimeSnapshot};
use crate::snip::{ControlSnip, QuerySnip};

/// Default number of query attempts per pass.
pub const DEFAULT_MAX_RETRY: u32 = 3;

/// Default pause between query attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Default pause after a failed initialization.
pub const DEFAULT_INIT_DELAY: Duration = Duration::from_secs(3);

/// Shared view of the descriptors of initialized devices, keyed by device id.
pub type Descriptors = Arc<RwLock<BTreeMap<String, DeviceDescriptor>>>;

/// Timing and retry parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Query attempts before a device goes offline.
    pub max_retry: u32,
    /// Pause after each failed attempt.
    pub retry_delay: Duration,
    /// Pause after a failed initialization.
    pub init_delay: Duration,
    /// Time an offline device is skipped.
    pub retry_timeout: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            max_retry: DEFAULT_MAX_RETRY,
            retry_delay: DEFAULT_RETRY_DELAY,
            init_delay: DEFAULT_INIT_DELAY,
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
        }
    }
}

impl HandlerConfig {
    /// Sets the number of query attempts. Zero is treated as one.
    #[must_use]
    pub const fn max_retry(mut self, attempts: u32) -> Self {
        self.max_retry = attempts;
        self
    }

    /// Sets the pause between query attempts.
    #[must_use]
    pub const fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets the pause after a failed initialization.
    #[must_use]
    pub const fn init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = delay;
        self
    }

    /// Sets how long an offline device is left alone.
    #[must_use]
    pub const fn retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = timeout;
        self
    }
}

/// Builds the identity string of a device, e.g. `SDM1.26` or `SMA1.126.1`.
#[must_use]
pub fn device_id(device_type: &str, handler: usize, slave: u8, subdevice: u8) -> String {
    if subdevice > 0 {
        format!("{device_type}{handler}.{slave}.{subdevice}")
    } else {
        format!("{device_type}{handler}.{slave}")
    }
}

/// Drives the polling cycle of one [`Manager`].
pub struct Handler {
    id: usize,
    manager: Manager,
    config: HandlerConfig,
    runtime: HashMap<String, RuntimeInfo>,
    descriptors: Descriptors,
}

impl Handler {
    /// Creates a handler with default timing.
    #[must_use]
    pub fn new(id: usize, manager: Manager) -> Self {
        Self::with_config(id, manager, HandlerConfig::default())
    }

    /// Creates a handler with the given timing.
    #[must_use]
    pub fn with_config(id: usize, manager: Manager, config: HandlerConfig) -> Self {
        Self {
            id,
            manager,
            config,
            runtime: HashMap::new(),
            descriptors: Descriptors::default(),
        }
    }

    /// Returns the handler id used in device ids.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Returns the managed devices.
    #[must_use]
    pub const fn manager(&self) -> &Manager {
        &self.manager
    }

    /// Returns the timing configuration.
    #[must_use]
    pub const fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Returns the runtime state of an initialized device.
    #[must_use]
    pub fn runtime(&self, device: &str) -> Option<RuntimeSnapshot> {
        self.runtime.get(device).map(RuntimeInfo::snapshot)
    }

    /// Returns a shared handle on the descriptors of initialized devices.
    #[must_use]
    pub fn descriptors(&self) -> Descriptors {
        Arc::clone(&self.descriptors)
    }

    /// Executes one polling pass over every device.
    ///
    /// Returns early when `cancel` fires. Closed output channels are logged
    /// and otherwise ignored.
    pub async fn run(
        &mut self,
        cancel: &CancellationToken,
        control: &mpsc::Sender<ControlSnip>,
        results: &mpsc::Sender<QuerySnip>,
    ) {
        let Self {
            id: handler,
            manager,
            config,
            runtime,
            descriptors,
        } = self;

        let mut index = 0;
        while !cancel.is_cancelled() {
            let Some(Slot {
                id: slave,
                subdevice,
                connection,
                device,
            }) = manager.select(index).await
            else {
                break;
            };
            index += 1;

            let pass = Pass {
                cancel,
                config,
                control,
                results,
            };
            let id = device_id(&device.descriptor().device_type, *handler, slave, subdevice);

            if !runtime.contains_key(&id) {
                match pass.initialize(&id, connection, device).await {
                    Initialized::Yes(info, descriptor) => {
                        descriptors
                            .write()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(id.clone(), descriptor);
                        runtime.insert(id.clone(), info);
                    }
                    Initialized::No => continue,
                    Initialized::Cancelled => return,
                }
            }

            let Some(info) = runtime.get(&id) else {
                continue;
            };
            if pass.query(&id, info, connection, device).await.is_err() {
                return;
            }
        }
    }
}

enum Initialized {
    Yes(RuntimeInfo, DeviceDescriptor),
    No,
    Cancelled,
}

/// Marker for a pass aborted by cancellation.
struct Cancelled;

/// Per-pass context shared by the device steps.
struct Pass<'a> {
    cancel: &'a CancellationToken,
    config: &'a HandlerConfig,
    control: &'a mpsc::Sender<ControlSnip>,
    results: &'a mpsc::Sender<QuerySnip>,
}

impl Pass<'_> {
    /// Sleeps unless cancelled first.
    async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(Cancelled),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }

    async fn emit_control(&self, snip: ControlSnip) {
        if self.control.send(snip).await.is_err() {
            tracing::debug!("control channel closed");
        }
    }

    async fn initialize(
        &self,
        id: &str,
        connection: &mut dyn Connection,
        device: &mut Device,
    ) -> Initialized {
        if let Err(e) = device.initialize(connection.client()).await {
            tracing::error!("initializing device {} failed: {}", id, e);
            return match self.sleep(self.config.init_delay).await {
                Ok(()) => Initialized::No,
                Err(Cancelled) => Initialized::Cancelled,
            };
        }

        let descriptor = device.descriptor().clone();
        tracing::info!(
            "initialized device {}: {} {} {}",
            id,
            descriptor.manufacturer,
            descriptor.model,
            descriptor.serial
        );

        let info = RuntimeInfo::new(self.config.retry_timeout);
        info.set_initialized();
        info.set_online(true);

        self.emit_control(ControlSnip {
            device: id.to_string(),
            online: true,
            message: "initialized".into(),
            status: info.snapshot(),
            descriptor: descriptor.clone(),
        })
        .await;

        Initialized::Yes(info, descriptor)
    }

    async fn query(
        &self,
        id: &str,
        info: &RuntimeInfo,
        connection: &mut dyn Connection,
        device: &mut Device,
    ) -> Result<(), Cancelled> {
        let (queryable, reactivating) = info.is_queryable();
        if !queryable {
            return Ok(());
        }
        if reactivating {
            tracing::info!("device {} is offline - reactivating", id);
        }

        let attempts = self.config.max_retry.max(1);

        let mut failure = String::new();
        for attempt in 1..=attempts {
            info.inc_requests();
            match device.query(connection.client()).await {
                Ok(readings) => {
                    info.set_online(true);
                    self.emit_control(ControlSnip {
                        device: id.to_string(),
                        online: true,
                        message: "ok".into(),
                        status: info.snapshot(),
                        descriptor: device.descriptor().clone(),
                    })
                    .await;

                    for reading in readings {
                        if reading.value.is_nan() {
                            tracing::debug!("device {} skipping NaN for {}", id, reading.measurement);
                            continue;
                        }
                        if self.results.send(QuerySnip::new(id, reading)).await.is_err() {
                            tracing::debug!("results channel closed");
                        }
                    }
                    return Ok(());
                }
                Err(e) => {
                    info.inc_errors();
                    tracing::warn!(
                        "device {} did not respond ({}/{}): {}",
                        id,
                        attempt,
                        attempts,
                        e
                    );
                    failure = e.to_string();
                    self.sleep(self.config.retry_delay).await?;
                }
            }
        }

        tracing::error!("device {} did not respond after {} attempts - offline", id, attempts);
        connection.close();
        info.set_online(false);
        self.emit_control(ControlSnip {
            device: id.to_string(),
            online: false,
            message: failure,
            status: info.snapshot(),
            descriptor: device.descriptor().clone(),
        })
        .await;
        Ok(())
    }
}
