//! Daemon and device health.
//!
//! [`Status`] consumes the control stream and keeps the latest state of
//! every device. [`Status::snapshot`] refreshes process metrics and returns a
//! serializable copy.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::snip::ControlSnip;

/// Process memory in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MemoryStatus {
    pub resident: u64,
    #[serde(rename = "Virtual")]
    pub virtual_memory: u64,
}

/// Latest state of one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceStatus {
    pub device: String,
    /// Manufacturer reported by the device.
    #[serde(rename = "Type")]
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub online: bool,
    pub requests: u64,
    pub requests_per_minute: f64,
    pub errors: u64,
    pub errors_per_minute: f64,
}

/// Serializable health report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusSnapshot {
    pub start_time: DateTime<Utc>,
    /// Seconds since start.
    pub up_time: f64,
    /// Alive runtime tasks.
    #[serde(rename = "Goroutines")]
    pub tasks: usize,
    pub memory: MemoryStatus,
    /// Devices sorted by id.
    pub meters: Vec<DeviceStatus>,
}

/// Health aggregate fed by [`ControlSnip`]s.
pub struct Status {
    start_time: DateTime<Utc>,
    started: Instant,
    meters: RwLock<BTreeMap<String, DeviceStatus>>,
    system: Mutex<System>,
}

/// Rounds a per-minute rate to three decimals.
fn rate(count: u64, minutes: f64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let per_minute = count as f64 / minutes;
    (per_minute * 1000.0).round() / 1000.0
}

impl Status {
    /// Creates an empty status starting now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start_time: Utc::now(),
            started: Instant::now(),
            meters: RwLock::new(BTreeMap::new()),
            system: Mutex::new(System::new()),
        }
    }

    /// Consumes control messages until the channel closes.
    pub async fn run(&self, mut control: mpsc::Receiver<ControlSnip>) {
        while let Some(snip) = control.recv().await {
            self.update(&snip);
        }
        tracing::debug!("status: control stream closed");
    }

    /// Applies one control message.
    pub fn update(&self, snip: &ControlSnip) {
        let minutes = self.started.elapsed().as_secs_f64().max(1.0) / 60.0;
        let status = DeviceStatus {
            device: snip.device.clone(),
            manufacturer: snip.descriptor.manufacturer.clone(),
            model: snip.descriptor.model.clone(),
            serial: snip.descriptor.serial.clone(),
            online: snip.online,
            requests: snip.status.requests,
            requests_per_minute: rate(snip.status.requests, minutes),
            errors: snip.status.errors,
            errors_per_minute: rate(snip.status.errors, minutes),
        };

        self.meters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(snip.device.clone(), status);
    }

    /// Returns the device's online state, false for unknown devices.
    #[must_use]
    pub fn online(&self, device: &str) -> bool {
        self.meters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device)
            .is_some_and(|status| status.online)
    }

    /// Returns the latest state of one device.
    #[must_use]
    pub fn device(&self, device: &str) -> Option<DeviceStatus> {
        self.meters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device)
            .cloned()
    }

    fn memory(&self) -> MemoryStatus {
        let pid = Pid::from_u32(std::process::id());
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        system
            .process(pid)
            .map(|p| MemoryStatus {
                resident: p.memory(),
                virtual_memory: p.virtual_memory(),
            })
            .unwrap_or_default()
    }

    /// Refreshes process metrics and copies the current state.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        let tasks = tokio::runtime::Handle::try_current()
            .map(|handle| handle.metrics().num_alive_tasks())
            .unwrap_or_default();
        let memory = self.memory();

        let meters = self
            .meters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        StatusSnapshot {
            start_time: self.start_time,
            up_time: self.started.elapsed().as_secs_f64(),
            tasks,
            memory,
            meters,
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}
