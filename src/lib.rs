//! # meterd
//!
//! Polling core for electrical meters and inverters speaking Modbus.
//!
//! Devices are read over serial RTU/ASCII, TCP, or RTU/ASCII tunnelled over
//! a network link. Readings are fanned out to any number of consumers
//! without letting a slow consumer or a dead device stall the rest.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - Per-device online/offline tracking with bounded retries
//! - One polling task per bus, so buses never block each other
//! - Generic fan-out with leak-free shutdown
//! - Register-map meters (Eastron SDM, ABB) and SunSpec devices
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use meterd::{Broadcaster, ConfigHandler, HandlerConfig, QueryEngine, Registry};
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), meterd::Error> {
//!     let registry = Registry::with_builtin();
//!     let mut config = ConfigHandler::new(&registry);
//!     config.create_device_from_spec("SDM:1@/dev/ttyUSB0")?;
//!
//!     let mut engine = QueryEngine::new(config.into_handlers(HandlerConfig::default()));
//!     let (control_tx, control_rx) = mpsc::channel(1);
//!     let (results_tx, results_rx) = mpsc::channel(1);
//!     let control = Arc::new(Broadcaster::new(control_rx));
//!     let results = Arc::new(Broadcaster::new(results_rx));
//!
//!     results
//!         .attach_runner(|mut rx| async move {
//!             while let Some(snip) = rx.recv().await {
//!                 println!("{snip}");
//!             }
//!         })
//!         .await?;
//!
//!     let runs = {
//!         let (control, results) = (Arc::clone(&control), Arc::clone(&results));
//!         tokio::spawn(async move { tokio::join!(control.run(), results.run()) })
//!     };
//!
//!     let cancel = CancellationToken::new();
//!     let stop = cancel.clone();
//!     tokio::spawn(async move {
//!         tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!         stop.cancel();
//!     });
//!
//!     engine.run(cancel, control_tx, results_tx).await;
//!     let _ = runs.await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`protocol`] - Read requests and RTU/ASCII/TCP response framing
//! - [`transport`] - Byte links (serial, TCP, UDP)
//! - [`connection`] - Links plus the Modbus client speaking over them
//! - [`meters`] - Device strategies, measurements and the type registry
//! - [`manager`] - One connection and the devices on it
//! - [`handler`] - Polling pass with retry and online tracking
//! - [`broadcast`] - Fan-out of results and health events
//! - [`status`] - Health aggregate for monitoring
//! - [`engine`] - Runs every handler until cancelled
//! - [`config`] - Configuration file and device spec handling

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod handler;
pub mod manager;
pub mod meters;
pub mod protocol;
pub mod runtime;
pub mod snip;
pub mod status;
pub mod transport;

// Re-exports for convenience
pub use broadcast::Broadcaster;
pub use config::{AdapterConfig, Config, ConfigHandler, DeviceConfig};
pub use connection::{BusConnection, Connection, MockClient, MockConnection, ModbusClient};
pub use engine::QueryEngine;
pub use error::{Error, FrameError, Result};
pub use handler::{Handler, HandlerConfig};
pub use manager::Manager;
pub use meters::{Device, DeviceDescriptor, Measurement, MeasurementResult, Registry};
pub use protocol::{ExceptionCode, Framing, FunctionCode, ReadRequest};
pub use runtime::{RuntimeInfo, RuntimeSnapshot};
pub use snip::{ControlSnip, QuerySnip};
pub use status::{Status, StatusSnapshot};
pub use transport::{Comset, SerialTransport, TcpTransport, UdpTransport};
