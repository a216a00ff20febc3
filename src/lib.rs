//! Async bridge between a callback-driven BLE stack and sensor streams.
//!
//! A [`CentralManager`] turns the events of a [`Transport`] into a stream of
//! discovered devices and an awaitable `connect`. Connecting runs a discovery
//! handshake against the device's [`Profile`]: the returned [`Peripheral`]
//! exists only once every required characteristic has been found. Each
//! [`Reading`] of the profile can then be streamed live.
//!
//! ## Usage
//!
//! Here is an example that finds a device exposing the battery service and
//! follows its battery level:
//!
//! ```rust,no_run
//! use blesense::common::{BatteryLevel, BatteryMonitor};
//! use blesense::{CentralManager, Error, ScanConfig};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     pretty_env_logger::init();
//!
//!     let central = CentralManager::<BatteryMonitor>::open(0).await?;
//!     if !central.is_ready().await? {
//!         return Err(Error::NotReady);
//!     }
//!
//!     // Take the first discovered device
//!     let mut devices = central.discover(ScanConfig::default())?;
//!     let device = devices.next().await.unwrap();
//!     central.stop_scan();
//!
//!     let monitor = central.connect(&device).await?;
//!
//!     let mut levels = monitor.subscribe::<BatteryLevel>()?;
//!     while let Some(level) = levels.next().await {
//!         println!("Battery level: {}%", level);
//!     }
//!
//!     Ok(())
//! }
//!```

#![warn(clippy::all, future_incompatible, nonstandard_style, rust_2018_idioms)]

pub use central::{CentralManager, ConnectConfig, ScanConfig};
pub use channel::{Notifications, Producer};
pub use characteristic::{Reading, Readings};
pub use error::{Error, Result};
pub use handshake::{Discovered, DiscoveryHandshake, DiscoveryProgress, HandshakeState};
pub use peripheral::{ConnectionState, Peripheral};
pub use pending::{PendingOperation, Waiter};
pub use service::{Profile, ServiceRequirement};
pub use transport::{
    Cause, DeviceHandle, DeviceId, RadioState, Transport, TransportEvent,
};

pub mod btle;
pub mod channel;
pub mod common;
pub mod transport;

mod central;
mod characteristic;
mod error;
mod handshake;
mod peripheral;
mod pending;
mod service;

#[cfg(test)]
mod fake;
