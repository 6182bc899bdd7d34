//! OBD2 Adapter Detection Library
//!
//! This crate defines the [`Transport`] capability the engine talks through,
//! a serial-port implementation of it, and the [`DeviceScanner`] that ranks
//! candidate adapters.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use obd_detect::{DeviceScanner, SerialTransport};
//!
//! # async fn run() {
//! let scanner = DeviceScanner::new(Arc::new(SerialTransport::new()));
//! for device in scanner.scan(Duration::from_secs(5)).await {
//!     println!("{} score {}", device.display_name, device.compatibility_score);
//! }
//! # }
//! ```

pub mod error;
pub mod scanner;
pub mod scoring;
pub mod serial;
pub mod transport;

pub use error::TransportError;
pub use scanner::{sort_devices, Device, DeviceScanner, ScannerConfig};
pub use scoring::AdapterKind;
pub use serial::{SerialConfig, SerialTransport, SERIAL_STRATEGY};
pub use transport::{
    AdapterIo, AdapterStream, ConnectStrategy, DiscoveryEvent, RawDevice, Transport,
};
