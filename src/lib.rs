//! Gatelink firmware library.
//!
//! The BLE command transport of the Modbus-to-cloud gateway, exposed as a
//! library for host integration tests and fuzzing. All ESP-IDF-specific
//! code is guarded by `#[cfg(target_os = "espidf")]` within each module.

#![deny(unused_must_use)]

pub mod adapters;
pub mod buffer;
pub mod config;
pub mod diagnostics;
pub mod drivers;
pub mod error;
pub mod events;
pub mod ports;
pub mod transport;

#[cfg(target_os = "espidf")]
mod esp_link_shims;

pub use error::Error;
pub use transport::GatewayTransport;
