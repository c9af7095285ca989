#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Cadencers 🚴
//!
//! A Rust library for reading pedal cadence from Bluetooth Low Energy cycling
//! speed and cadence (CSC) sensors.
//!
//! The library scans for sensors, connects to one (picked by the caller or
//! matched against a configured address), subscribes to the standard CSC
//! Measurement characteristic and turns the cumulative crank counters it
//! reports into revolutions per minute.
//!
//! ## Pipeline
//!
//! - **Decoding**: [`protocol::decode`] parses the flag-dependent measurement layout
//! - **Estimation**: [`CadenceEstimator`] derives RPM from 16-bit counters with rollover
//! - **Staleness**: [`StalenessMonitor`] drops cadence to 0 RPM when the crank stops reporting
//! - **Lifecycle**: [`ConnectionStateMachine`] walks scan, connect, service discovery and
//!   subscription, one connection at a time
//!
//! All state is owned by a single background worker behind [`CadenceSensor`];
//! results arrive as [`SessionEvent`]s.
//!
//! ## Quick Start
//!
//! ```no_run
//! use cadencers::{CadenceSensor, SessionConfig, SessionEvent, TimeoutConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (sensor, mut events) =
//!         CadenceSensor::start(SessionConfig::default(), TimeoutConfig::default()).await?;
//!
//!     // Scan and offer the discovered sensors
//!     sensor.request_start_scan_or_connect()?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             SessionEvent::DiscoveryComplete(devices) => {
//!                 if let Some(device) = devices.first() {
//!                     sensor.select_device(device.handle.address())?;
//!                 }
//!             }
//!             SessionEvent::CadenceUpdated(rpm) => println!("{rpm:.0} RPM"),
//!             _ => {}
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

use uuid::Uuid;

/// Bluetooth Low Energy communication module
pub mod ble;
/// Cadence estimation from cumulative crank data
pub mod cadence;
/// Main sensor interface and session worker
pub mod device;
/// Error types and handling
pub mod error;
/// Scan/connect state machine
pub mod machine;
/// CSC Measurement packet decoding
pub mod protocol;
/// Single active link with its cadence pipeline
pub mod session;
/// Stale-data watchdog
pub mod staleness;
/// BLE transport and permission abstractions
pub mod transport;
/// Type definitions and data structures
pub mod types;

#[cfg(test)]
mod mock;

// Re-export the main types for convenient usage
pub use ble::BtleplugTransport;
pub use cadence::{CadenceEstimator, CadenceUpdate, ZeroRevolutionPolicy};
pub use device::CadenceSensor;
pub use error::{CadenceError, DecodeError, ErrorKind, Result};
pub use machine::ConnectionStateMachine;
pub use protocol::{decode, CrankData, CscMeasurement};
pub use session::{ConnectionSession, LinkSignal};
pub use staleness::StalenessMonitor;
pub use transport::{BleTransport, GrantAll, Operation, PermissionGate};
pub use types::{
    ConnectionState, DiscoveredDevice, PeripheralHandle, ScanMode, SessionConfig, SessionEvent,
    SessionFailure, SessionStatus, TimeoutConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Cycling Speed and Cadence service UUID (0x1816)
pub const CSC_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1816_0000_1000_8000_0080_5f9b_34fb);

/// CSC Measurement characteristic UUID (0x2A5B)
///
/// Notifies a flags byte followed by optional wheel and crank counters.
pub const CSC_MEASUREMENT_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2a5b_0000_1000_8000_0080_5f9b_34fb);

/// Client Characteristic Configuration descriptor UUID (0x2902)
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5f9b_34fb);
