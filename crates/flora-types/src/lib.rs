//! Platform-agnostic types for Mi Flora plant sensors.
//!
//! This crate provides the value types shared by the reconciliation engine
//! (flora-core) and the daemon (flora-daemon). It performs no I/O.
//!
//! # Features
//!
//! - Sensor kinds, value sets and decoded updates
//! - Device identities, MAC addresses and firmware versions
//! - Display-name normalisation for publish channels
//! - UUID constants for the MiBeacon service and Mi Flora GATT characteristics
//! - Error types for parsing
//!
//! # Example
//!
//! ```
//! use flora_types::{SensorKind, SensorValues, SensorUpdate};
//!
//! let update = SensorUpdate::passive(SensorValues::new().with(SensorKind::Moisture, 42.0));
//! assert!(!update.is_empty());
//! ```

pub mod error;
pub mod name;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use name::{DisplayName, clean_identifier};
pub use types::{
    DeviceIdentity, FirmwareVersion, MacAddress, PollStats, SensorKind, SensorUpdate,
    SensorValues,
};
pub use uuid as uuids;
