//! Device reconciliation engine for Mi Flora plant sensors.
//!
//! Mi Flora sensors broadcast a partial reading in every advertisement and
//! serve the full reading only over a GATT connection. This crate merges both
//! sources into one authoritative state per device and decides when the
//! expensive connection-based read is worth doing.
//!
//! # Features
//!
//! - **Reconciliation**: one state per device, last write wins per sensor kind
//! - **Poll scheduling**: active reads only when hinted, never more often than the poll interval
//! - **Ordering**: events for one device are applied in order; devices never block each other
//! - **Announcements**: discovery metadata on first sight and on firmware changes
//! - **BLE plumbing**: MiBeacon decoding, an advertisement feed and a GATT poller
//! - **Mocks**: scripted decoder and poller for hardware-free testing
//!
//! # Platform Differences
//!
//! - **Linux/Windows**: devices are identified by their Bluetooth address.
//! - **macOS**: addresses are hidden; the MAC embedded in the MiBeacon frame is
//!   used when present, otherwise the CoreBluetooth UUID.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use flora_core::{EngineConfig, GattPoller, MiBeaconDecoder, ReconciliationEngine, scan};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let adapter = scan::get_adapter(None).await?;
//!     let engine = ReconciliationEngine::new(
//!         EngineConfig::default(),
//!         Arc::new(MiBeaconDecoder::new()),
//!         Arc::new(GattPoller::new(adapter.clone())),
//!     );
//!     let mut events = engine.subscribe();
//!     let (tx, rx) = tokio::sync::mpsc::channel(256);
//!     let cancel = CancellationToken::new();
//!
//!     tokio::spawn(engine.run(rx, cancel.clone()));
//!     tokio::spawn(async move { scan::subscribe(&adapter, tx, cancel).await });
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod advertisement;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod mock;
pub mod registry;
pub mod scan;
pub mod scheduler;
pub mod traits;
pub mod util;

// Core exports
pub use advertisement::{Advertisement, MiBeaconDecoder, MiBeaconFrame, parse_mibeacon};
pub use device::{ConnectionConfig, GattPoller};
pub use engine::{AllowedDevice, EngineConfig, ReconciliationEngine};
pub use error::{DeviceNotFoundReason, Error, PublishError, Result};
pub use events::{EngineEvent, EventDispatcher, EventReceiver, EventSender, deliver};
pub use mock::{MockDecoder, MockPoller, MockPollerBuilder};
pub use registry::{DeviceHandle, DevicePhase, DeviceRegistry, DeviceSnapshot, DeviceState};
pub use scheduler::{PollDecision, should_poll};
pub use traits::{ActivePoller, Announcer, Decoder, Publisher};
pub use util::{create_identifier, format_peripheral_id};

// Re-export from flora-types
pub use flora_types::uuid as uuids;
pub use flora_types::{
    DeviceIdentity, DisplayName, FirmwareVersion, MacAddress, PollStats, SensorKind, SensorUpdate,
    SensorValues,
};
