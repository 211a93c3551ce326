//! Capability traits at the edges of the reconciliation engine.
//!
//! The engine owns device state and decisions. Everything that touches the
//! outside world is behind one of these traits so that the radio and the
//! message broker can be swapped for mocks in tests:
//!
//! - [`Decoder`]: pure advertisement decoding
//! - [`ActivePoller`]: connection-based reads
//! - [`Publisher`] / [`Announcer`]: event consumers, one implementation per
//!   reporting dialect

use async_trait::async_trait;
use time::OffsetDateTime;

use flora_types::{DeviceIdentity, DisplayName, SensorUpdate};

use crate::error::{PublishError, Result};
use crate::registry::DeviceSnapshot;

/// Turns a raw advertisement frame into a [`SensorUpdate`].
///
/// Implementations must be pure and must never fail: malformed input decodes
/// to an empty update.
pub trait Decoder: Send + Sync {
    fn decode(
        &self,
        frame: &[u8],
        identity: &DeviceIdentity,
        received_at: OffsetDateTime,
        connectable: bool,
    ) -> SensorUpdate;
}

/// Performs a connection-based read of one device.
///
/// A poll may take several seconds. The engine runs each poll on its own task
/// and drops the future on shutdown, so implementations must tolerate being
/// cancelled at any await point.
///
/// # Example
///
/// ```ignore
/// use flora_core::{ActivePoller, Result};
///
/// async fn poll_once<P: ActivePoller>(poller: &P, id: &DeviceIdentity) -> Result<()> {
///     let update = poller.poll(id).await?;
///     println!("{:?}", update.values);
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait ActivePoller: Send + Sync {
    async fn poll(&self, identity: &DeviceIdentity) -> Result<SensorUpdate>;
}

/// Publishes sensor values for one device.
///
/// `update` carries the device's full latest values and current firmware.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        name: &DisplayName,
        update: &SensorUpdate,
        device: &DeviceSnapshot,
    ) -> std::result::Result<(), PublishError>;
}

/// Publishes discovery metadata for one device.
///
/// The engine announces once per (identity, firmware) pair, but
/// implementations must tolerate duplicate announces.
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(
        &self,
        name: &DisplayName,
        device: &DeviceSnapshot,
    ) -> std::result::Result<(), PublishError>;
}
