//! Per-device state and the registry that owns it.
//!
//! The registry maps each [`DeviceIdentity`] to exactly one [`DeviceState`].
//! Entries are created lazily and never removed. Each entry sits behind its
//! own lock; the registry lock only guards the index and is never held while
//! a device lock is held, so unrelated devices never contend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};

use flora_types::{
    DeviceIdentity, DisplayName, FirmwareVersion, MacAddress, PollStats, SensorValues,
};

/// Lifecycle position of a known device. `Unknown` is implicit: no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePhase {
    /// Announced, no sensor value published yet.
    Discovered,
    /// At least one sensor update has been published.
    Active,
}

/// Everything known about one device.
#[derive(Debug, Clone)]
pub struct DeviceState {
    identity: DeviceIdentity,
    pub name: DisplayName,
    pub mac: Option<MacAddress>,
    pub firmware: FirmwareVersion,
    pub last_seen_at: Option<OffsetDateTime>,
    /// Set only by polls that returned at least one value.
    pub last_polled_at: Option<OffsetDateTime>,
    /// Start of the most recent poll, whatever its outcome. Polls are spaced from this.
    pub last_attempt_at: Option<OffsetDateTime>,
    /// Minimum spacing between two active polls.
    pub poll_interval: Duration,
    pub latest_values: SensorValues,
    pub stats: PollStats,
    /// Whether discovery metadata has been emitted in this process lifetime.
    pub announced: bool,
    pub phase: DevicePhase,
    pub(crate) announced_firmware: Option<FirmwareVersion>,
    pub(crate) poll_in_flight: bool,
}

impl DeviceState {
    pub fn new(identity: DeviceIdentity, name: DisplayName, poll_interval: Duration) -> Self {
        Self {
            mac: identity.mac(),
            identity,
            name,
            firmware: FirmwareVersion::default(),
            last_seen_at: None,
            last_polled_at: None,
            last_attempt_at: None,
            poll_interval,
            latest_values: SensorValues::new(),
            stats: PollStats::default(),
            announced: false,
            phase: DevicePhase::Discovered,
            announced_firmware: None,
            poll_in_flight: false,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// True while an active poll for this device is outstanding.
    pub fn is_polling(&self) -> bool {
        self.poll_in_flight
    }

    /// True when the current firmware has not been announced yet.
    pub fn needs_announce(&self) -> bool {
        self.announced_firmware.as_ref() != Some(&self.firmware)
    }

    /// Record that the current firmware has been announced.
    pub(crate) fn mark_announced(&mut self) {
        self.announced = true;
        self.announced_firmware = Some(self.firmware.clone());
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            identity: self.identity.clone(),
            name: self.name.clone(),
            mac: self.mac.clone(),
            firmware: self.firmware.clone(),
            last_seen_at: self.last_seen_at,
            last_polled_at: self.last_polled_at,
            last_attempt_at: self.last_attempt_at,
            poll_interval_secs: self.poll_interval.as_secs(),
            values: self.latest_values.clone(),
            stats: self.stats,
            announced: self.announced,
            phase: self.phase,
            polling: self.poll_in_flight,
        }
    }
}

/// Immutable copy of a [`DeviceState`], handed to publishers and the status API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub identity: DeviceIdentity,
    pub name: DisplayName,
    pub mac: Option<MacAddress>,
    pub firmware: FirmwareVersion,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_polled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_attempt_at: Option<OffsetDateTime>,
    pub poll_interval_secs: u64,
    pub values: SensorValues,
    pub stats: PollStats,
    pub announced: bool,
    pub phase: DevicePhase,
    pub polling: bool,
}

/// Shared handle to one device's state.
pub type DeviceHandle = Arc<Mutex<DeviceState>>;

#[derive(Default)]
struct Entries {
    index: HashMap<DeviceIdentity, usize>,
    devices: Vec<DeviceHandle>,
}

/// Identity to state mapping with per-device locking.
#[derive(Default)]
pub struct DeviceRegistry {
    entries: RwLock<Entries>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a device, creating it with `init` if absent.
    ///
    /// Returns the handle and whether this call created the entry. Concurrent
    /// callers for the same identity observe exactly one creation.
    pub async fn get_or_create<F>(&self, identity: &DeviceIdentity, init: F) -> (DeviceHandle, bool)
    where
        F: FnOnce() -> DeviceState,
    {
        if let Some(handle) = self.get(identity).await {
            return (handle, false);
        }

        let mut entries = self.entries.write().await;
        if let Some(&slot) = entries.index.get(identity) {
            return (Arc::clone(&entries.devices[slot]), false);
        }

        let state = init();
        debug_assert_eq!(state.identity(), identity);
        let handle = Arc::new(Mutex::new(state));
        let slot = entries.devices.len();
        entries.devices.push(Arc::clone(&handle));
        entries.index.insert(identity.clone(), slot);
        (handle, true)
    }

    pub async fn get(&self, identity: &DeviceIdentity) -> Option<DeviceHandle> {
        let entries = self.entries.read().await;
        entries
            .index
            .get(identity)
            .map(|&slot| Arc::clone(&entries.devices[slot]))
    }

    /// All devices in insertion order.
    pub async fn all(&self) -> Vec<DeviceHandle> {
        self.entries.read().await.devices.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.devices.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn snapshot(&self, identity: &DeviceIdentity) -> Option<DeviceSnapshot> {
        let handle = self.get(identity).await?;
        let state = handle.lock().await;
        Some(state.snapshot())
    }

    /// Snapshots of all devices in insertion order.
    pub async fn snapshots(&self) -> Vec<DeviceSnapshot> {
        // Handles are cloned first so the index lock is released before any device lock.
        let handles = self.all().await;
        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            snapshots.push(handle.lock().await.snapshot());
        }
        snapshots
    }
}
