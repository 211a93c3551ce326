//! Mock capabilities for testing.
//!
//! [`MockPoller`] and [`MockDecoder`] stand in for the radio so the engine
//! can be exercised without BLE hardware.
//!
//! # Features
//!
//! - **Scripted results**: per-device poll responses and frame decodings
//! - **Failure injection**: fail every poll, or only the next `n`
//! - **Latency simulation**: delay polls globally or for a single device

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::time::Instant;

use flora_types::{DeviceIdentity, FirmwareVersion, SensorKind, SensorUpdate, SensorValues};

use crate::error::{Error, Result};
use crate::traits::{ActivePoller, Decoder};

/// A scripted [`ActivePoller`].
///
/// # Example
///
/// ```
/// use flora_core::{ActivePoller, MockPoller};
/// use flora_types::DeviceIdentity;
///
/// #[tokio::main]
/// async fn main() {
///     let poller = MockPoller::builder().temperature(21.5).build();
///     let update = poller.poll(&DeviceIdentity::new("c4:7c:8d:00:00:01")).await.unwrap();
///     assert_eq!(update.values.len(), 5);
///     assert_eq!(poller.poll_count(), 1);
/// }
/// ```
pub struct MockPoller {
    response: RwLock<SensorUpdate>,
    per_device: RwLock<HashMap<DeviceIdentity, SensorUpdate>>,
    device_latency: RwLock<HashMap<DeviceIdentity, Duration>>,
    /// Simulated poll latency in milliseconds (0 = no delay).
    latency_ms: AtomicU64,
    should_fail: AtomicBool,
    fail_message: RwLock<String>,
    /// Polls left to fail before succeeding again.
    remaining_failures: AtomicU32,
    poll_count: AtomicU32,
    calls: Mutex<Vec<(DeviceIdentity, Instant)>>,
}

impl std::fmt::Debug for MockPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPoller")
            .field("poll_count", &self.poll_count.load(Ordering::Relaxed))
            .field("should_fail", &self.should_fail.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MockPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPoller {
    /// A poller that answers every device with [`MockPoller::default_update`].
    pub fn new() -> Self {
        Self::with_response(Self::default_update())
    }

    pub fn with_response(response: SensorUpdate) -> Self {
        Self {
            response: RwLock::new(response),
            per_device: RwLock::new(HashMap::new()),
            device_latency: RwLock::new(HashMap::new()),
            latency_ms: AtomicU64::new(0),
            should_fail: AtomicBool::new(false),
            fail_message: RwLock::new("Mock failure".to_string()),
            remaining_failures: AtomicU32::new(0),
            poll_count: AtomicU32::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn builder() -> MockPollerBuilder {
        MockPollerBuilder::default()
    }

    /// A full reading from a healthy plant on current firmware.
    pub fn default_update() -> SensorUpdate {
        SensorUpdate::passive(
            SensorValues::new()
                .with(SensorKind::Illuminance, 1200.0)
                .with(SensorKind::Temperature, 21.5)
                .with(SensorKind::Moisture, 38.0)
                .with(SensorKind::Conductivity, 410.0)
                .with(SensorKind::Battery, 97.0),
        )
        .with_firmware(FirmwareVersion::from_parts(&[3, 2, 1]))
    }

    // --- Test control methods ---

    pub async fn set_response(&self, response: SensorUpdate) {
        *self.response.write().await = response;
    }

    /// Answer polls of `identity` with `response` instead of the shared one.
    pub async fn set_device_response(&self, identity: &DeviceIdentity, response: SensorUpdate) {
        self.per_device
            .write()
            .await
            .insert(identity.clone(), response);
    }

    /// Make every poll fail until cleared.
    pub async fn set_should_fail(&self, fail: bool, message: Option<&str>) {
        self.should_fail.store(fail, Ordering::Relaxed);
        if let Some(msg) = message {
            *self.fail_message.write().await = msg.to_string();
        }
    }

    /// Fail the next `count` polls, then succeed.
    pub fn set_transient_failures(&self, count: u32) {
        self.remaining_failures.store(count, Ordering::Relaxed);
    }

    /// Set simulated latency for every poll.
    ///
    /// Set to `Duration::ZERO` to disable latency simulation.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Set simulated latency for one device, overriding the global latency.
    pub async fn set_device_latency(&self, identity: &DeviceIdentity, latency: Duration) {
        self.device_latency
            .write()
            .await
            .insert(identity.clone(), latency);
    }

    pub fn poll_count(&self) -> u32 {
        self.poll_count.load(Ordering::Relaxed)
    }

    /// Polls started for `identity`.
    pub fn polls_of(&self, identity: &DeviceIdentity) -> usize {
        self.calls()
            .iter()
            .filter(|(id, _)| id == identity)
            .count()
    }

    /// Every poll started so far, in call order.
    pub fn calls(&self) -> Vec<(DeviceIdentity, Instant)> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    async fn latency_for(&self, identity: &DeviceIdentity) -> Duration {
        if let Some(latency) = self.device_latency.read().await.get(identity) {
            return *latency;
        }
        Duration::from_millis(self.latency_ms.load(Ordering::Relaxed))
    }
}

#[async_trait]
impl ActivePoller for MockPoller {
    async fn poll(&self, identity: &DeviceIdentity) -> Result<SensorUpdate> {
        self.poll_count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((identity.clone(), Instant::now()));
        }

        let latency = self.latency_for(identity).await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.remaining_failures.load(Ordering::Relaxed) > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(Error::invalid_data(self.fail_message.read().await.clone()));
        }
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(Error::invalid_data(self.fail_message.read().await.clone()));
        }

        if let Some(response) = self.per_device.read().await.get(identity) {
            return Ok(response.clone());
        }
        Ok(self.response.read().await.clone())
    }
}

/// Builder for [`MockPoller`].
#[derive(Debug, Default)]
pub struct MockPollerBuilder {
    values: Option<SensorValues>,
    firmware: Option<FirmwareVersion>,
    latency: Duration,
    transient_failures: u32,
}

impl MockPollerBuilder {
    fn values_mut(&mut self) -> &mut SensorValues {
        self.values
            .get_or_insert_with(|| MockPoller::default_update().values)
    }

    #[must_use]
    pub fn value(mut self, kind: SensorKind, value: f64) -> Self {
        self.values_mut().insert(kind, value);
        self
    }

    #[must_use]
    pub fn temperature(self, celsius: f64) -> Self {
        self.value(SensorKind::Temperature, celsius)
    }

    #[must_use]
    pub fn moisture(self, percent: f64) -> Self {
        self.value(SensorKind::Moisture, percent)
    }

    #[must_use]
    pub fn battery(self, percent: f64) -> Self {
        self.value(SensorKind::Battery, percent)
    }

    /// Replace the whole value set; an empty set scripts a poll that reads nothing.
    #[must_use]
    pub fn values(mut self, values: SensorValues) -> Self {
        self.values = Some(values);
        self
    }

    #[must_use]
    pub fn firmware(mut self, firmware: FirmwareVersion) -> Self {
        self.firmware = Some(firmware);
        self
    }

    #[must_use]
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    #[must_use]
    pub fn transient_failures(mut self, count: u32) -> Self {
        self.transient_failures = count;
        self
    }

    #[must_use]
    pub fn build(self) -> MockPoller {
        let default = MockPoller::default_update();
        let mut response = SensorUpdate::passive(self.values.unwrap_or(default.values));
        response.firmware = self.firmware.or(default.firmware);
        let poller = MockPoller::with_response(response);
        poller.set_latency(self.latency);
        poller.set_transient_failures(self.transient_failures);
        poller
    }
}

/// A [`Decoder`] that maps exact frame bytes to scripted updates.
///
/// Unknown frames decode to an empty update without a poll hint.
#[derive(Debug, Default, Clone)]
pub struct MockDecoder {
    frames: HashMap<Vec<u8>, SensorUpdate>,
}

impl MockDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on(mut self, frame: &[u8], update: SensorUpdate) -> Self {
        self.frames.insert(frame.to_vec(), update);
        self
    }
}

impl Decoder for MockDecoder {
    fn decode(
        &self,
        frame: &[u8],
        _identity: &DeviceIdentity,
        _received_at: OffsetDateTime,
        _connectable: bool,
    ) -> SensorUpdate {
        self.frames.get(frame).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> DeviceIdentity {
        DeviceIdentity::new("c4:7c:8d:00:00:01")
    }

    #[tokio::test]
    async fn test_default_poll_returns_full_reading() {
        let poller = MockPoller::new();
        let update = poller.poll(&id()).await.unwrap();
        assert_eq!(update.values.len(), 5);
        assert_eq!(update.firmware.unwrap().as_str(), "3.2.1");
        assert!(!update.needs_poll);
        assert_eq!(poller.poll_count(), 1);
    }

    #[tokio::test]
    async fn test_should_fail() {
        let poller = MockPoller::new();
        poller.set_should_fail(true, Some("out of range")).await;
        let err = poller.poll(&id()).await.unwrap_err();
        assert!(err.to_string().contains("out of range"));

        poller.set_should_fail(false, None).await;
        assert!(poller.poll(&id()).await.is_ok());
        assert_eq!(poller.poll_count(), 2);
    }

    #[tokio::test]
    async fn test_transient_failures() {
        let poller = MockPoller::builder().transient_failures(2).build();
        assert!(poller.poll(&id()).await.is_err());
        assert!(poller.poll(&id()).await.is_err());
        assert!(poller.poll(&id()).await.is_ok());
    }

    #[tokio::test]
    async fn test_device_response_overrides_shared() {
        let poller = MockPoller::new();
        let other = DeviceIdentity::new("c4:7c:8d:00:00:02");
        poller
            .set_device_response(
                &other,
                SensorUpdate::passive(SensorValues::new().with(SensorKind::Moisture, 12.0)),
            )
            .await;

        assert_eq!(poller.poll(&id()).await.unwrap().values.len(), 5);
        let update = poller.poll(&other).await.unwrap();
        assert_eq!(update.values.get(SensorKind::Moisture), Some(12.0));
        assert_eq!(poller.polls_of(&other), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_simulated() {
        let poller = MockPoller::builder().latency(Duration::from_secs(3)).build();
        let start = Instant::now();
        poller.poll(&id()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[test]
    fn test_builder_values() {
        let poller = MockPoller::builder()
            .temperature(19.0)
            .firmware(FirmwareVersion::from_parts(&[2, 6, 2]))
            .build();
        let response = poller.response.try_read().unwrap().clone();
        assert_eq!(response.values.get(SensorKind::Temperature), Some(19.0));
        assert_eq!(response.values.get(SensorKind::Battery), Some(97.0));
        assert_eq!(response.firmware.unwrap().as_str(), "2.6.2");
    }

    #[test]
    fn test_mock_decoder() {
        let decoder = MockDecoder::new().on(b"hint", SensorUpdate::poll_hint());
        let update = decoder.decode(b"hint", &id(), OffsetDateTime::UNIX_EPOCH, true);
        assert!(update.needs_poll);
        let update = decoder.decode(b"other", &id(), OffsetDateTime::UNIX_EPOCH, true);
        assert!(update.is_empty());
        assert!(!update.needs_poll);
    }
}
