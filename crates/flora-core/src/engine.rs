//! The reconciliation engine.
//!
//! The engine consumes advertisements from a single inbound channel and keeps
//! one [`DeviceState`] per admitted identity. A router task owns the inbound
//! channel and forwards each advertisement to a per-identity worker, so
//! events for one device are applied in receipt order while different devices
//! proceed independently. Active polls run on their own tasks and report back
//! to the worker that started them; nothing on the receive path waits for the
//! radio.
//!
//! # Per-advertisement step
//!
//! 1. Decode the frame.
//! 2. Merge non-empty passive values into the device (last write wins) and
//!    refresh `last_seen_at`.
//! 3. Ask the scheduler whether an active poll is due. If so, start it and
//!    defer this step's emission until it returns. Poll values are merged
//!    after passive ones, so they win for the same key.
//! 4. Announce if the firmware changed since the last announce, then emit one
//!    [`EngineEvent::SensorUpdate`] if any value changed in this step.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use flora_core::{EngineConfig, MiBeaconDecoder, MockPoller, ReconciliationEngine};
//!
//! let engine = ReconciliationEngine::new(
//!     EngineConfig::default(),
//!     Arc::new(MiBeaconDecoder::new()),
//!     Arc::new(MockPoller::new()),
//! );
//! let mut events = engine.subscribe();
//! let (tx, rx) = tokio::sync::mpsc::channel(256);
//! tokio::spawn(engine.run(rx, shutdown.clone()));
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use flora_types::{DeviceIdentity, DisplayName, FirmwareVersion, MacAddress, SensorUpdate};

use crate::advertisement::Advertisement;
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventDispatcher, EventReceiver};
use crate::registry::{DeviceHandle, DevicePhase, DeviceRegistry, DeviceState};
use crate::scheduler::PollDecision;
use crate::traits::{ActivePoller, Decoder};

/// A configured device: its address and display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedDevice {
    pub mac: MacAddress,
    pub name: DisplayName,
}

impl AllowedDevice {
    pub fn new(mac: MacAddress, name: DisplayName) -> Self {
        Self { mac, name }
    }
}

/// Engine settings, validated upstream.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum spacing between two active polls of one device.
    pub poll_interval: Duration,
    /// Devices to track. Empty means every named advertiser is tracked.
    pub allow_list: Vec<AllowedDevice>,
    /// Log capable devices that are not in a non-empty allow-list.
    pub probe_unconfigured: bool,
    /// Upper bound for one active poll.
    pub poll_timeout: Duration,
    /// Time in-flight polls get to finish on shutdown.
    pub shutdown_grace: Duration,
    /// Queue depth of each device worker.
    pub mailbox_capacity: usize,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
            allow_list: Vec::new(),
            probe_unconfigured: false,
            poll_timeout: Duration::from_secs(45),
            shutdown_grace: Duration::from_secs(5),
            mailbox_capacity: 64,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn allow(mut self, device: AllowedDevice) -> Self {
        self.allow_list.push(device);
        self
    }

    #[must_use]
    pub fn probe_unconfigured(mut self, enabled: bool) -> Self {
        self.probe_unconfigured = enabled;
        self
    }

    #[must_use]
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    #[must_use]
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

struct Shared {
    config: EngineConfig,
    allow: HashMap<DeviceIdentity, DisplayName>,
    registry: Arc<DeviceRegistry>,
    decoder: Arc<dyn Decoder>,
    poller: Arc<dyn ActivePoller>,
    events: EventDispatcher,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    poll_cancel: CancellationToken,
}

/// Device-state reconciliation and poll orchestration.
pub struct ReconciliationEngine {
    config: EngineConfig,
    registry: Arc<DeviceRegistry>,
    decoder: Arc<dyn Decoder>,
    poller: Arc<dyn ActivePoller>,
    events: EventDispatcher,
}

impl ReconciliationEngine {
    pub fn new(
        config: EngineConfig,
        decoder: Arc<dyn Decoder>,
        poller: Arc<dyn ActivePoller>,
    ) -> Self {
        let events = EventDispatcher::new(config.event_capacity);
        Self {
            config,
            registry: Arc::new(DeviceRegistry::new()),
            decoder,
            poller,
            events,
        }
    }

    /// Shared registry, readable while the engine runs.
    pub fn registry(&self) -> Arc<DeviceRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn events(&self) -> EventDispatcher {
        self.events.clone()
    }

    /// Subscribe to engine events. Subscribe before [`run`](Self::run) to see every event.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Process advertisements until `shutdown` fires or `inbound` closes.
    ///
    /// On return every device worker has drained its queue and every poll
    /// has either completed within the shutdown grace period or been
    /// abandoned.
    pub async fn run(self, mut inbound: mpsc::Receiver<Advertisement>, shutdown: CancellationToken) {
        let allow = self
            .config
            .allow_list
            .iter()
            .map(|device| (DeviceIdentity::from(&device.mac), device.name.clone()))
            .collect();
        let grace = self.config.shutdown_grace;
        let shared = Arc::new(Shared {
            config: self.config,
            allow,
            registry: self.registry,
            decoder: self.decoder,
            poller: self.poller,
            events: self.events,
            tracker: TaskTracker::new(),
            shutdown: shutdown.clone(),
            poll_cancel: CancellationToken::new(),
        });

        if shared.allow.is_empty() {
            info!("Reconciliation engine started, tracking every named device");
        } else {
            info!(
                "Reconciliation engine started, tracking {} configured devices",
                shared.allow.len()
            );
        }

        let mut router = Router::new(Arc::clone(&shared));
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping advertisement intake");
                    break;
                }
                received = inbound.recv() => match received {
                    Some(advertisement) => router.route(advertisement).await,
                    None => {
                        debug!("Advertisement source closed");
                        break;
                    }
                },
            }
        }

        // Dropping the router closes every worker mailbox.
        drop(router);
        shared.tracker.close();
        if tokio::time::timeout(grace, shared.tracker.wait()).await.is_err() {
            warn!("Active polls still running after {:?}, abandoning them", grace);
            shared.poll_cancel.cancel();
            shared.tracker.wait().await;
        }
        info!("Reconciliation engine stopped");
    }
}

/// Owns the inbound side: admission policy and worker fan-out.
struct Router {
    shared: Arc<Shared>,
    workers: HashMap<DeviceIdentity, mpsc::Sender<Advertisement>>,
    probed: HashSet<DeviceIdentity>,
}

impl Router {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            workers: HashMap::new(),
            probed: HashSet::new(),
        }
    }

    async fn route(&mut self, advertisement: Advertisement) {
        if let Some(mailbox) = self.workers.get(&advertisement.identity) {
            if let Err(mpsc::error::SendError(advertisement)) = mailbox.send(advertisement).await {
                error!(device = %advertisement.identity, "Device worker stopped unexpectedly");
                self.workers.remove(&advertisement.identity);
            }
            return;
        }

        let Some(name) = self.admit(&advertisement) else {
            return;
        };

        let identity = advertisement.identity.clone();
        let (mailbox, inbox) = mpsc::channel(self.shared.config.mailbox_capacity.max(1));
        let worker = DeviceWorker::new(identity.clone(), name, Arc::clone(&self.shared), inbox);
        self.shared.tracker.spawn(worker.run());
        if mailbox.send(advertisement).await.is_ok() {
            self.workers.insert(identity, mailbox);
        }
    }

    /// Decide whether an unseen identity gets state, returning its display name.
    fn admit(&mut self, advertisement: &Advertisement) -> Option<DisplayName> {
        if self.shared.allow.is_empty() {
            return match advertisement.usable_name() {
                Some(name) => Some(DisplayName::discovered(name, &advertisement.identity)),
                None => {
                    trace!(device = %advertisement.identity, "Ignoring unnamed advertiser");
                    None
                }
            };
        }

        if let Some(name) = self.shared.allow.get(&advertisement.identity) {
            return Some(name.clone());
        }

        if self.shared.config.probe_unconfigured {
            self.probe(advertisement);
        }
        None
    }

    fn probe(&mut self, advertisement: &Advertisement) {
        if self.probed.contains(&advertisement.identity) {
            return;
        }
        let update = self.shared.decoder.decode(
            &advertisement.frame,
            &advertisement.identity,
            advertisement.received_at,
            advertisement.connectable,
        );
        if update.is_empty() && !update.needs_poll {
            return;
        }
        info!(
            device = %advertisement.identity,
            name = advertisement.usable_name().unwrap_or("<unnamed>"),
            "Found unconfigured but capable device, add it to the sensor list to track it"
        );
        self.probed.insert(advertisement.identity.clone());
    }
}

struct InFlightPoll {
    result: oneshot::Receiver<Result<SensorUpdate>>,
    decided_at: OffsetDateTime,
    /// Whether the passive half of the deferred step changed a value.
    values_changed: bool,
}

/// Serialises all work for one identity.
struct DeviceWorker {
    identity: DeviceIdentity,
    name: DisplayName,
    shared: Arc<Shared>,
    inbox: mpsc::Receiver<Advertisement>,
    handle: Option<DeviceHandle>,
    in_flight: Option<InFlightPoll>,
    consecutive_failures: u32,
}

impl DeviceWorker {
    fn new(
        identity: DeviceIdentity,
        name: DisplayName,
        shared: Arc<Shared>,
        inbox: mpsc::Receiver<Advertisement>,
    ) -> Self {
        Self {
            identity,
            name,
            shared,
            inbox,
            handle: None,
            in_flight: None,
            consecutive_failures: 0,
        }
    }

    #[tracing::instrument(name = "device", skip_all, fields(device = %self.identity))]
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                result = next_poll_result(&mut self.in_flight) => self.finish_poll(result).await,
                received = self.inbox.recv() => match received {
                    Some(advertisement) => self.handle_advertisement(advertisement).await,
                    None => break,
                },
            }
        }

        if self.in_flight.is_some() {
            let result = next_poll_result(&mut self.in_flight).await;
            self.finish_poll(result).await;
        }
    }

    async fn device(&mut self) -> (DeviceHandle, bool) {
        if let Some(handle) = &self.handle {
            return (Arc::clone(handle), false);
        }
        let poll_interval = self.shared.config.poll_interval;
        let (handle, created) = self
            .shared
            .registry
            .get_or_create(&self.identity, || {
                DeviceState::new(self.identity.clone(), self.name.clone(), poll_interval)
            })
            .await;
        self.handle = Some(Arc::clone(&handle));
        (handle, created)
    }

    async fn handle_advertisement(&mut self, advertisement: Advertisement) {
        let update = self.shared.decoder.decode(
            &advertisement.frame,
            &self.identity,
            advertisement.received_at,
            advertisement.connectable,
        );

        let (handle, created) = self.device().await;
        let mut state = handle.lock().await;

        if created {
            info!(name = %state.name.label(), "Discovered device");
            self.announce(&mut state);
        }

        let mut values_changed = false;
        if !update.is_empty() {
            values_changed = state.latest_values.merge(&update.values);
            state.last_seen_at = Some(advertisement.received_at);
        }
        if let Some(firmware) = &update.firmware {
            apply_firmware(&mut state, firmware);
        }

        let decision = PollDecision::evaluate(&state, &update, advertisement.received_at);
        match decision {
            PollDecision::FirstPoll | PollDecision::Due if !self.shared.shutdown.is_cancelled() => {
                self.start_poll(&mut state, advertisement.received_at, values_changed);
                return;
            }
            PollDecision::RateLimited { remaining } => {
                trace!("Poll rate limited, next allowed in {}", remaining);
            }
            _ => {}
        }

        self.emit(&mut state, values_changed);
    }

    fn start_poll(&mut self, state: &mut DeviceState, decided_at: OffsetDateTime, values_changed: bool) {
        state.poll_in_flight = true;
        state.last_attempt_at = Some(decided_at);
        state.stats.count += 1;
        debug!(attempt = state.stats.count, "Starting active poll");

        let (tx, rx) = oneshot::channel();
        let poller = Arc::clone(&self.shared.poller);
        let identity = self.identity.clone();
        let cancel = self.shared.poll_cancel.clone();
        let limit = self.shared.config.poll_timeout;
        self.shared.tracker.spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                polled = tokio::time::timeout(limit, poller.poll(&identity)) => {
                    polled.unwrap_or_else(|_| Err(Error::timeout("active poll", limit)))
                }
            };
            // The worker may be gone if the engine was torn down.
            let _ = tx.send(result);
        });

        self.in_flight = Some(InFlightPoll {
            result: rx,
            decided_at,
            values_changed,
        });
    }

    async fn finish_poll(&mut self, result: Result<SensorUpdate>) {
        let Some(poll) = self.in_flight.take() else {
            return;
        };
        let (handle, _) = self.device().await;
        let mut state = handle.lock().await;
        state.poll_in_flight = false;

        let mut values_changed = poll.values_changed;
        match result {
            Ok(update) => {
                if let Some(firmware) = &update.firmware {
                    apply_firmware(&mut state, firmware);
                }
                if update.is_empty() {
                    state.stats.failure += 1;
                    self.record_failure(&"poll returned no sensor values");
                } else {
                    state.stats.success += 1;
                    self.consecutive_failures = 0;
                    values_changed |= state.latest_values.merge(&update.values);
                    state.last_polled_at = Some(poll.decided_at);
                    debug!(values = ?update.values, "Active poll succeeded");
                }
            }
            Err(e) if e.is_cancelled() => {
                debug!("Active poll abandoned on shutdown");
            }
            Err(e) => {
                state.stats.failure += 1;
                self.record_failure(&e);
            }
        }

        self.emit(&mut state, values_changed);
    }

    fn record_failure(&mut self, reason: &dyn Display) {
        self.consecutive_failures += 1;
        if self.consecutive_failures <= 3 {
            warn!(
                "Failed to poll {}: {} (attempt {})",
                self.name, reason, self.consecutive_failures
            );
        } else if self.consecutive_failures == 4 {
            error!(
                "Failed to poll {} after {} attempts, will continue trying silently",
                self.name, self.consecutive_failures
            );
        } else {
            debug!("Failed to poll {}: {}", self.name, reason);
        }
    }

    fn announce(&self, state: &mut DeviceState) {
        state.mark_announced();
        debug!(firmware = %state.firmware, "Announcing device");
        self.shared.events.send(EngineEvent::Announce {
            device: state.snapshot(),
        });
    }

    fn emit(&self, state: &mut DeviceState, values_changed: bool) {
        if state.needs_announce() {
            self.announce(state);
        }
        if values_changed {
            state.phase = DevicePhase::Active;
            let update = SensorUpdate {
                values: state.latest_values.clone(),
                firmware: Some(state.firmware.clone()),
                needs_poll: false,
            };
            self.shared.events.send(EngineEvent::SensorUpdate {
                device: state.snapshot(),
                update,
            });
        }
    }
}

/// Resolves with the outstanding poll's result, or never when there is none.
async fn next_poll_result(in_flight: &mut Option<InFlightPoll>) -> Result<SensorUpdate> {
    match in_flight {
        Some(poll) => (&mut poll.result).await.unwrap_or(Err(Error::Cancelled)),
        None => std::future::pending().await,
    }
}

fn apply_firmware(state: &mut DeviceState, firmware: &FirmwareVersion) {
    if &state.firmware == firmware {
        return;
    }
    info!(from = %state.firmware, to = %firmware, "Firmware version changed");
    if !firmware.is_unknown() && *firmware < FirmwareVersion::minimum_recommended() {
        warn!(
            "{} runs firmware {}, older than {}; realtime reads may return stale data",
            state.name,
            firmware,
            FirmwareVersion::minimum_recommended()
        );
    }
    state.firmware = firmware.clone();
}
