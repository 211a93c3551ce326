//! Integration tests for the reconciliation engine.
//!
//! These run against [`MockDecoder`] and [`MockPoller`] on a paused clock.
//! Sleeping a millisecond after a send lets every runnable task settle
//! before the next advertisement goes out.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use flora_core::{
    Advertisement, AllowedDevice, DeviceRegistry, DisplayName, EngineConfig, EngineEvent,
    EventReceiver, FirmwareVersion, MockDecoder, MockPoller, ReconciliationEngine, SensorKind,
    SensorUpdate, SensorValues,
};
use flora_types::{DeviceIdentity, MacAddress};

const FIG: &str = "aa:bb:cc:dd:ee:01";
const IVY: &str = "aa:bb:cc:dd:ee:02";

fn at(secs: i64) -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(secs)
}

fn id(s: &str) -> DeviceIdentity {
    DeviceIdentity::new(s)
}

fn values(pairs: &[(SensorKind, f64)]) -> SensorValues {
    pairs.iter().copied().collect()
}

fn allowed(mac: &str, label: &str) -> AllowedDevice {
    AllowedDevice::new(mac.parse::<MacAddress>().unwrap(), DisplayName::parse(label))
}

fn advertise(identity: &str, frame: &'static [u8], secs: i64) -> Advertisement {
    Advertisement::new(id(identity), Bytes::from_static(frame), at(secs))
        .with_name("Flower care")
        .connectable(true)
}

/// Frames understood by the default decoder.
fn decoder() -> MockDecoder {
    MockDecoder::new()
        .on(b"hint", SensorUpdate::poll_hint())
        .on(
            b"light-120",
            SensorUpdate::passive(values(&[(SensorKind::Illuminance, 120.0)])),
        )
        .on(
            b"moist-40+hint",
            SensorUpdate::passive(values(&[(SensorKind::Moisture, 40.0)])).with_poll_hint(true),
        )
        .on(
            b"temp-20+hint",
            SensorUpdate::passive(values(&[(SensorKind::Temperature, 20.0)])).with_poll_hint(true),
        )
}

struct Harness {
    inbound: mpsc::Sender<Advertisement>,
    events: EventReceiver,
    registry: Arc<DeviceRegistry>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Harness {
    fn start(config: EngineConfig, decoder: MockDecoder, poller: Arc<MockPoller>) -> Self {
        let engine = ReconciliationEngine::new(config, Arc::new(decoder), poller);
        let events = engine.subscribe();
        let registry = engine.registry();
        let (inbound, rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(engine.run(rx, shutdown.clone()));
        Self {
            inbound,
            events,
            registry,
            shutdown,
            task,
        }
    }

    async fn send(&self, advertisement: Advertisement) {
        self.inbound.send(advertisement).await.unwrap();
        settle().await;
    }

    fn drain(&mut self) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Close the inbound channel, wait for the engine to stop and return the remaining events.
    async fn finish(mut self) -> (Vec<EngineEvent>, Arc<DeviceRegistry>) {
        drop(self.inbound);
        self.task.await.unwrap();
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        (out, self.registry)
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn describe(event: &EngineEvent) -> String {
    match event {
        EngineEvent::Announce { device } => format!("announce {} {}", device.identity, device.firmware),
        EngineEvent::SensorUpdate { device, update } => {
            let mut parts: Vec<String> = update
                .values
                .iter()
                .map(|(kind, value)| format!("{}={}", kind.key(), value))
                .collect();
            parts.sort();
            format!("update {} {}", device.identity, parts.join(","))
        }
        _ => "other".to_string(),
    }
}

fn describe_all(events: &[EngineEvent]) -> Vec<String> {
    events.iter().map(describe).collect()
}

#[tokio::test(start_paused = true)]
async fn test_passive_then_poll_scenario() {
    let poller = Arc::new(MockPoller::with_response(
        SensorUpdate::passive(values(&[(SensorKind::Temperature, 21.5)]))
            .with_firmware("3.2.1".parse().unwrap()),
    ));
    let config = EngineConfig::default().allow(allowed("AA:BB:CC:DD:EE:01", "Fig"));
    let mut harness = Harness::start(config, decoder(), poller.clone());

    harness.send(advertise(FIG, b"light-120", 0)).await;
    assert_eq!(
        describe_all(&harness.drain()),
        [
            "announce aa:bb:cc:dd:ee:01 0.0.0",
            "update aa:bb:cc:dd:ee:01 illuminance=120",
        ]
    );
    assert_eq!(poller.poll_count(), 0);

    harness.send(advertise(FIG, b"hint", 1)).await;
    assert_eq!(poller.poll_count(), 1);
    assert_eq!(
        describe_all(&harness.drain()),
        [
            "announce aa:bb:cc:dd:ee:01 3.2.1",
            "update aa:bb:cc:dd:ee:01 illuminance=120,temperature=21.5",
        ]
    );

    harness.send(advertise(FIG, b"hint", 5)).await;
    assert_eq!(poller.poll_count(), 1);

    let (rest, registry) = harness.finish().await;
    assert!(rest.is_empty(), "unexpected events: {:?}", describe_all(&rest));

    let device = registry.snapshot(&id(FIG)).await.unwrap();
    assert_eq!(device.last_polled_at, Some(at(1)));
    assert_eq!(device.firmware.as_str(), "3.2.1");
    assert_eq!(device.stats.count, 1);
    assert_eq!(device.stats.success, 1);
    assert_eq!(device.name.pretty, "Fig");
}

#[tokio::test(start_paused = true)]
async fn test_noop_advertisements_emit_nothing() {
    let poller = Arc::new(MockPoller::new());
    let mut harness = Harness::start(EngineConfig::default(), decoder(), poller);

    harness.send(advertise(FIG, b"light-120", 0)).await;
    assert_eq!(harness.drain().len(), 2);

    harness.send(advertise(FIG, b"light-120", 10)).await;
    harness.send(advertise(FIG, b"garbage", 20)).await;
    let (rest, registry) = harness.finish().await;
    assert!(rest.is_empty(), "unexpected events: {:?}", describe_all(&rest));

    // A repeated value still refreshes last_seen_at; an undecodable frame does not.
    let device = registry.snapshot(&id(FIG)).await.unwrap();
    assert_eq!(device.last_seen_at, Some(at(10)));
}

#[tokio::test(start_paused = true)]
async fn test_poll_values_take_precedence_and_emit_once() {
    let poller = Arc::new(MockPoller::builder().temperature(21.5).build());
    let mut harness = Harness::start(EngineConfig::default(), decoder(), poller);

    harness.send(advertise(FIG, b"temp-20+hint", 0)).await;
    let events = harness.drain();
    let updates: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::SensorUpdate { .. }))
        .collect();
    assert_eq!(updates.len(), 1);
    if let EngineEvent::SensorUpdate { update, .. } = updates[0] {
        assert_eq!(update.values.get(SensorKind::Temperature), Some(21.5));
        assert_eq!(update.values.len(), 5);
        assert_eq!(update.firmware.as_ref().map(FirmwareVersion::as_str), Some("3.2.1"));
    }
    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_poll_spacing_respects_interval() {
    let poller = Arc::new(MockPoller::new());
    let config = EngineConfig::default().poll_interval(Duration::from_secs(300));
    let harness = Harness::start(config, decoder(), poller.clone());

    for secs in (0..1000).step_by(10) {
        harness.send(advertise(FIG, b"hint", secs)).await;
    }
    let (_, registry) = harness.finish().await;

    assert_eq!(poller.poll_count(), 4);
    let device = registry.snapshot(&id(FIG)).await.unwrap();
    assert_eq!(device.last_polled_at, Some(at(900)));
    assert_eq!(device.stats.count, 4);
}

#[tokio::test(start_paused = true)]
async fn test_failed_poll_is_retried_after_interval() {
    let poller = Arc::new(MockPoller::builder().transient_failures(1).build());
    let harness = Harness::start(EngineConfig::default(), decoder(), poller.clone());

    harness.send(advertise(FIG, b"hint", 0)).await;
    harness.send(advertise(FIG, b"hint", 3)).await;
    harness.send(advertise(FIG, b"hint", 300)).await;
    let (_, registry) = harness.finish().await;

    assert_eq!(poller.poll_count(), 2);
    let device = registry.snapshot(&id(FIG)).await.unwrap();
    assert_eq!(device.stats.count, 2);
    assert_eq!(device.stats.failure, 1);
    assert_eq!(device.stats.success, 1);
    assert_eq!(device.last_polled_at, Some(at(300)));
    assert_eq!(device.last_attempt_at, Some(at(300)));
}

#[tokio::test(start_paused = true)]
async fn test_failing_device_is_not_polled_on_every_hint() {
    let poller = Arc::new(MockPoller::new());
    poller.set_should_fail(true, Some("out of range")).await;
    let config = EngineConfig::default().poll_interval(Duration::from_secs(300));
    let harness = Harness::start(config, decoder(), poller.clone());

    for secs in (0..100).step_by(10) {
        harness.send(advertise(FIG, b"hint", secs)).await;
    }
    let (_, registry) = harness.finish().await;

    assert_eq!(poller.poll_count(), 1);
    let device = registry.snapshot(&id(FIG)).await.unwrap();
    assert_eq!(device.stats.count, 1);
    assert_eq!(device.stats.failure, 1);
    assert_eq!(device.last_polled_at, None);
    assert_eq!(device.last_attempt_at, Some(at(0)));
}

#[tokio::test(start_paused = true)]
async fn test_poll_failure_still_publishes_passive_values() {
    let poller = Arc::new(MockPoller::new());
    poller.set_should_fail(true, Some("connection refused")).await;
    let harness = Harness::start(EngineConfig::default(), decoder(), poller.clone());

    harness.send(advertise(FIG, b"moist-40+hint", 0)).await;
    let (events, registry) = harness.finish().await;

    assert_eq!(
        describe_all(&events),
        [
            "announce aa:bb:cc:dd:ee:01 0.0.0",
            "update aa:bb:cc:dd:ee:01 moisture=40",
        ]
    );
    let device = registry.snapshot(&id(FIG)).await.unwrap();
    assert_eq!(device.stats.count, 1);
    assert_eq!(device.stats.failure, 1);
    assert_eq!(device.stats.success_rate(), Some(0.0));
    assert_eq!(device.last_polled_at, None);
    assert!(!device.polling);
}

#[tokio::test(start_paused = true)]
async fn test_poll_timeout_counts_as_failure() {
    let poller = Arc::new(MockPoller::builder().latency(Duration::from_secs(120)).build());
    let config = EngineConfig::default()
        .poll_timeout(Duration::from_secs(10))
        .shutdown_grace(Duration::from_secs(30));
    let harness = Harness::start(config, decoder(), poller);

    harness.send(advertise(FIG, b"hint", 0)).await;
    let (_, registry) = harness.finish().await;

    let device = registry.snapshot(&id(FIG)).await.unwrap();
    assert_eq!(device.stats.failure, 1);
    assert_eq!(device.last_polled_at, None);
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_poll_suppresses_second_poll() {
    let poller = Arc::new(MockPoller::builder().latency(Duration::from_secs(30)).build());
    let config = EngineConfig::default()
        .poll_timeout(Duration::from_secs(60))
        .shutdown_grace(Duration::from_secs(60));
    let harness = Harness::start(config, decoder(), poller.clone());

    harness.send(advertise(FIG, b"hint", 0)).await;
    let device = harness.registry.snapshot(&id(FIG)).await.unwrap();
    assert!(device.polling);

    // Beyond the interval but while the first poll is outstanding.
    harness.send(advertise(FIG, b"hint", 400)).await;
    let (_, registry) = harness.finish().await;

    assert_eq!(poller.poll_count(), 1);
    let device = registry.snapshot(&id(FIG)).await.unwrap();
    assert!(!device.polling);
    assert_eq!(device.stats.success, 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_device_does_not_block_another() {
    let poller = Arc::new(MockPoller::new());
    poller
        .set_device_latency(&id(FIG), Duration::from_secs(25))
        .await;
    let config = EngineConfig::default().shutdown_grace(Duration::from_secs(60));
    let mut harness = Harness::start(config, decoder(), poller.clone());

    harness.send(advertise(FIG, b"hint", 0)).await;
    harness.send(advertise(IVY, b"hint", 0)).await;

    let ivy = harness.registry.snapshot(&id(IVY)).await.unwrap();
    assert_eq!(ivy.stats.success, 1);
    assert_eq!(ivy.values.len(), 5);
    let fig = harness.registry.snapshot(&id(FIG)).await.unwrap();
    assert!(fig.polling);
    assert!(fig.values.is_empty());

    let events = describe_all(&harness.drain());
    assert!(events.contains(&"announce aa:bb:cc:dd:ee:02 3.2.1".to_string()));
    assert!(!events.iter().any(|e| e.starts_with("update aa:bb:cc:dd:ee:01")));

    let (_, registry) = harness.finish().await;
    let fig = registry.snapshot(&id(FIG)).await.unwrap();
    assert_eq!(fig.stats.success, 1);
    assert_eq!(poller.polls_of(&id(FIG)), 1);
    assert_eq!(poller.polls_of(&id(IVY)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_firmware_change_reannounces_once() {
    let poller = Arc::new(MockPoller::new());
    let config = EngineConfig::default().poll_interval(Duration::from_secs(60));
    let harness = Harness::start(config, decoder(), poller.clone());

    harness.send(advertise(FIG, b"hint", 0)).await;
    harness.send(advertise(FIG, b"hint", 60)).await;
    poller
        .set_response(MockPoller::default_update().with_firmware("3.3.0".parse().unwrap()))
        .await;
    harness.send(advertise(FIG, b"hint", 120)).await;
    harness.send(advertise(FIG, b"hint", 180)).await;
    let (events, _) = harness.finish().await;

    let announces: Vec<_> = describe_all(&events)
        .into_iter()
        .filter(|e| e.starts_with("announce"))
        .collect();
    assert_eq!(
        announces,
        [
            "announce aa:bb:cc:dd:ee:01 0.0.0",
            "announce aa:bb:cc:dd:ee:01 3.2.1",
            "announce aa:bb:cc:dd:ee:01 3.3.0",
        ]
    );
    assert_eq!(poller.poll_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_allow_list_rejects_unlisted_devices() {
    let poller = Arc::new(MockPoller::new());
    let config = EngineConfig::default()
        .allow(allowed(FIG, "Fig@Hall"))
        .probe_unconfigured(true);
    let harness = Harness::start(config, decoder(), poller.clone());

    harness.send(advertise(IVY, b"moist-40+hint", 0)).await;
    harness.send(advertise(IVY, b"light-120", 1)).await;
    let (events, registry) = harness.finish().await;

    assert!(events.is_empty());
    assert!(registry.is_empty().await);
    assert_eq!(poller.poll_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_allow_listed_device_uses_configured_name() {
    let config = EngineConfig::default().allow(allowed(FIG, "Big Fig@Living Room"));
    let harness = Harness::start(config, decoder(), Arc::new(MockPoller::new()));

    // Allow-listed devices do not need to advertise a name.
    let unnamed = Advertisement::new(id(FIG), Bytes::from_static(b"light-120"), at(0));
    harness.send(unnamed).await;
    let (events, _) = harness.finish().await;

    assert_eq!(events.len(), 2);
    let name = events[0].name();
    assert_eq!(name.label(), "Big Fig@Living Room");
    assert_eq!(name.channel(), "Big-Fig");
}

#[tokio::test(start_paused = true)]
async fn test_empty_allow_list_accepts_named_devices() {
    let harness = Harness::start(EngineConfig::default(), decoder(), Arc::new(MockPoller::new()));

    let unnamed = Advertisement::new(id(IVY), Bytes::from_static(b"light-120"), at(0));
    harness.send(unnamed).await;
    harness.send(advertise(FIG, b"light-120", 1)).await;
    let (events, registry) = harness.finish().await;

    assert_eq!(registry.len().await, 1);
    assert!(registry.get(&id(IVY)).await.is_none());
    assert_eq!(events[0].name().channel(), "Flower-care-aabbccddee01");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_abandons_polls_after_grace() {
    let poller = Arc::new(MockPoller::builder().latency(Duration::from_secs(600)).build());
    let config = EngineConfig::default()
        .poll_timeout(Duration::from_secs(900))
        .shutdown_grace(Duration::from_secs(5));
    let harness = Harness::start(config, decoder(), poller);

    harness.send(advertise(FIG, b"moist-40+hint", 0)).await;
    let started = tokio::time::Instant::now();
    harness.shutdown.cancel();
    let (events, registry) = harness.finish().await;

    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(5), "waited {:?}", waited);
    assert!(waited < Duration::from_secs(600), "waited {:?}", waited);

    // The deferred passive value is still published; the abandoned poll is not a failure.
    assert_eq!(
        describe_all(&events),
        [
            "announce aa:bb:cc:dd:ee:01 0.0.0",
            "update aa:bb:cc:dd:ee:01 moisture=40",
        ]
    );
    let device = registry.snapshot(&id(FIG)).await.unwrap();
    assert_eq!(device.stats.count, 1);
    assert_eq!(device.stats.failure, 0);
    assert!(!device.polling);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_quick_polls() {
    let poller = Arc::new(MockPoller::builder().latency(Duration::from_secs(2)).build());
    let config = EngineConfig::default().shutdown_grace(Duration::from_secs(5));
    let harness = Harness::start(config, decoder(), poller);

    harness.send(advertise(FIG, b"hint", 0)).await;
    harness.shutdown.cancel();
    let (events, registry) = harness.finish().await;

    assert!(describe_all(&events).iter().any(|e| e.starts_with("update")));
    let device = registry.snapshot(&id(FIG)).await.unwrap();
    assert_eq!(device.stats.success, 1);
}

mod proptests {
    use super::*;

    fn frames() -> [&'static [u8]; 8] {
        [b"0", b"1", b"2", b"3", b"4", b"5", b"6", b"7"]
    }

    fn kind() -> impl Strategy<Value = SensorKind> {
        prop::sample::select(SensorKind::ALL.to_vec())
    }

    proptest! {
        /// The final state holds, per kind, the value from the last event that carried it.
        #[test]
        fn prop_last_write_wins(
            steps in prop::collection::vec(
                prop::collection::vec((kind(), 0u16..500), 0..4),
                1..8,
            )
        ) {
            let frames = frames();
            let mut decoder = MockDecoder::new();
            let mut expected = SensorValues::new();
            for (i, step) in steps.iter().enumerate() {
                let values: SensorValues =
                    step.iter().map(|(kind, v)| (*kind, f64::from(*v))).collect();
                let _ = expected.merge(&values);
                decoder = decoder.on(frames[i], SensorUpdate::passive(values));
            }

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .unwrap();
            let latest = runtime.block_on(async {
                let harness = Harness::start(EngineConfig::default(), decoder, Arc::new(MockPoller::new()));
                for (i, frame) in frames.iter().take(steps.len()).enumerate() {
                    harness.send(advertise(FIG, *frame, i as i64)).await;
                }
                let (_, registry) = harness.finish().await;
                registry.snapshot(&id(FIG)).await.map(|d| d.values)
            });

            prop_assert_eq!(latest.unwrap_or_default(), expected);
        }

        /// No two polls of one device start closer together than the poll interval,
        /// whether earlier polls succeeded or failed.
        #[test]
        fn prop_polls_are_spaced_by_interval(
            interval in 1u64..120,
            steps in prop::collection::vec((1u64..90, any::<bool>()), 1..40),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .unwrap();
            let calls = runtime.block_on(async {
                let poller = Arc::new(MockPoller::new());
                let config = EngineConfig::default().poll_interval(Duration::from_secs(interval));
                let harness = Harness::start(config, decoder(), poller.clone());
                let start = tokio::time::Instant::now();
                let mut secs = 0;
                for (gap, fail) in &steps {
                    secs += gap;
                    tokio::time::sleep_until(start + Duration::from_secs(secs)).await;
                    poller.set_should_fail(*fail, None).await;
                    harness.send(advertise(FIG, b"hint", secs as i64)).await;
                }
                harness.finish().await;
                poller.calls()
            });

            prop_assert!(!calls.is_empty());
            for pair in calls.windows(2) {
                let spacing = pair[1].1.duration_since(pair[0].1);
                // Each send settles for a millisecond before the clock is moved on.
                prop_assert!(
                    spacing + Duration::from_millis(5) >= Duration::from_secs(interval),
                    "polls {:?} apart with interval {}s",
                    spacing,
                    interval
                );
            }
        }
    }
}
