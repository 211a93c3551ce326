//! Reporting dialects.
//!
//! Each reporting method is a [`Dialect`]: a pure mapping from a device
//! update or announcement to MQTT [`Message`]s. [`MqttReporter`] sends the
//! messages over a shared [`MqttLink`]; the `json` method prints to stdout
//! instead and never touches a broker.
//!
//! | Method | Module |
//! |--------|--------|
//! | `json` | [`json`] |
//! | `mqtt-json` | [`mqtt_json`] |
//! | `mqtt-homie` | [`homie`] |
//! | `mqtt-smarthome` | [`smarthome`] |
//! | `homeassistant-mqtt` | [`homeassistant`] |
//! | `thingsboard-json` | [`thingsboard`] |
//! | `wirenboard-mqtt` | [`wirenboard`] |
//! | `gladys-mqtt` | [`gladys`] |

use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::QoS;
use serde_json::{Map, Number, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, warn};

use flora_core::{Announcer, DeviceSnapshot, PublishError, Publisher};
use flora_types::{DisplayName, SensorKind, SensorUpdate, SensorValues};

use crate::config::{Config, ReportingMode};

pub mod gladys;
pub mod homeassistant;
pub mod homie;
pub mod json;
pub mod link;
pub mod mqtt_json;
pub mod smarthome;
pub mod thingsboard;
pub mod wirenboard;

pub use link::MqttLink;

/// One MQTT publish request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl Message {
    /// A QoS 0, non-retained message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    #[must_use]
    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }

    #[must_use]
    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// QoS 1 and retained, the combination discovery metadata uses.
    #[must_use]
    pub fn durable(self) -> Self {
        self.qos(QoS::AtLeastOnce).retained()
    }

    pub fn json(topic: impl Into<String>, payload: &Value) -> Result<Self, PublishError> {
        Ok(Self::new(topic, serde_json::to_vec(payload)?))
    }

    /// The payload as text, for logs and tests.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// A topic layout and payload format for one reporting method.
///
/// Implementations are pure; `at` is the wall-clock time used for any
/// timestamps in the payloads.
pub trait Dialect: Send + Sync {
    fn publish_messages(
        &self,
        name: &DisplayName,
        update: &SensorUpdate,
        device: &DeviceSnapshot,
        at: OffsetDateTime,
    ) -> Result<Vec<Message>, PublishError>;

    /// Discovery metadata. Dialects without discovery publish nothing.
    fn announce_messages(
        &self,
        _name: &DisplayName,
        _device: &DeviceSnapshot,
        _at: OffsetDateTime,
    ) -> Result<Vec<Message>, PublishError> {
        Ok(Vec::new())
    }

    /// Last will registered with the broker.
    fn last_will(&self) -> Option<Message> {
        None
    }

    /// Published after every (re)connect.
    fn birth(&self) -> Option<Message> {
        None
    }

    /// Published on orderly shutdown, before the broker connection closes.
    fn farewell_messages(&self) -> Vec<Message> {
        Vec::new()
    }
}

/// [`Publisher`] and [`Announcer`] for any [`Dialect`] over MQTT.
pub struct MqttReporter<D> {
    dialect: D,
    link: Arc<MqttLink>,
}

impl<D: Dialect> MqttReporter<D> {
    pub fn new(dialect: D, link: Arc<MqttLink>) -> Self {
        Self { dialect, link }
    }
}

#[async_trait]
impl<D: Dialect> Publisher for MqttReporter<D> {
    async fn publish(
        &self,
        name: &DisplayName,
        update: &SensorUpdate,
        device: &DeviceSnapshot,
    ) -> Result<(), PublishError> {
        let messages =
            self.dialect
                .publish_messages(name, update, device, OffsetDateTime::now_utc())?;
        self.link.send_all(messages).await
    }
}

#[async_trait]
impl<D: Dialect> Announcer for MqttReporter<D> {
    async fn announce(&self, name: &DisplayName, device: &DeviceSnapshot) -> Result<(), PublishError> {
        let messages = self
            .dialect
            .announce_messages(name, device, OffsetDateTime::now_utc())?;
        self.link.send_all(messages).await
    }
}

/// Orderly end of a reporting session.
#[async_trait]
pub trait Session: Send + Sync {
    async fn close(&self);
}

#[async_trait]
impl<D: Dialect> Session for MqttReporter<D> {
    async fn close(&self) {
        let farewell = self.dialect.farewell_messages();
        if !farewell.is_empty() {
            debug!("Publishing {} shutdown messages", farewell.len());
            if let Err(e) = self.link.send_all(farewell).await {
                warn!("Failed to publish shutdown messages: {}", e);
            }
        }
        self.link.disconnect().await;
    }
}

/// The reporting side of the daemon, built from configuration.
pub struct Reporter {
    pub publisher: Arc<dyn Publisher>,
    pub announcer: Arc<dyn Announcer>,
    /// `None` for the stdout method.
    session: Option<Arc<dyn Session>>,
}

impl Reporter {
    /// Build the publisher for the configured method and connect to the broker if it needs one.
    pub fn from_config(config: &Config) -> Result<Self, PublishError> {
        let base = config.base_topic();
        match config.general.reporting_method {
            ReportingMode::Json => {
                let stdout = Arc::new(json::StdoutReporter::new());
                Ok(Self {
                    publisher: stdout.clone(),
                    announcer: stdout,
                    session: None,
                })
            }
            ReportingMode::MqttJson => Self::mqtt(config, mqtt_json::MqttJson::new(base)),
            ReportingMode::MqttHomie => Self::mqtt(config, homie::Homie::new(base)),
            ReportingMode::MqttSmarthome => Self::mqtt(config, smarthome::Smarthome::new(base)),
            ReportingMode::HomeassistantMqtt => {
                Self::mqtt(config, homeassistant::HomeAssistant::new(base))
            }
            ReportingMode::ThingsboardJson => {
                Self::mqtt(config, thingsboard::Thingsboard::new(&base))
            }
            ReportingMode::WirenboardMqtt => Self::mqtt(config, wirenboard::Wirenboard::new()),
            ReportingMode::GladysMqtt => Self::mqtt(config, gladys::Gladys::new(base)),
        }
    }

    fn mqtt<D: Dialect + 'static>(config: &Config, dialect: D) -> Result<Self, PublishError> {
        let link = Arc::new(MqttLink::connect(
            &config.mqtt,
            dialect.last_will(),
            dialect.birth(),
        )?);
        let reporter = Arc::new(MqttReporter::new(dialect, link));
        Ok(Self {
            publisher: reporter.clone(),
            announcer: reporter.clone(),
            session: Some(reporter),
        })
    }

    /// Publish any shutdown messages and disconnect from the broker, if connected.
    pub async fn close(&self) {
        if let Some(session) = &self.session {
            session.close().await;
        }
    }
}

/// Per-kind metadata used by the discovery dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorMeta {
    /// Home Assistant `device_class`, if one fits.
    pub device_class: Option<&'static str>,
    /// Homie `$datatype`.
    pub homie_datatype: &'static str,
    /// Homie `$format`.
    pub homie_format: &'static str,
}

impl SensorMeta {
    pub fn of(kind: SensorKind) -> Self {
        match kind {
            SensorKind::Illuminance => Self {
                device_class: Some("illuminance"),
                homie_datatype: "integer",
                homie_format: "0:50000",
            },
            SensorKind::Temperature => Self {
                device_class: Some("temperature"),
                homie_datatype: "float",
                homie_format: "*",
            },
            SensorKind::Moisture => Self {
                device_class: Some("humidity"),
                homie_datatype: "integer",
                homie_format: "0:100",
            },
            SensorKind::Conductivity => Self {
                device_class: None,
                homie_datatype: "integer",
                homie_format: "0:*",
            },
            SensorKind::Battery => Self {
                device_class: Some("battery"),
                homie_datatype: "integer",
                homie_format: "0:100",
            },
        }
    }
}

/// Every sensor value is a measurement.
pub const STATE_CLASS: &str = "measurement";

/// A value as a JSON number: whole for integer kinds, one decimal for temperature.
pub fn value_json(kind: SensorKind, value: f64) -> Value {
    if kind.is_integer() {
        Value::from(value.round() as i64)
    } else {
        Number::from_f64((value * 10.0).round() / 10.0)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Values keyed by [`SensorKind::key`].
pub fn values_object(values: &SensorValues) -> Map<String, Value> {
    values
        .iter()
        .map(|(kind, value)| (kind.key().to_string(), value_json(kind, value)))
        .collect()
}

/// `[year]-[month]-[day] [hour]:[minute]:[second]`, the timestamp shown to humans.
pub fn plain_timestamp(at: OffsetDateTime) -> String {
    format_timestamp(at, "[year]-[month]-[day] [hour]:[minute]:[second]")
}

/// ISO 8601 with a compact offset, e.g. `2026-10-18T07:30:00+0000`.
pub fn compact_iso_timestamp(at: OffsetDateTime) -> String {
    format_timestamp(
        at,
        "[year]-[month]-[day]T[hour]:[minute]:[second][offset_hour sign:mandatory][offset_minute]",
    )
}

fn format_timestamp(at: OffsetDateTime, pattern: &str) -> String {
    time::format_description::parse(pattern)
        .ok()
        .and_then(|format| at.format(&format).ok())
        .or_else(|| at.format(&Rfc3339).ok())
        .unwrap_or_else(|| at.unix_timestamp().to_string())
}

/// Milliseconds since the Unix epoch.
pub fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Lower-cased channel segment, the form most dialects put in topics.
pub fn topic_name(name: &DisplayName) -> String {
    name.channel().to_lowercase()
}

/// Join a base topic and a suffix, skipping the separator when the base is empty.
pub fn join_topic(base: &str, suffix: &str) -> String {
    if base.is_empty() {
        suffix.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), suffix)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the dialect tests.

    use std::time::Duration;

    use time::OffsetDateTime;

    use flora_core::{DeviceSnapshot, DeviceState};
    use flora_types::{
        DeviceIdentity, DisplayName, FirmwareVersion, SensorKind, SensorUpdate, SensorValues,
    };

    pub fn name() -> DisplayName {
        DisplayName::parse("Big Fig@Living Room")
    }

    pub fn values() -> SensorValues {
        SensorValues::new()
            .with(SensorKind::Illuminance, 1200.0)
            .with(SensorKind::Temperature, 21.46)
            .with(SensorKind::Moisture, 41.0)
            .with(SensorKind::Conductivity, 350.0)
            .with(SensorKind::Battery, 99.0)
    }

    pub fn firmware() -> FirmwareVersion {
        "3.2.1".parse().unwrap()
    }

    pub fn update() -> SensorUpdate {
        SensorUpdate::passive(values()).with_firmware(firmware())
    }

    pub fn device() -> DeviceSnapshot {
        let mut state = DeviceState::new(
            DeviceIdentity::new("C4:7C:8D:6A:12:34"),
            name(),
            Duration::from_secs(300),
        );
        state.firmware = firmware();
        state.latest_values = values();
        state.snapshot()
    }

    /// 2026-10-18 07:30:05 UTC
    pub fn at() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_792_308_605).unwrap()
    }
}
