//! `mqtt-homie`: the Homie 3.0 convention.
//!
//! Each plant is a Homie device at `{base}/{name}` with a single `sensor`
//! node whose properties are the sensor kinds. Every message is QoS 1 and
//! retained. All devices share one broker connection, so instead of a last
//! will per device every announced device is set to `disconnected` on
//! orderly shutdown.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use time::OffsetDateTime;

use flora_core::{DeviceSnapshot, PublishError};
use flora_types::{DisplayName, SensorKind, SensorUpdate};

use super::{Dialect, Message, SensorMeta, compact_iso_timestamp, join_topic, topic_name};

const HOMIE_VERSION: &str = "3.0";

/// Properties in the order `$properties` lists them.
const PROPERTIES: [SensorKind; 5] = [
    SensorKind::Battery,
    SensorKind::Conductivity,
    SensorKind::Illuminance,
    SensorKind::Moisture,
    SensorKind::Temperature,
];

pub struct Homie {
    base: String,
    /// Device topics announced so far.
    announced: Mutex<BTreeSet<String>>,
}

impl Homie {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            announced: Mutex::new(BTreeSet::new()),
        }
    }

    fn device_topic(&self, name: &DisplayName) -> String {
        join_topic(&self.base, &topic_name(name))
    }
}

fn attr(topic: &str, attribute: &str, value: impl Into<Vec<u8>>) -> Message {
    Message::new(format!("{}/{}", topic, attribute), value).durable()
}

impl Dialect for Homie {
    fn publish_messages(
        &self,
        name: &DisplayName,
        update: &SensorUpdate,
        _device: &DeviceSnapshot,
        at: OffsetDateTime,
    ) -> Result<Vec<Message>, PublishError> {
        let topic = self.device_topic(name);
        let mut messages = vec![attr(&topic, "$state", "ready")];
        for (kind, value) in update.values.iter() {
            messages.push(attr(
                &topic,
                &format!("sensor/{}", kind.short_name()),
                kind.format_value(value),
            ));
        }
        messages.push(attr(&topic, "$stats/timestamp", compact_iso_timestamp(at)));
        Ok(messages)
    }

    fn announce_messages(
        &self,
        name: &DisplayName,
        device: &DeviceSnapshot,
        at: OffsetDateTime,
    ) -> Result<Vec<Message>, PublishError> {
        let topic = self.device_topic(name);
        let mac = device
            .mac
            .as_ref()
            .map(|mac| mac.as_str())
            .unwrap_or(device.identity.as_str());

        let mut messages = vec![
            attr(&topic, "$homie", HOMIE_VERSION),
            attr(&topic, "$name", name.pretty.as_str()),
            attr(&topic, "$state", "ready"),
            attr(&topic, "$mac", mac),
            attr(&topic, "$stats", "interval,timestamp"),
            attr(&topic, "$stats/interval", device.poll_interval_secs.to_string()),
            attr(&topic, "$stats/timestamp", compact_iso_timestamp(at)),
            attr(&topic, "$fw/name", "miflora-firmware"),
            attr(&topic, "$fw/version", device.firmware.as_str()),
            attr(&topic, "$nodes", "sensor"),
        ];

        let node = format!("{}/sensor", topic);
        let properties: Vec<&str> = PROPERTIES.iter().map(SensorKind::short_name).collect();
        messages.push(attr(&node, "$name", "miflora"));
        messages.push(attr(&node, "$properties", properties.join(",")));

        for kind in PROPERTIES {
            let meta = SensorMeta::of(kind);
            let property = format!("{}/{}", node, kind.short_name());
            messages.push(attr(&property, "$name", kind.short_name()));
            messages.push(attr(&property, "$settable", "false"));
            messages.push(attr(&property, "$unit", kind.unit()));
            messages.push(attr(&property, "$datatype", meta.homie_datatype));
            messages.push(attr(&property, "$format", meta.homie_format));
            messages.push(attr(&property, "$retained", "true"));
        }

        self.announced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic);
        Ok(messages)
    }

    fn farewell_messages(&self) -> Vec<Message> {
        self.announced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|topic| attr(topic, "$state", "disconnected"))
            .collect()
    }
}
