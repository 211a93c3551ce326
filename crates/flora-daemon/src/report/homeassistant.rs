//! `homeassistant-mqtt`: state JSON plus Home Assistant MQTT discovery.
//!
//! State goes to `{base}/sensor/{name}/state`. Discovery configs always live
//! under the `homeassistant/` prefix, one entity per sensor kind, and expire
//! after one and a half poll intervals without an update.

use serde_json::{Map, Value, json};
use time::OffsetDateTime;

use flora_core::{DeviceSnapshot, PublishError};
use flora_types::{DisplayName, SensorKind, SensorUpdate};

use super::{Dialect, Message, STATE_CLASS, SensorMeta, join_topic, topic_name, values_object};

const DISCOVERY_PREFIX: &str = "homeassistant";
const MANUFACTURER: &str = "Xiaomi";
const MODEL: &str = "MiFlora Plant Sensor (HHCCJCY01)";

pub struct HomeAssistant {
    base: String,
}

impl HomeAssistant {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    fn state_topic(&self, name: &DisplayName) -> String {
        join_topic(&self.base, &format!("sensor/{}/state", topic_name(name)))
    }
}

/// `Illuminance` for `illuminance`.
fn title(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn discovery_payload(
    kind: SensorKind,
    name: &DisplayName,
    device: &DeviceSnapshot,
    state_topic: &str,
) -> Value {
    let meta = SensorMeta::of(kind);
    let compact = match &device.mac {
        Some(mac) => mac.compact(),
        None => device
            .identity
            .as_str()
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect(),
    };

    let mut device_block = Map::new();
    device_block.insert("identifiers".into(), json!([format!("MiFlora{}", compact)]));
    if let Some(mac) = &device.mac {
        device_block.insert("connections".into(), json!([["mac", mac.as_str()]]));
    }
    device_block.insert("manufacturer".into(), json!(MANUFACTURER));
    device_block.insert("name".into(), json!(name.pretty));
    device_block.insert("model".into(), json!(MODEL));
    device_block.insert("sw_version".into(), json!(device.firmware.as_str()));

    let mut payload = Map::new();
    payload.insert("name".into(), json!(format!("{} {}", name.pretty, title(kind.key()))));
    payload.insert("unique_id".into(), json!(format!("{}-{}", compact, kind.key())));
    payload.insert("unit_of_measurement".into(), json!(kind.unit()));
    if let Some(class) = meta.device_class {
        payload.insert("device_class".into(), json!(class));
    }
    payload.insert("state_class".into(), json!(STATE_CLASS));
    payload.insert("state_topic".into(), json!(state_topic));
    payload.insert(
        "value_template".into(),
        json!(format!("{{{{ value_json.{} }}}}", kind.key())),
    );
    payload.insert("device".into(), Value::Object(device_block));
    payload.insert(
        "expire_after".into(),
        json!((device.poll_interval_secs * 3 / 2).to_string()),
    );
    Value::Object(payload)
}

impl Dialect for HomeAssistant {
    fn publish_messages(
        &self,
        name: &DisplayName,
        update: &SensorUpdate,
        _device: &DeviceSnapshot,
        _at: OffsetDateTime,
    ) -> Result<Vec<Message>, PublishError> {
        let payload = Value::Object(values_object(&update.values));
        Ok(vec![Message::json(self.state_topic(name), &payload)?.retained()])
    }

    fn announce_messages(
        &self,
        name: &DisplayName,
        device: &DeviceSnapshot,
        _at: OffsetDateTime,
    ) -> Result<Vec<Message>, PublishError> {
        let state_topic = self.state_topic(name);
        SensorKind::ALL
            .into_iter()
            .map(|kind| -> Result<Message, PublishError> {
                let topic = format!(
                    "{}/sensor/{}/{}/config",
                    DISCOVERY_PREFIX,
                    topic_name(name),
                    kind.key()
                );
                let payload = discovery_payload(kind, name, device, &state_topic);
                Ok(Message::json(topic, &payload)?.durable())
            })
            .collect()
    }
}
