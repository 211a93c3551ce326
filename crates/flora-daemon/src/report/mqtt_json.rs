//! `mqtt-json`: one JSON object per device under `{base}/{name}`.
//!
//! Devices are announced in a retained map at `{base}/$announce`, keyed by
//! channel name. The last will clears that map.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use serde_json::{Value, json};
use time::OffsetDateTime;

use flora_core::{DeviceSnapshot, PublishError};
use flora_types::{DisplayName, SensorUpdate};

use super::{Dialect, Message, join_topic, values_object};

pub struct MqttJson {
    base: String,
    announced: Mutex<BTreeMap<String, Value>>,
}

impl MqttJson {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            announced: Mutex::new(BTreeMap::new()),
        }
    }

    fn announce_topic(&self) -> String {
        join_topic(&self.base, "$announce")
    }
}

impl Dialect for MqttJson {
    fn publish_messages(
        &self,
        name: &DisplayName,
        update: &SensorUpdate,
        _device: &DeviceSnapshot,
        _at: OffsetDateTime,
    ) -> Result<Vec<Message>, PublishError> {
        let payload = Value::Object(values_object(&update.values));
        Ok(vec![Message::json(join_topic(&self.base, name.channel()), &payload)?])
    }

    fn announce_messages(
        &self,
        name: &DisplayName,
        device: &DeviceSnapshot,
        _at: OffsetDateTime,
    ) -> Result<Vec<Message>, PublishError> {
        let info = json!({
            "name_pretty": name.pretty,
            "mac": device.mac.as_ref().map(|mac| mac.as_str()).unwrap_or(device.identity.as_str()),
            "refresh": device.poll_interval_secs,
            "location_clean": name.location_clean,
            "location_pretty": name.location_pretty,
            "firmware": device.firmware.as_str(),
            "topic": join_topic(&self.base, name.channel()),
        });

        let mut announced = self.announced.lock().unwrap_or_else(PoisonError::into_inner);
        announced.insert(name.channel().to_string(), info);
        let payload = serde_json::to_value(&*announced)?;
        drop(announced);

        Ok(vec![Message::json(self.announce_topic(), &payload)?.retained()])
    }

    fn last_will(&self) -> Option<Message> {
        Some(Message::new(self.announce_topic(), "{}").retained())
    }
}
