//! `mqtt-smarthome`: one retained `{"val", "ts"}` message per value.
//!
//! Connection state lives at `{base}/connected`: `1` while connected, `0`
//! through the last will.

use serde_json::json;
use time::OffsetDateTime;

use flora_core::{DeviceSnapshot, PublishError};
use flora_types::{DisplayName, SensorUpdate};

use super::{Dialect, Message, join_topic, unix_millis, value_json};

pub struct Smarthome {
    base: String,
}

impl Smarthome {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    fn connected(&self, state: &str) -> Message {
        Message::new(join_topic(&self.base, "connected"), state).retained()
    }
}

impl Dialect for Smarthome {
    fn publish_messages(
        &self,
        name: &DisplayName,
        update: &SensorUpdate,
        _device: &DeviceSnapshot,
        at: OffsetDateTime,
    ) -> Result<Vec<Message>, PublishError> {
        let ts = unix_millis(at);
        update
            .values
            .iter()
            .map(|(kind, value)| -> Result<Message, PublishError> {
                let topic = join_topic(
                    &self.base,
                    &format!("status/{}/{}", name.channel(), kind.key()),
                );
                let payload = json!({ "val": value_json(kind, value), "ts": ts });
                Ok(Message::json(topic, &payload)?.retained())
            })
            .collect()
    }

    fn announce_messages(
        &self,
        _name: &DisplayName,
        _device: &DeviceSnapshot,
        _at: OffsetDateTime,
    ) -> Result<Vec<Message>, PublishError> {
        Ok(vec![self.connected("1")])
    }

    fn last_will(&self) -> Option<Message> {
        Some(self.connected("0"))
    }

    fn birth(&self) -> Option<Message> {
        Some(self.connected("1"))
    }
}
