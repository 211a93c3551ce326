//! `gladys-mqtt`: Gladys Assistant feature topics.

use serde_json::Value;
use time::OffsetDateTime;

use flora_core::{DeviceSnapshot, PublishError};
use flora_types::{DisplayName, SensorKind, SensorUpdate};

use super::{Dialect, Message, join_topic, topic_name, values_object};

/// Feature state order.
const FEATURES: [SensorKind; 5] = [
    SensorKind::Battery,
    SensorKind::Moisture,
    SensorKind::Illuminance,
    SensorKind::Conductivity,
    SensorKind::Temperature,
];

pub struct Gladys {
    base: String,
}

impl Gladys {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    fn feature_topic(&self, name: &DisplayName) -> String {
        join_topic(&self.base, &format!("mqtt:miflora:{}/feature", topic_name(name)))
    }
}

impl Dialect for Gladys {
    fn publish_messages(
        &self,
        name: &DisplayName,
        update: &SensorUpdate,
        _device: &DeviceSnapshot,
        _at: OffsetDateTime,
    ) -> Result<Vec<Message>, PublishError> {
        let payload = Value::Object(values_object(&update.values));
        Ok(vec![Message::json(self.feature_topic(name), &payload)?])
    }

    /// Seeds each feature's state with the device's current value, if known.
    fn announce_messages(
        &self,
        name: &DisplayName,
        device: &DeviceSnapshot,
        _at: OffsetDateTime,
    ) -> Result<Vec<Message>, PublishError> {
        let topic = self.feature_topic(name);
        Ok(FEATURES
            .into_iter()
            .filter_map(|kind| {
                let value = device.values.get(kind)?;
                Some(
                    Message::new(
                        format!("{}/mqtt:{}/state", topic, kind.short_name()),
                        kind.format_value(value),
                    )
                    .durable(),
                )
            })
            .collect())
    }
}
