//! `thingsboard-json`: ThingsBoard gateway API.
//!
//! All devices share one connection, so the daemon acts as a ThingsBoard
//! gateway. Each device is registered on `<base>/connect` when it is
//! announced, and its values go to `<base>/telemetry` keyed by device name:
//! `{"<name>": [{"ts": <ms>, "values": {...}}]}`.

use serde_json::{Value, json};
use time::OffsetDateTime;

use flora_core::{DeviceSnapshot, PublishError};
use flora_types::{DisplayName, SensorUpdate};

use super::{Dialect, Message, join_topic, unix_millis, values_object};

/// Device type reported to the gateway on connect.
const DEVICE_TYPE: &str = "Mi Flora";

pub struct Thingsboard {
    telemetry: String,
    connect: String,
}

impl Thingsboard {
    /// `base` is the gateway topic prefix, normally `v1/gateway`.
    pub fn new(base: &str) -> Self {
        Self {
            telemetry: join_topic(base, "telemetry"),
            connect: join_topic(base, "connect"),
        }
    }
}

impl Dialect for Thingsboard {
    fn publish_messages(
        &self,
        name: &DisplayName,
        update: &SensorUpdate,
        _device: &DeviceSnapshot,
        at: OffsetDateTime,
    ) -> Result<Vec<Message>, PublishError> {
        let mut payload = serde_json::Map::new();
        payload.insert(
            name.pretty.clone(),
            json!([{ "ts": unix_millis(at), "values": Value::Object(values_object(&update.values)) }]),
        );
        Ok(vec![Message::json(self.telemetry.clone(), &Value::Object(payload))?])
    }

    fn announce_messages(
        &self,
        name: &DisplayName,
        _device: &DeviceSnapshot,
        _at: OffsetDateTime,
    ) -> Result<Vec<Message>, PublishError> {
        let payload = json!({ "device": name.pretty, "type": DEVICE_TYPE });
        Ok(vec![Message::json(self.connect.clone(), &payload)?])
    }
}
