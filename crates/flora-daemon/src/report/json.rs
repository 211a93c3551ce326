//! `json`: one line per update on stdout. No broker, no discovery.

use std::io::Write;

use async_trait::async_trait;
use serde_json::{Value, json};
use time::OffsetDateTime;

use flora_core::{Announcer, DeviceSnapshot, PublishError, Publisher};
use flora_types::{DisplayName, SensorUpdate};

use super::{plain_timestamp, values_object};

/// Render the line printed for one update.
pub fn render(
    name: &DisplayName,
    update: &SensorUpdate,
    device: &DeviceSnapshot,
    at: OffsetDateTime,
) -> Result<String, PublishError> {
    let mut data = values_object(&update.values);
    data.insert("timestamp".into(), json!(plain_timestamp(at)));
    data.insert("name".into(), json!(name.channel()));
    data.insert("name_pretty".into(), json!(name.pretty));
    data.insert(
        "mac".into(),
        json!(device.mac.as_ref().map(|mac| mac.as_str()).unwrap_or(device.identity.as_str())),
    );
    let firmware = update.firmware.as_ref().unwrap_or(&device.firmware);
    data.insert("firmware".into(), json!(firmware.as_str()));
    Ok(format!(
        "Data for \"{}\": {}",
        name.channel(),
        serde_json::to_string(&Value::Object(data))?
    ))
}

#[derive(Debug, Default)]
pub struct StdoutReporter;

impl StdoutReporter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Publisher for StdoutReporter {
    async fn publish(
        &self,
        name: &DisplayName,
        update: &SensorUpdate,
        device: &DeviceSnapshot,
    ) -> Result<(), PublishError> {
        let line = render(name, update, device, OffsetDateTime::now_utc())?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", line)?;
        stdout.flush()?;
        Ok(())
    }
}

#[async_trait]
impl Announcer for StdoutReporter {
    async fn announce(&self, _name: &DisplayName, _device: &DeviceSnapshot) -> Result<(), PublishError> {
        Ok(())
    }
}
