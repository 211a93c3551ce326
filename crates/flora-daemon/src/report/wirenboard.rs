//! `wirenboard-mqtt`: Wiren Board virtual devices under `/devices/{name}`.

use time::OffsetDateTime;

use flora_core::{DeviceSnapshot, PublishError};
use flora_types::{DisplayName, SensorKind, SensorUpdate};

use super::{Dialect, Message, plain_timestamp};

/// Wiren Board control type and units per kind.
fn control_meta(kind: SensorKind) -> (&'static str, Option<&'static str>) {
    match kind {
        SensorKind::Battery => ("value", Some("%")),
        SensorKind::Conductivity => ("value", Some("µS/cm")),
        SensorKind::Illuminance => ("value", Some("lux")),
        SensorKind::Moisture => ("rel_humidity", None),
        SensorKind::Temperature => ("temperature", None),
    }
}

#[derive(Default)]
pub struct Wirenboard;

impl Wirenboard {
    pub fn new() -> Self {
        Self
    }
}

fn controls(name: &DisplayName) -> String {
    format!("/devices/{}/controls", name.channel())
}

impl Dialect for Wirenboard {
    fn publish_messages(
        &self,
        name: &DisplayName,
        update: &SensorUpdate,
        _device: &DeviceSnapshot,
        at: OffsetDateTime,
    ) -> Result<Vec<Message>, PublishError> {
        let controls = controls(name);
        let mut messages: Vec<Message> = update
            .values
            .iter()
            .map(|(kind, value)| {
                Message::new(
                    format!("{}/{}", controls, kind.short_name()),
                    kind.format_value(value),
                )
                .retained()
            })
            .collect();
        messages.push(
            Message::new(format!("{}/timestamp", controls), plain_timestamp(at)).retained(),
        );
        Ok(messages)
    }

    fn announce_messages(
        &self,
        name: &DisplayName,
        _device: &DeviceSnapshot,
        _at: OffsetDateTime,
    ) -> Result<Vec<Message>, PublishError> {
        let controls = controls(name);
        let mut messages = vec![
            Message::new(format!("/devices/{}/meta/name", name.channel()), name.pretty.as_str())
                .durable(),
        ];
        for kind in SensorKind::ALL {
            let (control_type, units) = control_meta(kind);
            let control = format!("{}/{}", controls, kind.short_name());
            messages.push(Message::new(format!("{}/meta/type", control), control_type).durable());
            if let Some(units) = units {
                messages.push(Message::new(format!("{}/meta/units", control), units).durable());
            }
        }
        messages.push(Message::new(format!("{}/timestamp/meta/type", controls), "text").durable());
        Ok(messages)
    }
}
