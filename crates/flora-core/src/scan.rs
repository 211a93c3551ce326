//! Adapter selection and the advertisement feed.
//!
//! [`subscribe`] keeps the adapter scanning and turns every MiBeacon service
//! data event into an [`Advertisement`] on the engine's inbound channel.

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::StreamExt;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use flora_types::uuids::{MIBEACON_SERVICE, MIFLORA_LOCAL_NAMES, MIFLORA_PRODUCT_ID};
use flora_types::DeviceIdentity;

use crate::advertisement::{Advertisement, parse_mibeacon_mac};
use crate::error::{DeviceNotFoundReason, Error, Result};
use crate::util::{HIDDEN_ADDRESS, create_identifier, format_peripheral_id};

/// Get a Bluetooth adapter.
///
/// With a selector (`"hci0"`, or any part of the adapter description) the
/// first matching adapter is returned; without one, the first adapter.
pub async fn get_adapter(selector: Option<&str>) -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    let Some(selector) = selector else {
        return adapters
            .into_iter()
            .next()
            .ok_or(Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter));
    };

    for adapter in adapters {
        let info = adapter.adapter_info().await.unwrap_or_default();
        if info.to_lowercase().contains(&selector.to_lowercase()) {
            debug!("Using adapter {}", info);
            return Ok(adapter);
        }
    }
    Err(Error::DeviceNotFound(DeviceNotFoundReason::AdapterNotFound {
        selector: selector.to_string(),
    }))
}

/// Feed advertisements from `adapter` into `sender` until cancelled.
///
/// Returns when `cancel` fires, the receiver is dropped, or the adapter's
/// event stream ends.
pub async fn subscribe(
    adapter: &Adapter,
    sender: mpsc::Sender<Advertisement>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut events = adapter.events().await?;
    adapter.start_scan(ScanFilter::default()).await?;
    info!("Listening for MiBeacon advertisements");

    let outcome = loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            event = events.next() => match event {
                Some(event) => event,
                None => break Err(Error::invalid_data("adapter event stream ended")),
            },
        };

        let CentralEvent::ServiceDataAdvertisement { id, service_data } = event else {
            continue;
        };
        let Some(frame) = service_data.get(&MIBEACON_SERVICE) else {
            continue;
        };

        let advertisement = match to_advertisement(adapter, &id, frame.clone()).await {
            Ok(advertisement) => advertisement,
            Err(e) => {
                debug!("Skipping advertisement from {}: {}", format_peripheral_id(&id), e);
                continue;
            }
        };
        trace!(device = %advertisement.identity, "MiBeacon advertisement");
        if sender.send(advertisement).await.is_err() {
            debug!("Advertisement receiver closed");
            break Ok(());
        }
    };

    if let Err(e) = adapter.stop_scan().await {
        warn!("Failed to stop scan: {}", e);
    }
    info!("Stopped listening for advertisements");
    outcome
}

async fn to_advertisement(adapter: &Adapter, id: &PeripheralId, frame: Vec<u8>) -> Result<Advertisement> {
    let peripheral = adapter.peripheral(id).await?;
    let props = peripheral.properties().await?;
    let address = props
        .as_ref()
        .map(|p| p.address.to_string())
        .unwrap_or_else(|| HIDDEN_ADDRESS.to_string());
    let name = props.as_ref().and_then(|p| p.local_name.clone());
    let rssi = props.as_ref().and_then(|p| p.rssi);

    let identity = resolve_identity(&address, &frame, || create_identifier(&address, id));
    let connectable = is_connectable(name.as_deref(), &frame);

    let mut advertisement = Advertisement::new(identity, frame, OffsetDateTime::now_utc())
        .connectable(connectable);
    if let Some(name) = name {
        advertisement = advertisement.with_name(name);
    }
    if let Some(rssi) = rssi {
        advertisement = advertisement.with_rssi(rssi);
    }
    Ok(advertisement)
}

/// The radio address when visible, else the MAC inside the frame, else the platform ID.
fn resolve_identity(address: &str, frame: &[u8], fallback: impl FnOnce() -> String) -> DeviceIdentity {
    if address != HIDDEN_ADDRESS {
        return DeviceIdentity::new(address);
    }
    match parse_mibeacon_mac(frame) {
        Some(mac) => DeviceIdentity::from(mac),
        None => DeviceIdentity::new(fallback()),
    }
}

/// Mi Flora units accept connections; other MiBeacon products are treated as broadcast-only.
fn is_connectable(name: Option<&str>, frame: &[u8]) -> bool {
    if name.is_some_and(|name| MIFLORA_LOCAL_NAMES.contains(&name.trim())) {
        return true;
    }
    frame.len() >= 4 && u16::from_le_bytes([frame[2], frame[3]]) == MIFLORA_PRODUCT_ID
}
