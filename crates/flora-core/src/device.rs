//! Connection-based reads of Mi Flora sensors.
//!
//! A full reading needs a GATT connection: the realtime data characteristic
//! holds the environmental values, and a second characteristic holds the
//! battery level and firmware version. Newer firmware only serves fresh data
//! after a mode command has been written.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use tokio::runtime::Handle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use flora_types::uuids::{CMD, DATA, FIRMWARE, READ_MODE_COMMAND};
use flora_types::{
    DeviceIdentity, FirmwareVersion, ParseError, ParseResult, SensorKind, SensorUpdate,
    SensorValues,
};

use crate::error::{Error, Result};
use crate::traits::ActivePoller;
use crate::util::create_identifier;

/// Default timeout for establishing a connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for one characteristic read or write.
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for service discovery.
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Firmware from which the mode command must precede a realtime read.
const MODE_COMMAND_SINCE: [u32; 3] = [2, 6, 6];

/// Payload some units return instead of a reading while they are busy.
const BUSY_PATTERN: [u8; 10] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0x99, 0x88, 0x77, 0x66];

/// Timeouts for one poll.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use flora_core::device::ConnectionConfig;
///
/// let config = ConnectionConfig::default().connection_timeout(Duration::from_secs(20));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connection_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub discovery_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_OPERATION_TIMEOUT,
            write_timeout: DEFAULT_OPERATION_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    #[must_use]
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Longest time one poll can take: connect, discover, two reads and the mode write.
    pub fn budget(&self) -> Duration {
        self.connection_timeout + self.discovery_timeout + self.read_timeout * 2 + self.write_timeout
    }
}

/// The part of a connected peripheral the guard needs.
#[async_trait]
trait Disconnect: Send + Sync + 'static {
    async fn disconnect(&self) -> Result<()>;
}

#[async_trait]
impl Disconnect for Peripheral {
    async fn disconnect(&self) -> Result<()> {
        btleplug::api::Peripheral::disconnect(self).await.map_err(Error::from)
    }
}

/// Disconnects when dropped, so a poll future dropped by a timeout or on
/// shutdown still releases the connection.
struct ConnectionGuard<P: Disconnect> {
    peripheral: Option<P>,
    identity: DeviceIdentity,
}

impl<P: Disconnect> ConnectionGuard<P> {
    fn new(peripheral: P, identity: DeviceIdentity) -> Self {
        Self {
            peripheral: Some(peripheral),
            identity,
        }
    }

    /// Disconnect in place and disarm the guard.
    async fn release(mut self) {
        if let Some(peripheral) = self.peripheral.take() {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Failed to disconnect from {}: {}", self.identity, e);
            }
        }
    }
}

impl<P: Disconnect> Drop for ConnectionGuard<P> {
    fn drop(&mut self) {
        let Some(peripheral) = self.peripheral.take() else {
            return;
        };
        let identity = self.identity.clone();
        match Handle::try_current() {
            Ok(handle) => {
                debug!(device = %identity, "Poll abandoned while connected, disconnecting");
                handle.spawn(async move {
                    if let Err(e) = peripheral.disconnect().await {
                        warn!("Failed to disconnect from {} after abandoned poll: {}", identity, e);
                    }
                });
            }
            Err(_) => warn!("No runtime to disconnect {} after abandoned poll", identity),
        }
    }
}

/// Parse the 16-byte realtime data characteristic.
///
/// | Bytes | Field |
/// |-------|-------|
/// | 0-1 | Temperature, i16 LE, 0.1 °C |
/// | 3-6 | Illuminance, u32 LE, lux |
/// | 7 | Moisture, % |
/// | 8-9 | Conductivity, u16 LE, µS/cm |
pub fn parse_realtime_data(data: &[u8]) -> ParseResult<SensorValues> {
    if data.len() < 10 {
        return Err(ParseError::invalid_data(format!(
            "realtime data too short: {} bytes",
            data.len()
        )));
    }
    if data[..10] == BUSY_PATTERN {
        return Err(ParseError::invalid_data("device returned its busy pattern"));
    }

    let temperature = f64::from(i16::from_le_bytes([data[0], data[1]])) / 10.0;
    let illuminance = u32::from_le_bytes([data[3], data[4], data[5], data[6]]);
    let moisture = data[7];
    let conductivity = u16::from_le_bytes([data[8], data[9]]);

    Ok(SensorValues::new()
        .with(SensorKind::Temperature, temperature)
        .with(SensorKind::Illuminance, f64::from(illuminance))
        .with(SensorKind::Moisture, f64::from(moisture))
        .with(SensorKind::Conductivity, f64::from(conductivity)))
}

/// Parse the 7-byte battery and firmware characteristic.
///
/// Byte 0 is the battery level in percent; bytes 2-6 are the ASCII firmware version.
pub fn parse_battery_firmware(data: &[u8]) -> ParseResult<(u8, FirmwareVersion)> {
    if data.len() < 3 {
        return Err(ParseError::invalid_data(format!(
            "firmware data too short: {} bytes",
            data.len()
        )));
    }
    let text = String::from_utf8_lossy(&data[2..]);
    let firmware = text
        .parse::<FirmwareVersion>()
        .map_err(|_| ParseError::InvalidFirmware(text.trim_end_matches('\0').to_string()))?;
    Ok((data[0], firmware))
}

/// [`ActivePoller`] that connects to the sensor over GATT.
///
/// Each poll connects, reads and disconnects. The connection is released on
/// every path, including read failures and a poll future that is dropped
/// before it finishes. The engine's poll timeout should exceed
/// [`ConnectionConfig::budget`].
pub struct GattPoller {
    adapter: Adapter,
    config: ConnectionConfig,
}

impl GattPoller {
    pub fn new(adapter: Adapter) -> Self {
        Self::with_config(adapter, ConnectionConfig::default())
    }

    pub fn with_config(adapter: Adapter, config: ConnectionConfig) -> Self {
        Self { adapter, config }
    }

    async fn find_peripheral(&self, identity: &DeviceIdentity) -> Result<Peripheral> {
        for peripheral in self.adapter.peripherals().await? {
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            let id = create_identifier(&props.address.to_string(), &peripheral.id());
            if id.eq_ignore_ascii_case(identity.as_str()) {
                return Ok(peripheral);
            }
        }
        Err(Error::device_not_found(identity.as_str()))
    }

    async fn read_all(&self, peripheral: &Peripheral) -> Result<SensorUpdate> {
        timeout(self.config.discovery_timeout, peripheral.discover_services())
            .await
            .map_err(|_| Error::timeout("discover services", self.config.discovery_timeout))??;

        let services = peripheral.services();
        let characteristics: HashMap<Uuid, Characteristic> = services
            .iter()
            .flat_map(|service| service.characteristics.iter())
            .map(|c| (c.uuid, c.clone()))
            .collect();
        let find = |uuid: Uuid| {
            characteristics
                .get(&uuid)
                .cloned()
                .ok_or_else(|| Error::characteristic_not_found(uuid.to_string(), services.len()))
        };

        let raw = self.read(peripheral, &find(FIRMWARE)?).await?;
        let (battery, firmware) = parse_battery_firmware(&raw)?;
        debug!(battery, %firmware, "Read battery and firmware");

        if firmware >= FirmwareVersion::from_parts(&MODE_COMMAND_SINCE) {
            let cmd = find(CMD)?;
            timeout(
                self.config.write_timeout,
                peripheral.write(&cmd, &READ_MODE_COMMAND, WriteType::WithResponse),
            )
            .await
            .map_err(|_| Error::timeout("write mode command", self.config.write_timeout))??;
        }

        let raw = self.read(peripheral, &find(DATA)?).await?;
        let values = parse_realtime_data(&raw)?.with(SensorKind::Battery, f64::from(battery));
        Ok(SensorUpdate::passive(values).with_firmware(firmware))
    }

    async fn read(&self, peripheral: &Peripheral, characteristic: &Characteristic) -> Result<Vec<u8>> {
        timeout(self.config.read_timeout, peripheral.read(characteristic))
            .await
            .map_err(|_| {
                Error::timeout(
                    format!("read characteristic {}", characteristic.uuid),
                    self.config.read_timeout,
                )
            })?
            .map_err(Error::from)
    }
}

#[async_trait]
impl ActivePoller for GattPoller {
    #[tracing::instrument(level = "debug", skip(self), fields(device = %identity))]
    async fn poll(&self, identity: &DeviceIdentity) -> Result<SensorUpdate> {
        let peripheral = self.find_peripheral(identity).await?;

        debug!("Connecting to device...");
        // Armed before connecting: a connect that completes after a timeout still gets released.
        let guard = ConnectionGuard::new(peripheral.clone(), identity.clone());
        timeout(self.config.connection_timeout, peripheral.connect())
            .await
            .map_err(|_| Error::timeout("connect to device", self.config.connection_timeout))??;

        let result = self.read_all(&peripheral).await;

        guard.release().await;
        if let Ok(update) = &result {
            info!("Polled {} values", update.values.len());
        }
        result
    }
}
