//! BLE advertisement events and MiBeacon payload decoding.
//!
//! Mi Flora sensors broadcast Xiaomi MiBeacon frames as service data under
//! UUID `0xFE95`. A frame carries at most a few sensor objects per broadcast
//! and never the battery level or firmware version, so the decoder marks
//! connectable sources as needing an active poll for the full reading.
//!
//! # Frame layout
//!
//! | Bytes | Field |
//! |-------|-------|
//! | 0-1 | Frame control (LE): bit 3 encrypted, bit 4 MAC, bit 5 capability, bit 6 object |
//! | 2-3 | Product id (LE), `0x0098` for Mi Flora |
//! | 4 | Frame counter |
//! | 5-10 | MAC address, reversed (if bit 4) |
//! | next | Capability byte (if bit 5) |
//! | rest | Objects: type (u16 LE), length (u8), data (if bit 6) |

use bytes::{Buf, Bytes};
use time::OffsetDateTime;
use tracing::debug;

use flora_types::{
    DeviceIdentity, MacAddress, ParseError, ParseResult, SensorKind, SensorUpdate, SensorValues,
};

use crate::traits::Decoder;

const FRAME_HEADER_LEN: usize = 5;

const FLAG_ENCRYPTED: u16 = 1 << 3;
const FLAG_MAC: u16 = 1 << 4;
const FLAG_CAPABILITY: u16 = 1 << 5;
const FLAG_OBJECT: u16 = 1 << 6;

const OBJECT_TEMPERATURE: u16 = 0x1004;
const OBJECT_ILLUMINANCE: u16 = 0x1007;
const OBJECT_MOISTURE: u16 = 0x1008;
const OBJECT_CONDUCTIVITY: u16 = 0x1009;
const OBJECT_BATTERY: u16 = 0x100A;

/// One advertisement as delivered by the radio layer.
#[derive(Debug, Clone)]
pub struct Advertisement {
    /// Source identity (radio address).
    pub identity: DeviceIdentity,
    /// Advertised local name, if the radio layer knows it.
    pub name: Option<String>,
    /// Raw service data frame.
    pub frame: Bytes,
    /// Whether the source accepts connections.
    pub connectable: bool,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// When the frame was received.
    pub received_at: OffsetDateTime,
}

impl Advertisement {
    pub fn new(
        identity: DeviceIdentity,
        frame: impl Into<Bytes>,
        received_at: OffsetDateTime,
    ) -> Self {
        Self {
            identity,
            name: None,
            frame: frame.into(),
            connectable: false,
            rssi: None,
            received_at,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn connectable(mut self, connectable: bool) -> Self {
        self.connectable = connectable;
        self
    }

    #[must_use]
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// The advertised name, if present and not blank.
    pub fn usable_name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

/// A parsed MiBeacon frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MiBeaconFrame {
    pub frame_control: u16,
    pub product_id: u16,
    pub counter: u8,
    /// Source MAC embedded in the frame.
    pub mac: Option<MacAddress>,
    /// Values from recognised objects.
    pub values: SensorValues,
}

impl MiBeaconFrame {
    pub fn is_encrypted(&self) -> bool {
        self.frame_control & FLAG_ENCRYPTED != 0
    }
}

/// Extract only the embedded MAC address of a frame.
///
/// Useful on platforms that hide peripheral addresses. Works on encrypted
/// frames since the MAC is sent in the clear.
pub fn parse_mibeacon_mac(data: &[u8]) -> Option<MacAddress> {
    let mut buf = data;
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    let frame_control = buf.get_u16_le();
    buf.advance(3);
    if frame_control & FLAG_MAC == 0 || buf.len() < 6 {
        return None;
    }
    Some(read_reversed_mac(&mut buf))
}

fn read_reversed_mac(buf: &mut &[u8]) -> MacAddress {
    let mut raw = [0u8; 6];
    buf.copy_to_slice(&mut raw);
    raw.reverse();
    MacAddress::from_bytes(raw)
}

/// Parse a MiBeacon service data frame.
///
/// Unknown object types are skipped.
///
/// # Errors
///
/// Returns [`ParseError::Encrypted`] for encrypted frames and
/// [`ParseError::InvalidData`] for truncated frames or objects.
pub fn parse_mibeacon(data: &[u8]) -> ParseResult<MiBeaconFrame> {
    let mut buf = data;
    if buf.remaining() < FRAME_HEADER_LEN {
        return Err(ParseError::invalid_data(format!(
            "MiBeacon frame requires at least {} bytes, got {}",
            FRAME_HEADER_LEN,
            data.len()
        )));
    }

    let frame_control = buf.get_u16_le();
    let product_id = buf.get_u16_le();
    let counter = buf.get_u8();

    let mac = if frame_control & FLAG_MAC != 0 {
        if buf.remaining() < 6 {
            return Err(ParseError::invalid_data("MiBeacon frame truncated in MAC"));
        }
        Some(read_reversed_mac(&mut buf))
    } else {
        None
    };

    if frame_control & FLAG_CAPABILITY != 0 {
        if !buf.has_remaining() {
            return Err(ParseError::invalid_data(
                "MiBeacon frame truncated in capability",
            ));
        }
        buf.advance(1);
    }

    if frame_control & FLAG_ENCRYPTED != 0 {
        return Err(ParseError::Encrypted);
    }

    let mut values = SensorValues::new();
    if frame_control & FLAG_OBJECT != 0 {
        while buf.remaining() >= 3 {
            let object_type = buf.get_u16_le();
            let len = usize::from(buf.get_u8());
            if buf.remaining() < len {
                return Err(ParseError::invalid_data(format!(
                    "MiBeacon object 0x{object_type:04X} declares {len} bytes, {} left",
                    buf.remaining()
                )));
            }
            let (object, rest) = buf.split_at(len);
            buf = rest;
            if let Some((kind, value)) = decode_object(object_type, object) {
                values.insert(kind, value);
            }
        }
    }

    Ok(MiBeaconFrame {
        frame_control,
        product_id,
        counter,
        mac,
        values,
    })
}

fn decode_object(object_type: u16, mut data: &[u8]) -> Option<(SensorKind, f64)> {
    match (object_type, data.len()) {
        (OBJECT_TEMPERATURE, 2..) => Some((
            SensorKind::Temperature,
            f64::from(data.get_i16_le()) / 10.0,
        )),
        (OBJECT_ILLUMINANCE, 3..) => Some((
            SensorKind::Illuminance,
            f64::from(u32::from_le_bytes([data[0], data[1], data[2], 0])),
        )),
        (OBJECT_MOISTURE, 1..) => Some((SensorKind::Moisture, f64::from(data[0]))),
        (OBJECT_CONDUCTIVITY, 2..) => Some((
            SensorKind::Conductivity,
            f64::from(data.get_u16_le()),
        )),
        (OBJECT_BATTERY, 1..) => Some((SensorKind::Battery, f64::from(data[0]))),
        _ => None,
    }
}

/// [`Decoder`] for MiBeacon service data.
///
/// Malformed frames decode to an empty update. Connectable sources whose
/// frame does not carry every sensor kind are hinted for an active poll.
#[derive(Debug, Clone, Default)]
pub struct MiBeaconDecoder {
    product_id: Option<u16>,
}

impl MiBeaconDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept frames from one product id.
    #[must_use]
    pub fn with_product(mut self, product_id: u16) -> Self {
        self.product_id = Some(product_id);
        self
    }
}

impl Decoder for MiBeaconDecoder {
    fn decode(
        &self,
        frame: &[u8],
        identity: &DeviceIdentity,
        _received_at: OffsetDateTime,
        connectable: bool,
    ) -> SensorUpdate {
        match parse_mibeacon(frame) {
            Ok(parsed) => {
                if self.product_id.is_some_and(|id| id != parsed.product_id) {
                    return SensorUpdate::default();
                }
                let complete = parsed.values.len() == SensorKind::ALL.len();
                SensorUpdate::passive(parsed.values).with_poll_hint(connectable && !complete)
            }
            Err(ParseError::Encrypted) => {
                debug!(%identity, "Encrypted MiBeacon frame");
                SensorUpdate::default().with_poll_hint(connectable)
            }
            Err(e) => {
                debug!(%identity, "Dropping malformed advertisement: {}", e);
                SensorUpdate::default()
            }
        }
    }
}
