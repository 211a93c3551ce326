//! Core types for Mi Flora sensor data and device bookkeeping.

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// A sensor channel reported by a Mi Flora device.
///
/// The set is closed: the hardware has exactly these five channels. Variant
/// order is the order channels are published in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum SensorKind {
    /// Ambient light in lux.
    Illuminance,
    /// Air temperature in degrees Celsius.
    Temperature,
    /// Soil moisture in percent.
    Moisture,
    /// Soil conductivity (fertility) in µS/cm.
    Conductivity,
    /// Battery level in percent.
    Battery,
}

impl SensorKind {
    /// Every sensor kind, in publish order.
    pub const ALL: [SensorKind; 5] = [
        SensorKind::Illuminance,
        SensorKind::Temperature,
        SensorKind::Moisture,
        SensorKind::Conductivity,
        SensorKind::Battery,
    ];

    /// Key used in JSON payloads.
    #[must_use]
    pub fn key(&self) -> &'static str {
        match self {
            SensorKind::Illuminance => "illuminance",
            SensorKind::Temperature => "temperature",
            SensorKind::Moisture => "moisture",
            SensorKind::Conductivity => "conductivity",
            SensorKind::Battery => "battery",
        }
    }

    /// Short property name used by topic-per-value dialects (`light` for illuminance).
    #[must_use]
    pub fn short_name(&self) -> &'static str {
        match self {
            SensorKind::Illuminance => "light",
            other => other.key(),
        }
    }

    /// Human readable label.
    #[must_use]
    pub fn display_name(&self) -> &'static str {
        match self {
            SensorKind::Illuminance => "Sunlight Intensity",
            SensorKind::Temperature => "Air Temperature",
            SensorKind::Moisture => "Soil Moisture",
            SensorKind::Conductivity => "Soil Conductivity/Fertility",
            SensorKind::Battery => "Sensor Battery Level",
        }
    }

    /// Unit of measurement.
    #[must_use]
    pub fn unit(&self) -> &'static str {
        match self {
            SensorKind::Illuminance => "lux",
            SensorKind::Temperature => "°C",
            SensorKind::Moisture | SensorKind::Battery => "%",
            SensorKind::Conductivity => "µS/cm",
        }
    }

    /// Whether values of this kind are whole numbers on the wire.
    #[must_use]
    pub fn is_integer(&self) -> bool {
        !matches!(self, SensorKind::Temperature)
    }

    /// Format a value the way it is published: integers without a fraction,
    /// temperature with one decimal.
    ///
    /// # Examples
    ///
    /// ```
    /// use flora_types::SensorKind;
    ///
    /// assert_eq!(SensorKind::Temperature.format_value(21.46), "21.5");
    /// assert_eq!(SensorKind::Illuminance.format_value(1200.0), "1200");
    /// ```
    #[must_use]
    pub fn format_value(&self, value: f64) -> String {
        if self.is_integer() {
            format!("{}", value.round() as i64)
        } else {
            format!("{value:.1}")
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for SensorKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "illuminance" | "light" => Ok(SensorKind::Illuminance),
            "temperature" => Ok(SensorKind::Temperature),
            "moisture" => Ok(SensorKind::Moisture),
            "conductivity" => Ok(SensorKind::Conductivity),
            "battery" => Ok(SensorKind::Battery),
            other => Err(ParseError::invalid_data(format!(
                "unknown sensor kind '{other}'"
            ))),
        }
    }
}

/// Latest numeric value per sensor kind. Keys are unique.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct SensorValues(BTreeMap<SensorKind, f64>);

impl SensorValues {
    /// Create an empty value set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, kind: SensorKind, value: f64) -> Self {
        self.0.insert(kind, value);
        self
    }

    /// Insert or replace a value, returning the previous one.
    pub fn insert(&mut self, kind: SensorKind, value: f64) -> Option<f64> {
        self.0.insert(kind, value)
    }

    #[must_use]
    pub fn get(&self, kind: SensorKind) -> Option<f64> {
        self.0.get(&kind).copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate values in publish order.
    pub fn iter(&self) -> impl Iterator<Item = (SensorKind, f64)> + '_ {
        self.0.iter().map(|(kind, value)| (*kind, *value))
    }

    /// Overwrite every key present in `other` (last write wins).
    ///
    /// Returns `true` if at least one stored value was added or changed.
    pub fn merge(&mut self, other: &SensorValues) -> bool {
        let mut changed = false;
        for (kind, value) in other.iter() {
            if self.0.insert(kind, value) != Some(value) {
                changed = true;
            }
        }
        changed
    }
}

impl FromIterator<(SensorKind, f64)> for SensorValues {
    fn from_iter<I: IntoIterator<Item = (SensorKind, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The result of decoding one advertisement or of one active poll.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SensorUpdate {
    /// Decoded values, possibly empty.
    pub values: SensorValues,
    /// Firmware version, when the source carries one.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub firmware: Option<FirmwareVersion>,
    /// The payload encoding cannot carry the full reading; a connection read is needed.
    pub needs_poll: bool,
}

impl SensorUpdate {
    /// An update with passive values and no poll hint.
    #[must_use]
    pub fn passive(values: SensorValues) -> Self {
        Self {
            values,
            firmware: None,
            needs_poll: false,
        }
    }

    /// An update without values that asks for an active poll.
    #[must_use]
    pub fn poll_hint() -> Self {
        Self {
            needs_poll: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_firmware(mut self, firmware: FirmwareVersion) -> Self {
        self.firmware = Some(firmware);
        self
    }

    #[must_use]
    pub fn with_poll_hint(mut self, needs_poll: bool) -> Self {
        self.needs_poll = needs_poll;
        self
    }

    /// True when no sensor value was decoded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Device firmware version, compared as a numeric tuple.
///
/// `"3.10.0"` is newer than `"3.9.1"`. The original text is kept for display.
#[derive(Debug, Clone)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(try_from = "String", into = "String")
)]
pub struct FirmwareVersion {
    raw: String,
    parts: Vec<u32>,
}

impl FirmwareVersion {
    /// Placeholder for devices whose firmware has not been read yet.
    pub const UNKNOWN: &'static str = "0.0.0";

    /// Oldest firmware that serves realtime data reliably.
    #[must_use]
    pub fn minimum_recommended() -> Self {
        Self::from_parts(&[3, 1, 9])
    }

    #[must_use]
    pub fn from_parts(parts: &[u32]) -> Self {
        let raw = parts
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(".");
        Self {
            raw,
            parts: parts.to_vec(),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn parts(&self) -> &[u32] {
        &self.parts
    }

    /// True for the `0.0.0` placeholder.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.parts.iter().all(|part| *part == 0)
    }
}

impl Default for FirmwareVersion {
    fn default() -> Self {
        Self::from_parts(&[0, 0, 0])
    }
}

impl FromStr for FirmwareVersion {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Devices pad the ASCII field with NULs.
        let raw = s.trim_matches(|c: char| c == '\0' || c.is_whitespace());
        if raw.is_empty() {
            return Err(ParseError::InvalidFirmware(s.to_string()));
        }
        let parts = raw
            .split('.')
            .map(|part| {
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(ParseError::InvalidFirmware(s.to_string()));
                }
                part.parse::<u32>()
                    .map_err(|_| ParseError::InvalidFirmware(s.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            raw: raw.to_string(),
            parts,
        })
    }
}

impl TryFrom<String> for FirmwareVersion {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FirmwareVersion> for String {
    fn from(value: FirmwareVersion) -> Self {
        value.raw
    }
}

impl PartialEq for FirmwareVersion {
    fn eq(&self, other: &Self) -> bool {
        self.parts == other.parts
    }
}

impl Eq for FirmwareVersion {}

impl core::hash::Hash for FirmwareVersion {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.parts.hash(state);
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.parts.cmp(&other.parts)
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A Bluetooth MAC address in canonical lower-case `aa:bb:cc:dd:ee:ff` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(try_from = "String", into = "String")
)]
pub struct MacAddress(String);

impl MacAddress {
    /// Check the strict six hex-pair form. Case is ignored.
    ///
    /// ```
    /// use flora_types::MacAddress;
    ///
    /// assert!(MacAddress::is_valid("C4:7C:8D:6A:12:34"));
    /// assert!(!MacAddress::is_valid("c4:7c:8d:6a:12"));
    /// assert!(!MacAddress::is_valid("c4-7c-8d-6a-12-34"));
    /// ```
    #[must_use]
    pub fn is_valid(s: &str) -> bool {
        let bytes = s.as_bytes();
        bytes.len() == 17
            && bytes.iter().enumerate().all(|(i, b)| {
                if i % 3 == 2 {
                    *b == b':'
                } else {
                    b.is_ascii_hexdigit()
                }
            })
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        Self(format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
        ))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The address without separators, e.g. `c47c8d6a1234`.
    #[must_use]
    pub fn compact(&self) -> String {
        self.0.replace(':', "")
    }
}

impl FromStr for MacAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        if Self::is_valid(&lower) {
            Ok(Self(lower))
        } else {
            Err(ParseError::InvalidMac(s.to_string()))
        }
    }
}

impl TryFrom<String> for MacAddress {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(value: MacAddress) -> Self {
        value.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable key of a physical device, normally its radio address.
///
/// Identities are trimmed and lower-cased on construction so that the same
/// radio address always maps to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_ascii_lowercase())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The identity as a MAC address, if it is one. Platforms that hide
    /// addresses (macOS) hand out UUIDs instead.
    #[must_use]
    pub fn mac(&self) -> Option<MacAddress> {
        self.0.parse().ok()
    }
}

impl From<MacAddress> for DeviceIdentity {
    fn from(mac: MacAddress) -> Self {
        Self(mac.0)
    }
}

impl From<&MacAddress> for DeviceIdentity {
    fn from(mac: &MacAddress) -> Self {
        Self(mac.0.clone())
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Active poll counters for one device. Only ever incremented.
///
/// `count` counts attempts; an attempt counts once whatever its outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PollStats {
    pub count: u64,
    pub success: u64,
    pub failure: u64,
}

impl PollStats {
    /// Fraction of attempts that succeeded, `None` before the first attempt.
    #[must_use]
    pub fn success_rate(&self) -> Option<f64> {
        (self.count > 0).then(|| self.success as f64 / self.count as f64)
    }
}
