//! Display names and their topic-safe forms.
//!
//! Configured sensor names look like `"Big Fig@Living Room"`: a plant name,
//! optionally followed by a location after `@`. Each half is kept as typed
//! for humans and normalised with [`clean_identifier`] for use as a publish
//! channel segment.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::types::DeviceIdentity;

/// Separator between plant name and location.
pub const LOCATION_SEPARATOR: char = '@';

/// German umlauts get their two-letter spelling before general transliteration.
const UMLAUTS: &[(char, &str)] = &[
    ('ä', "ae"),
    ('Ä', "Ae"),
    ('ö', "oe"),
    ('Ö', "Oe"),
    ('ü', "ue"),
    ('Ü', "Ue"),
    ('ß', "ss"),
];

/// Normalise a name for use as a topic segment.
///
/// German umlauts are spelled out (`ä` to `ae`), every other non-ASCII
/// character is transliterated to ASCII (`é` to `e`, `Ф` to `F`, `多` to
/// `Duo`) and characters without a transliteration are dropped. Surrounding
/// whitespace is trimmed and inner whitespace runs collapse to a single `-`.
///
/// # Examples
///
/// ```
/// use flora_types::clean_identifier;
///
/// assert_eq!(clean_identifier("  Große  Pflanze "), "Grosse-Pflanze");
/// assert_eq!(clean_identifier("Küche"), "Kueche");
/// assert_eq!(clean_identifier("Café"), "Cafe");
/// assert_eq!(clean_identifier("Фикус"), "Fikus");
/// ```
#[must_use]
pub fn clean_identifier(name: &str) -> String {
    let mut ascii = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii() {
            ascii.push(c);
        } else if let Some((_, spelled)) = UMLAUTS.iter().find(|(from, _)| *from == c) {
            ascii.push_str(spelled);
        } else if let Some(transliterated) = deunicode::deunicode_char(c) {
            ascii.push_str(transliterated);
        }
    }
    // Transliterated CJK syllables carry their own separating spaces.
    ascii.split_whitespace().collect::<Vec<_>>().join("-")
}

/// Human label of a device plus the normalised channel forms.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DisplayName {
    /// Plant name as configured.
    pub pretty: String,
    /// Location as configured, empty when absent.
    pub location_pretty: String,
    /// Normalised plant name.
    pub clean: String,
    /// Normalised location, empty when absent.
    pub location_clean: String,
}

impl DisplayName {
    /// Parse a configured `name@location` label.
    ///
    /// ```
    /// use flora_types::DisplayName;
    ///
    /// let name = DisplayName::parse("Big Fig@Living Room");
    /// assert_eq!(name.pretty, "Big Fig");
    /// assert_eq!(name.location_clean, "Living-Room");
    /// assert_eq!(name.channel(), "Big-Fig");
    /// ```
    #[must_use]
    pub fn parse(label: &str) -> Self {
        let (pretty, location) = label
            .split_once(LOCATION_SEPARATOR)
            .unwrap_or((label, ""));
        let pretty = pretty.trim().to_string();
        let location_pretty = location.trim().to_string();
        Self {
            clean: clean_identifier(&pretty),
            location_clean: clean_identifier(&location_pretty),
            pretty,
            location_pretty,
        }
    }

    /// Name for a device that is not in the allow-list: the advertised name
    /// suffixed with the compact identity so that identical stock names
    /// (`"Flower care"`) stay distinct.
    #[must_use]
    pub fn discovered(advertised: &str, identity: &DeviceIdentity) -> Self {
        let suffix: String = identity
            .as_str()
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect();
        let pretty = advertised.trim().to_string();
        Self {
            clean: clean_identifier(&format!("{pretty} {suffix}")),
            location_clean: String::new(),
            pretty,
            location_pretty: String::new(),
        }
    }

    /// Segment used in publish channels.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.clean
    }

    /// The label as configured, `name@location` or just `name`.
    #[must_use]
    pub fn label(&self) -> String {
        if self.location_pretty.is_empty() {
            self.pretty.clone()
        } else {
            format!("{}{LOCATION_SEPARATOR}{}", self.pretty, self.location_pretty)
        }
    }
}

impl core::fmt::Display for DisplayName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.pretty)
    }
}
