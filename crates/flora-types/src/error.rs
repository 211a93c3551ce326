//! Error types for data parsing in flora-types.

use thiserror::Error;

/// Errors that can occur when parsing Mi Flora identifiers and payloads.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in flora-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// A MAC address did not match the `xx:xx:xx:xx:xx:xx` hex-pair form.
    #[error("Invalid MAC address '{0}': expected six colon-separated hex pairs")]
    InvalidMac(String),

    /// A firmware version string could not be read as a dotted numeric tuple.
    #[error("Invalid firmware version '{0}'")]
    InvalidFirmware(String),

    /// A payload was too short or otherwise structurally malformed.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// A payload is encrypted and cannot be decoded without a bind key.
    #[error("Encrypted payload")]
    Encrypted,
}

impl ParseError {
    /// Create an [`InvalidData`](Self::InvalidData) error from any displayable message.
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData(message.into())
    }
}

/// Result type alias using flora-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
