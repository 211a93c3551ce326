//! Error types for flora-core.
//!
//! This module defines the errors that can occur while talking to Mi Flora
//! devices over Bluetooth Low Energy and while handing events to the
//! publishing side.
//!
//! # Where errors surface
//!
//! None of these errors ever reach the advertisement receive path. The
//! reconciliation engine catches them per device and turns them into counters
//! and log lines.
//!
//! | Error Type | Raised by | Engine reaction |
//! |------------|-----------|-----------------|
//! | [`Error::Timeout`] | active poll | `stats.failure += 1`, retried once the poll interval has passed |
//! | [`Error::Bluetooth`] | active poll, scanner | same as timeout for polls; fatal for the scanner |
//! | [`Error::CharacteristicNotFound`] | active poll | same as timeout, usually a non-Flora device |
//! | [`Error::InvalidData`] | active poll | same as timeout |
//! | [`Error::Cancelled`] | active poll during shutdown | not counted as a failure |
//! | [`Error::DeviceNotFound`] | scanner, active poll | fatal for the scanner, counted for polls |
//! | [`PublishError`] | publisher / announcer | logged, device state untouched |
//!
//! ## Recommended Timeouts
//!
//! | Operation | Recommended Timeout | Notes |
//! |-----------|---------------------|-------|
//! | Connection | 10-15 seconds | Mi Flora answers slowly when its battery is low |
//! | Service discovery | 10 seconds | |
//! | Characteristic read/write | 5 seconds | Usually completes in <1s |
//! | Whole poll | 45 seconds | Upper bound enforced by the engine, above the sum of the steps |

use std::time::Duration;

use thiserror::Error;

use flora_types::ParseError;

/// Errors that can occur when communicating with Mi Flora devices.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Device or adapter not found.
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceNotFoundReason),

    /// Required BLE characteristic not found on device.
    #[error("Characteristic not found: {uuid} (searched in {service_count} services)")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: String,
        /// Number of services that were searched.
        service_count: usize,
    },

    /// Failed to parse data received from device.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// A payload failed structural parsing.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Reason why a device or adapter was not found.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DeviceNotFoundReason {
    /// Device with specified identity not known to the adapter.
    NotFound { identifier: String },
    /// No Bluetooth adapter available.
    NoAdapter,
    /// No adapter matches the configured selector.
    AdapterNotFound { selector: String },
}

impl std::fmt::Display for DeviceNotFoundReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { identifier } => write!(f, "device '{}' not found", identifier),
            Self::NoAdapter => write!(f, "no Bluetooth adapter available"),
            Self::AdapterNotFound { selector } => {
                write!(f, "no Bluetooth adapter matches '{}'", selector)
            }
        }
    }
}

impl Error {
    /// Create a device not found error for a specific identifier.
    pub fn device_not_found(identifier: impl Into<String>) -> Self {
        Self::DeviceNotFound(DeviceNotFoundReason::NotFound {
            identifier: identifier.into(),
        })
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: impl Into<String>, service_count: usize) -> Self {
        Self::CharacteristicNotFound {
            uuid: uuid.into(),
            service_count,
        }
    }

    /// Create an invalid data error.
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData(message.into())
    }

    /// True when the error only reflects an orderly shutdown.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Failures reported by [`Publisher`](crate::traits::Publisher) and
/// [`Announcer`](crate::traits::Announcer) implementations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PublishError {
    /// The message broker rejected or failed the request.
    #[error("Broker error: {0}")]
    Broker(String),

    /// The payload could not be encoded.
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The call did not complete within the delivery timeout.
    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),

    /// Writing to a local sink failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias using flora-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = Error::timeout("connect", Duration::from_secs(10));
        assert_eq!(err.to_string(), "Operation 'connect' timed out after 10s");
    }

    #[test]
    fn test_device_not_found_display() {
        let err = Error::device_not_found("c4:7c:8d:6a:12:34");
        assert_eq!(
            err.to_string(),
            "Device not found: device 'c4:7c:8d:6a:12:34' not found"
        );
        let err = Error::DeviceNotFound(DeviceNotFoundReason::AdapterNotFound {
            selector: "hci1".to_string(),
        });
        assert!(err.to_string().contains("hci1"));
    }

    #[test]
    fn test_parse_error_is_transparent() {
        let err: Error = ParseError::Encrypted.into();
        assert_eq!(err.to_string(), "Encrypted payload");
    }

    #[test]
    fn test_is_cancelled() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::timeout("connect", Duration::from_secs(1)).is_cancelled());
    }

    #[test]
    fn test_publish_timeout_display() {
        let err = PublishError::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Publish timed out after 1.5s");
    }
}
