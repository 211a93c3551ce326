//! Mi Flora to MQTT bridge.
//!
//! This crate provides a daemon that:
//! - Listens for Mi Flora advertisements on a Bluetooth adapter
//! - Reconciles passive readings with periodic connection-based polls
//! - Publishes values in one of eight reporting dialects
//! - Optionally exposes a read-only status API
//!
//! # REST API Endpoints
//!
//! Enabled with `[http] enabled = true`:
//!
//! - `GET /api/health` - Service health check
//! - `GET /api/devices` - All known devices, in the order they were first seen
//! - `GET /api/devices/{id}` - One device by identity
//!
//! # Configuration
//!
//! The daemon reads configuration from `~/.config/flora/config.toml`:
//!
//! ```toml
//! [general]
//! reporting_method = "homeassistant-mqtt"
//! adapter = "hci0"
//!
//! [daemon]
//! period = 300
//!
//! [mqtt]
//! hostname = "localhost"
//! port = 1883
//!
//! [sensors]
//! "Big Fig@Living Room" = "c4:7c:8d:6a:12:34"
//! ```
//!
//! `MQTT_HOSTNAME`, `MQTT_PORT`, `MQTT_USERNAME` and `MQTT_PASSWORD` override
//! the `[mqtt]` section.

pub mod api;
pub mod config;
pub mod lifecycle;
pub mod report;
pub mod state;

pub use config::{
    Config, ConfigError, DaemonConfig, GeneralConfig, HttpConfig, MqttConfig, ReportingMode,
    ValidationError,
};
pub use report::{Dialect, Message, MqttLink, MqttReporter, Reporter};
pub use state::AppState;
