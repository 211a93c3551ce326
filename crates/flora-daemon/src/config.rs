//! Daemon configuration.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use flora_core::{AllowedDevice, EngineConfig};
use flora_types::{DisplayName, MacAddress};

/// Daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Reporting and radio settings.
    pub general: GeneralConfig,
    /// Polling and lifecycle settings.
    pub daemon: DaemonConfig,
    /// Broker settings, unused in `json` mode.
    pub mqtt: MqttConfig,
    /// Status API settings.
    pub http: HttpConfig,
    /// Allow-list: `"name@location" = "mac"`. Empty means accept every named device.
    pub sensors: BTreeMap<String, String>,
}

impl Config {
    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Load a file, apply `MQTT_*` environment overrides and validate.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply broker overrides from the environment.
    ///
    /// `MQTT_HOSTNAME`, `MQTT_PORT`, `MQTT_USERNAME` and `MQTT_PASSWORD` win
    /// over the file.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(hostname) = lookup("MQTT_HOSTNAME") {
            self.mqtt.hostname = hostname;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.mqtt.port = port.trim().parse().map_err(|_| {
                ConfigError::Validation(vec![ValidationError {
                    field: "MQTT_PORT".to_string(),
                    message: format!("invalid port '{}': must be a number 1-65535", port),
                }])
            })?;
        }
        if let Some(username) = lookup("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        Ok(())
    }

    /// Validate the configuration and return every problem found.
    ///
    /// This checks:
    /// - `daemon.period` is positive
    /// - the broker port is not 0 (unless reporting to stdout)
    /// - every sensor label is non-empty and folds to a non-empty channel
    /// - every MAC has the six hex-pair form
    /// - no MAC is listed twice
    /// - the status API bind address is `host:port` when the API is enabled
    ///
    /// # Example
    ///
    /// ```
    /// use flora_daemon::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.daemon.validate());
        if self.general.reporting_method.uses_mqtt() {
            errors.extend(self.mqtt.validate());
        }
        if self.http.enabled {
            errors.extend(self.http.validate());
        }

        let mut seen = HashSet::new();
        for (label, mac) in &self.sensors {
            let field = format!("sensors.\"{}\"", label);
            let name = DisplayName::parse(label);
            if name.pretty.is_empty() {
                errors.push(ValidationError {
                    field: field.clone(),
                    message: "sensor name cannot be empty".to_string(),
                });
            } else if name.clean.is_empty() {
                errors.push(ValidationError {
                    field: field.clone(),
                    message: format!(
                        "sensor name '{}' has no characters usable in a topic",
                        name.pretty
                    ),
                });
            }
            match mac.parse::<MacAddress>() {
                Ok(mac) => {
                    if !seen.insert(mac.clone()) {
                        errors.push(ValidationError {
                            field,
                            message: format!("duplicate MAC address '{}'", mac),
                        });
                    }
                }
                Err(_) => errors.push(ValidationError {
                    field,
                    message: format!(
                        "invalid MAC address '{}': expected format 'xx:xx:xx:xx:xx:xx'",
                        mac
                    ),
                }),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Non-fatal findings worth logging at startup.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.sensors.is_empty() {
            warnings.push(
                "No sensors configured, every named Mi Flora device in range will be reported"
                    .to_string(),
            );
        }
        if self.general.reporting_method == ReportingMode::WirenboardMqtt
            && self.mqtt.base_topic.is_some()
        {
            warnings.push("base_topic is ignored by the wirenboard-mqtt reporting method".to_string());
        }
        if !self.mqtt.tls && (self.mqtt.tls_ca_cert.is_some() || self.mqtt.has_client_auth()) {
            warnings.push("MQTT TLS files configured but tls = false, connecting without TLS".to_string());
        }
        if self.mqtt.tls && self.mqtt.tls_ca_cert.is_none() {
            warnings.push("MQTT TLS enabled without tls_ca_cert, using system trust roots".to_string());
        }
        warnings
    }

    /// Topic prefix for the configured reporting method, lower-cased.
    pub fn base_topic(&self) -> String {
        if self.general.reporting_method == ReportingMode::WirenboardMqtt {
            return String::new();
        }
        self.mqtt
            .base_topic
            .as_deref()
            .unwrap_or(self.general.reporting_method.default_base_topic())
            .to_lowercase()
    }

    /// Allow-listed devices, in table order. Entries that fail validation are skipped.
    pub fn allowed_devices(&self) -> Vec<AllowedDevice> {
        self.sensors
            .iter()
            .filter_map(|(label, mac)| {
                let mac = mac.parse::<MacAddress>().ok()?;
                Some(AllowedDevice::new(mac, DisplayName::parse(label)))
            })
            .collect()
    }

    /// Adapter selector for the radio layer; empty means the first adapter.
    pub fn adapter(&self) -> Option<&str> {
        let adapter = self.general.adapter.trim();
        (!adapter.is_empty()).then_some(adapter)
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = EngineConfig::default()
            .poll_interval(Duration::from_secs(self.daemon.period))
            .probe_unconfigured(self.general.report_unconfigured)
            .shutdown_grace(Duration::from_secs(self.daemon.shutdown_grace));
        for device in self.allowed_devices() {
            engine = engine.allow(device);
        }
        engine
    }
}

/// How sensor values leave the daemon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportingMode {
    /// One JSON line per update on stdout.
    Json,
    /// JSON per device under `{base}/{name}`.
    #[default]
    MqttJson,
    /// Homie 3.0 convention.
    MqttHomie,
    /// mqtt-smarthome architecture.
    MqttSmarthome,
    /// Home Assistant MQTT discovery.
    HomeassistantMqtt,
    /// ThingsBoard telemetry.
    ThingsboardJson,
    /// Wiren Board MQTT conventions.
    WirenboardMqtt,
    /// Gladys Assistant MQTT.
    GladysMqtt,
}

impl ReportingMode {
    pub const ALL: [ReportingMode; 8] = [
        ReportingMode::Json,
        ReportingMode::MqttJson,
        ReportingMode::MqttHomie,
        ReportingMode::MqttSmarthome,
        ReportingMode::HomeassistantMqtt,
        ReportingMode::ThingsboardJson,
        ReportingMode::WirenboardMqtt,
        ReportingMode::GladysMqtt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportingMode::Json => "json",
            ReportingMode::MqttJson => "mqtt-json",
            ReportingMode::MqttHomie => "mqtt-homie",
            ReportingMode::MqttSmarthome => "mqtt-smarthome",
            ReportingMode::HomeassistantMqtt => "homeassistant-mqtt",
            ReportingMode::ThingsboardJson => "thingsboard-json",
            ReportingMode::WirenboardMqtt => "wirenboard-mqtt",
            ReportingMode::GladysMqtt => "gladys-mqtt",
        }
    }

    /// Topic prefix used when `mqtt.base_topic` is not set.
    pub fn default_base_topic(&self) -> &'static str {
        match self {
            ReportingMode::MqttHomie => "homie",
            ReportingMode::HomeassistantMqtt => "homeassistant",
            ReportingMode::ThingsboardJson => "v1/gateway",
            ReportingMode::WirenboardMqtt => "",
            _ => "miflora",
        }
    }

    pub fn uses_mqtt(&self) -> bool {
        !matches!(self, ReportingMode::Json)
    }
}

impl fmt::Display for ReportingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub reporting_method: ReportingMode,
    /// Adapter selector (`hci0`, or part of the adapter description).
    pub adapter: String,
    /// Log capable devices that are not in the allow-list.
    pub report_unconfigured: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            reporting_method: ReportingMode::default(),
            adapter: "hci0".to_string(),
            report_unconfigured: false,
        }
    }
}

/// Polling and lifecycle settings. All durations are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Run until stopped. When false, exit once every configured device has published.
    pub enabled: bool,
    /// Minimum spacing between active polls of one device.
    pub period: u64,
    /// Time in-flight polls get to finish on shutdown.
    pub shutdown_grace: u64,
    /// Upper bound for one publish or announce call.
    pub publish_timeout: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period: 300,
            shutdown_grace: 5,
            publish_timeout: 10,
        }
    }
}

impl DaemonConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.period == 0 {
            errors.push(ValidationError {
                field: "daemon.period".to_string(),
                message: "period must be greater than 0".to_string(),
            });
        }
        if self.publish_timeout == 0 {
            errors.push(ValidationError {
                field: "daemon.publish_timeout".to_string(),
                message: "publish timeout must be greater than 0".to_string(),
            });
        }
        errors
    }
}

/// Broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub hostname: String,
    pub port: u16,
    /// Keep-alive interval in seconds.
    pub keepalive: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
    /// PEM CA bundle to trust instead of the system roots.
    pub tls_ca_cert: Option<PathBuf>,
    /// PEM client certificate for mutual TLS. Needs `tls_keyfile` and `tls_ca_cert`.
    pub tls_certfile: Option<PathBuf>,
    /// PEM private key matching `tls_certfile`.
    pub tls_keyfile: Option<PathBuf>,
    /// Topic prefix; defaults per reporting method.
    pub base_topic: Option<String>,
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 1883,
            keepalive: 60,
            username: None,
            password: None,
            tls: false,
            tls_ca_cert: None,
            tls_certfile: None,
            tls_keyfile: None,
            base_topic: None,
            client_id: "flora-daemon".to_string(),
        }
    }
}

impl MqttConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.hostname.trim().is_empty() {
            errors.push(ValidationError {
                field: "mqtt.hostname".to_string(),
                message: "hostname cannot be empty".to_string(),
            });
        }
        if self.port == 0 {
            errors.push(ValidationError {
                field: "mqtt.port".to_string(),
                message: "port cannot be 0".to_string(),
            });
        }
        if self.client_id.is_empty() {
            errors.push(ValidationError {
                field: "mqtt.client_id".to_string(),
                message: "client id cannot be empty".to_string(),
            });
        }
        if self.password.is_some() && self.username.is_none() {
            errors.push(ValidationError {
                field: "mqtt.password".to_string(),
                message: "password set without username".to_string(),
            });
        }
        match (&self.tls_certfile, &self.tls_keyfile) {
            (Some(_), None) => errors.push(ValidationError {
                field: "mqtt.tls_keyfile".to_string(),
                message: "tls_certfile set without tls_keyfile".to_string(),
            }),
            (None, Some(_)) => errors.push(ValidationError {
                field: "mqtt.tls_certfile".to_string(),
                message: "tls_keyfile set without tls_certfile".to_string(),
            }),
            (Some(_), Some(_)) if self.tls_ca_cert.is_none() => errors.push(ValidationError {
                field: "mqtt.tls_ca_cert".to_string(),
                message: "client certificates need tls_ca_cert".to_string(),
            }),
            _ => {}
        }
        errors
    }

    /// Whether a client certificate and key are configured.
    pub fn has_client_auth(&self) -> bool {
        self.tls_certfile.is_some() && self.tls_keyfile.is_some()
    }
}

/// Status API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

impl HttpConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        match self.bind.rsplit_once(':') {
            None => errors.push(ValidationError {
                field: "http.bind".to_string(),
                message: format!(
                    "invalid bind address '{}': expected format 'host:port'",
                    self.bind
                ),
            }),
            Some((_, port)) => match port.parse::<u16>() {
                Ok(0) => errors.push(ValidationError {
                    field: "http.bind".to_string(),
                    message: "port cannot be 0".to_string(),
                }),
                Err(_) => errors.push(ValidationError {
                    field: "http.bind".to_string(),
                    message: format!("invalid port '{}': must be a number 1-65535", port),
                }),
                Ok(_) => {}
            },
        }
        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `mqtt.port` or `sensors."Fig"`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("flora")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_sensors(entries: &[(&str, &str)]) -> Config {
        Config {
            sensors: entries
                .iter()
                .map(|(label, mac)| (label.to_string(), mac.to_string()))
                .collect(),
            ..Config::default()
        }
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.general.reporting_method, ReportingMode::MqttJson);
        assert_eq!(config.general.adapter, "hci0");
        assert!(config.daemon.enabled);
        assert_eq!(config.daemon.period, 300);
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.keepalive, 60);
        assert!(!config.http.enabled);
        assert!(config.sensors.is_empty());
    }

    #[test]
    fn test_default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_full_toml() {
        let toml = r#"
[general]
reporting_method = "homeassistant-mqtt"
adapter = "hci1"
report_unconfigured = true

[daemon]
enabled = false
period = 600

[mqtt]
hostname = "broker.local"
port = 8883
username = "flora"
password = "secret"
tls = true

[http]
enabled = true
bind = "0.0.0.0:9090"

[sensors]
"Big Fig@Living Room" = "C4:7C:8D:6A:12:34"
"Basil" = "c4:7c:8d:6a:56:78"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.general.reporting_method, ReportingMode::HomeassistantMqtt);
        assert_eq!(config.adapter(), Some("hci1"));
        assert!(config.general.report_unconfigured);
        assert!(!config.daemon.enabled);
        assert_eq!(config.daemon.period, 600);
        assert_eq!(config.daemon.shutdown_grace, 5);
        assert_eq!(config.mqtt.hostname, "broker.local");
        assert_eq!(config.mqtt.username.as_deref(), Some("flora"));
        assert!(config.mqtt.tls);
        assert_eq!(config.http.bind, "0.0.0.0:9090");
        assert_eq!(config.sensors.len(), 2);
        assert!(config.validate().is_ok());
        assert_eq!(config.base_topic(), "homeassistant");
    }

    #[test]
    fn test_config_load_nonexistent() {
        let result = Config::load("/nonexistent/path/config.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("invalid.toml");
        std::fs::write(&config_path, "this is not valid { toml").unwrap();

        let result = Config::load(&config_path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_config_load_unknown_reporting_method() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(&config_path, "[general]\nreporting_method = \"carrier-pigeon\"\n").unwrap();

        let result = Config::load(&config_path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_config_load_validated_rejects_bad_mac() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(&config_path, "[sensors]\nFig = \"c4:7c:8d:6a:12\"\n").unwrap();

        let result = Config::load_validated(&config_path);
        assert!(matches!(result, Err(ConfigError::Validation(ref errors)) if errors.len() == 1));
    }

    #[test]
    fn test_reporting_mode_names_round_trip() {
        for mode in ReportingMode::ALL {
            let toml = format!("reporting_method = \"{}\"", mode);
            let general: GeneralConfig = toml::from_str(&toml).unwrap();
            assert_eq!(general.reporting_method, mode);
        }
    }

    #[test]
    fn test_base_topic_defaults_per_mode() {
        let mut config = Config::default();
        let expected = [
            (ReportingMode::Json, "miflora"),
            (ReportingMode::MqttJson, "miflora"),
            (ReportingMode::MqttHomie, "homie"),
            (ReportingMode::MqttSmarthome, "miflora"),
            (ReportingMode::HomeassistantMqtt, "homeassistant"),
            (ReportingMode::ThingsboardJson, "v1/gateway"),
            (ReportingMode::WirenboardMqtt, ""),
            (ReportingMode::GladysMqtt, "miflora"),
        ];
        for (mode, topic) in expected {
            config.general.reporting_method = mode;
            assert_eq!(config.base_topic(), topic, "{}", mode);
        }
    }

    #[test]
    fn test_base_topic_is_lowercased_and_ignored_for_wirenboard() {
        let mut config = Config::default();
        config.mqtt.base_topic = Some("Garden/Plants".to_string());
        assert_eq!(config.base_topic(), "garden/plants");

        config.general.reporting_method = ReportingMode::WirenboardMqtt;
        assert_eq!(config.base_topic(), "");
        assert!(config.warnings().iter().any(|w| w.contains("base_topic")));
    }

    #[test]
    fn test_env_overrides_win() {
        let mut config = Config::default();
        config
            .apply_env(|key| match key {
                "MQTT_HOSTNAME" => Some("mqtt.example".to_string()),
                "MQTT_PORT" => Some("8883".to_string()),
                "MQTT_USERNAME" => Some("user".to_string()),
                "MQTT_PASSWORD" => Some("pass".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.mqtt.hostname, "mqtt.example");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.username.as_deref(), Some("user"));
        assert_eq!(config.mqtt.password.as_deref(), Some("pass"));
    }

    #[test]
    fn test_env_override_bad_port() {
        let mut config = Config::default();
        let result = config.apply_env(|key| (key == "MQTT_PORT").then(|| "eighty".to_string()));
        assert!(matches!(result, Err(ConfigError::Validation(_))));
        assert_eq!(config.mqtt.port, 1883);
    }

    #[test]
    fn test_sensor_validation() {
        let config = with_sensors(&[
            ("Fig", "c4:7c:8d:6a:12:34"),
            ("Basil", "not-a-mac"),
            ("@Kitchen", "c4:7c:8d:6a:56:78"),
        ]);
        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation errors");
        };
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.message.contains("invalid MAC")));
        assert!(errors.iter().any(|e| e.message.contains("name cannot be empty")));
    }

    #[test]
    fn test_non_latin_sensor_names_are_transliterated() {
        let config = with_sensors(&[
            ("Фикус", "c4:7c:8d:6a:00:01"),
            ("多肉", "c4:7c:8d:6a:00:02"),
            ("Ελιά@Σαλόνι", "c4:7c:8d:6a:00:03"),
        ]);
        assert!(config.validate().is_ok());

        let channels: HashSet<String> = config
            .allowed_devices()
            .iter()
            .map(|device| device.name.channel().to_string())
            .collect();
        assert_eq!(channels.len(), 3);
        assert!(channels.contains("Fikus"));
        assert!(channels.iter().all(|c| !c.is_empty() && c.is_ascii()));
    }

    #[test]
    fn test_sensor_name_without_topic_characters_is_rejected() {
        let config = with_sensors(&[("\u{301}\u{308}@Hall", "c4:7c:8d:6a:12:34")]);
        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation errors");
        };
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("no characters usable in a topic"));
    }

    #[test]
    fn test_client_certificate_validation() {
        let mut config = Config::default();
        config.mqtt.tls = true;
        config.mqtt.tls_certfile = Some(PathBuf::from("/etc/flora/client.pem"));
        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation errors");
        };
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "mqtt.tls_keyfile");

        config.mqtt.tls_keyfile = Some(PathBuf::from("/etc/flora/client.key"));
        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation errors");
        };
        assert_eq!(errors[0].field, "mqtt.tls_ca_cert");

        config.mqtt.tls_ca_cert = Some(PathBuf::from("/etc/flora/ca.pem"));
        assert!(config.validate().is_ok());
        assert!(config.mqtt.has_client_auth());
    }

    #[test]
    fn test_duplicate_macs_case_insensitive() {
        let config = with_sensors(&[("Fig", "C4:7C:8D:6A:12:34"), ("Basil", "c4:7c:8d:6a:12:34")]);
        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation errors");
        };
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("duplicate"));
    }

    #[test]
    fn test_period_and_port_validation() {
        let mut config = Config::default();
        config.daemon.period = 0;
        config.mqtt.port = 0;
        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation errors");
        };
        assert_eq!(errors.len(), 2);

        // The broker is not consulted in json mode.
        config.general.reporting_method = ReportingMode::Json;
        config.daemon.period = 60;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_http_bind_validation() {
        let mut config = Config::default();
        config.http.enabled = true;
        config.http.bind = "localhost".to_string();
        assert!(config.validate().is_err());
        config.http.bind = "localhost:0".to_string();
        assert!(config.validate().is_err());
        config.http.bind = "localhost:8080".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_sensors_is_valid_with_warning() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.warnings().iter().any(|w| w.contains("No sensors")));
    }

    #[test]
    fn test_engine_config_from_config() {
        let mut config = with_sensors(&[("Big Fig@Living Room", "C4:7C:8D:6A:12:34")]);
        config.daemon.period = 120;
        config.daemon.shutdown_grace = 9;
        config.general.report_unconfigured = true;

        let engine = config.engine_config();
        assert_eq!(engine.poll_interval, Duration::from_secs(120));
        assert_eq!(engine.shutdown_grace, Duration::from_secs(9));
        assert!(engine.probe_unconfigured);
        assert_eq!(engine.allow_list.len(), 1);
        assert_eq!(engine.allow_list[0].mac.as_str(), "c4:7c:8d:6a:12:34");
        assert_eq!(engine.allow_list[0].name.channel(), "Big-Fig");
        assert_eq!(engine.allow_list[0].name.location_pretty, "Living Room");
    }

    #[test]
    fn test_adapter_empty_means_first() {
        let mut config = Config::default();
        config.general.adapter = "  ".to_string();
        assert_eq!(config.adapter(), None);
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("flora/config.toml"));
    }

    #[test]
    fn test_config_validation_error_display() {
        let error = ConfigError::Validation(vec![
            ValidationError {
                field: "daemon.period".to_string(),
                message: "period must be greater than 0".to_string(),
            },
            ValidationError {
                field: "mqtt.port".to_string(),
                message: "port cannot be 0".to_string(),
            },
        ]);
        let display = error.to_string();
        assert!(display.contains("  - daemon.period: period must be greater than 0"));
        assert!(display.contains("  - mqtt.port: port cannot be 0"));
    }
}
