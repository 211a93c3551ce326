//! Read-only status API.
//!
//! Handlers never touch device state directly: every response is built from
//! registry snapshots, so a slow client cannot hold a device lock.
//!
//! All endpoints return structured JSON errors via [`AppError`].
//!
//! # Example
//!
//! ```ignore
//! use flora_daemon::api;
//!
//! let app = api::router().with_state(state);
//! ```

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use time::OffsetDateTime;

use flora_core::{DevicePhase, DeviceSnapshot};
use flora_types::{DeviceIdentity, SensorValues};

use crate::state::AppState;

/// Create the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/{id}", get(get_device))
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub reporting_method: &'static str,
    pub uptime_seconds: i64,
    pub devices: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let now = OffsetDateTime::now_utc();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: now,
        reporting_method: state.reporting_method.as_str(),
        uptime_seconds: (now - state.started_at).whole_seconds().max(0),
        devices: state.registry.len().await,
    })
}

/// Poll counters with the derived success rate.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub count: u64,
    pub success: u64,
    pub failure: u64,
    pub success_rate: Option<f64>,
}

/// One device as reported by the API.
#[derive(Debug, Serialize)]
pub struct DeviceResponse {
    pub identity: DeviceIdentity,
    pub name: String,
    pub location: String,
    pub channel: String,
    pub mac: Option<String>,
    pub firmware: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_polled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_attempt_at: Option<OffsetDateTime>,
    pub poll_interval_secs: u64,
    pub values: SensorValues,
    pub stats: StatsResponse,
    pub announced: bool,
    pub phase: DevicePhase,
    pub polling: bool,
}

impl From<DeviceSnapshot> for DeviceResponse {
    fn from(device: DeviceSnapshot) -> Self {
        Self {
            channel: device.name.channel().to_string(),
            name: device.name.pretty,
            location: device.name.location_pretty,
            identity: device.identity,
            mac: device.mac.map(String::from),
            firmware: device.firmware.to_string(),
            last_seen_at: device.last_seen_at,
            last_polled_at: device.last_polled_at,
            last_attempt_at: device.last_attempt_at,
            poll_interval_secs: device.poll_interval_secs,
            values: device.values,
            stats: StatsResponse {
                count: device.stats.count,
                success: device.stats.success,
                failure: device.stats.failure,
                success_rate: device.stats.success_rate(),
            },
            announced: device.announced,
            phase: device.phase,
            polling: device.polling,
        }
    }
}

/// All known devices, in the order they were first seen.
async fn list_devices(State(state): State<Arc<AppState>>) -> Json<Vec<DeviceResponse>> {
    let devices = state.registry.snapshots().await;
    Json(devices.into_iter().map(DeviceResponse::from).collect())
}

async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeviceResponse>, AppError> {
    let identity = DeviceIdentity::new(&id);
    state
        .registry
        .snapshot(&identity)
        .await
        .map(|device| Json(DeviceResponse::from(device)))
        .ok_or_else(|| AppError::NotFound(format!("Device not found: {}", id)))
}

/// Application error type.
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use flora_core::{DeviceRegistry, DeviceState};
    use flora_types::{DisplayName, SensorKind};

    use crate::config::ReportingMode;

    fn create_test_state() -> Arc<AppState> {
        AppState::new(Arc::new(DeviceRegistry::new()), ReportingMode::MqttJson)
    }

    async fn add_device(state: &AppState, id: &str, label: &str) {
        let identity = DeviceIdentity::new(id);
        let (handle, _) = state
            .registry
            .get_or_create(&identity, || {
                DeviceState::new(identity.clone(), DisplayName::parse(label), Duration::from_secs(300))
            })
            .await;
        let mut device = handle.lock().await;
        device.latest_values.insert(SensorKind::Moisture, 41.0);
        device.stats.count = 4;
        device.stats.success = 3;
        device.stats.failure = 1;
    }

    async fn get_json(state: Arc<AppState>, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router()
            .with_state(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (status, json) = get_json(create_test_state(), "/api/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert!(json["version"].is_string());
        assert!(json["timestamp"].is_string());
        assert_eq!(json["reporting_method"], "mqtt-json");
        assert_eq!(json["devices"], 0);
    }

    #[tokio::test]
    async fn test_list_devices_empty() {
        let (status, json) = get_json(create_test_state(), "/api/devices").await;

        assert_eq!(status, StatusCode::OK);
        assert!(json.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_devices_in_insertion_order() {
        let state = create_test_state();
        add_device(&state, "c4:7c:8d:00:00:02", "Basil").await;
        add_device(&state, "c4:7c:8d:00:00:01", "Big Fig@Living Room").await;

        let (status, json) = get_json(state, "/api/devices").await;

        assert_eq!(status, StatusCode::OK);
        let devices = json.as_array().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0]["name"], "Basil");
        assert_eq!(devices[1]["name"], "Big Fig");
        assert_eq!(devices[1]["location"], "Living Room");
        assert_eq!(devices[1]["channel"], "Big-Fig");
    }

    #[tokio::test]
    async fn test_get_device() {
        let state = create_test_state();
        add_device(&state, "c4:7c:8d:6a:12:34", "Fig").await;

        let (status, json) = get_json(state, "/api/devices/C4:7C:8D:6A:12:34").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["identity"], "c4:7c:8d:6a:12:34");
        assert_eq!(json["mac"], "c4:7c:8d:6a:12:34");
        assert_eq!(json["values"]["moisture"], 41.0);
        assert_eq!(json["stats"]["count"], 4);
        assert_eq!(json["stats"]["success_rate"], 0.75);
        assert_eq!(json["announced"], false);
        assert_eq!(json["phase"], "discovered");
        assert!(json["last_polled_at"].is_null());
        assert!(json["last_attempt_at"].is_null());
    }

    #[tokio::test]
    async fn test_get_device_not_found() {
        let (status, json) = get_json(create_test_state(), "/api/devices/aa:bb:cc:dd:ee:ff").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].as_str().unwrap().contains("aa:bb:cc:dd:ee:ff"));
    }
}
