//! Shared state for the status API.

use std::sync::Arc;

use time::OffsetDateTime;

use flora_core::DeviceRegistry;

use crate::config::ReportingMode;

/// Read-only view the HTTP handlers work from.
pub struct AppState {
    /// The engine's registry; handlers only take snapshots.
    pub registry: Arc<DeviceRegistry>,
    pub reporting_method: ReportingMode,
    pub started_at: OffsetDateTime,
}

impl AppState {
    pub fn new(registry: Arc<DeviceRegistry>, reporting_method: ReportingMode) -> Arc<Self> {
        Arc::new(Self {
            registry,
            reporting_method,
            started_at: OffsetDateTime::now_utc(),
        })
    }
}
