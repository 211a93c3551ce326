//! Process lifecycle: stop signals and the single-round mode.

use std::collections::HashSet;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use flora_core::{EngineEvent, EventReceiver};
use flora_types::DeviceIdentity;

/// Resolve on Ctrl-C, or on SIGTERM where available.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Resolve once every expected device has published a sensor update.
///
/// With no expected devices, the first published update completes the round.
/// Returns early if the event channel closes.
pub async fn until_all_published(mut events: EventReceiver, expected: HashSet<DeviceIdentity>) {
    let mut pending = expected;
    let first_only = pending.is_empty();

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                warn!("Single-round watcher lagging, {} events dropped", missed);
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        let EngineEvent::SensorUpdate { device, .. } = event else {
            continue;
        };

        if first_only {
            info!("{} published, round complete", device.name);
            return;
        }
        if pending.remove(&device.identity) {
            debug!(device = %device.identity, remaining = pending.len(), "Device published");
            if pending.is_empty() {
                info!("Every configured device has published, round complete");
                return;
            }
        }
    }
}
