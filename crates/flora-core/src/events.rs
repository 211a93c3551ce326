//! Engine events and their delivery to publishers.
//!
//! The engine emits [`EngineEvent`]s on a broadcast channel. Sending never
//! blocks and never fails: a slow consumer loses the oldest events instead of
//! stalling reconciliation. [`deliver`] drains a receiver into a
//! [`Publisher`] and [`Announcer`] with a per-call timeout.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flora_types::{DisplayName, SensorUpdate};

use crate::error::PublishError;
use crate::registry::DeviceSnapshot;
use crate::traits::{Announcer, Publisher};

/// Events emitted by the reconciliation engine.
///
/// All events are serializable for logging and the status API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum EngineEvent {
    /// Discovery metadata for a new device or a new firmware version.
    Announce { device: DeviceSnapshot },
    /// At least one value changed. `update` carries the full latest values.
    SensorUpdate {
        device: DeviceSnapshot,
        update: SensorUpdate,
    },
}

impl EngineEvent {
    pub fn device(&self) -> &DeviceSnapshot {
        match self {
            Self::Announce { device } | Self::SensorUpdate { device, .. } => device,
        }
    }

    pub fn name(&self) -> &DisplayName {
        &self.device().name
    }
}

/// Sender for engine events.
pub type EventSender = broadcast::Sender<EngineEvent>;

/// Receiver for engine events.
pub type EventReceiver = broadcast::Receiver<EngineEvent>;

/// Broadcast fan-out for engine events.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: EngineEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Forward events to the publishing side until cancelled or the channel closes.
///
/// Each call is bounded by `timeout`. Failures and timeouts are logged and
/// the loop moves on; nothing here feeds back into device state.
pub async fn deliver(
    mut events: EventReceiver,
    publisher: Arc<dyn Publisher>,
    announcer: Arc<dyn Announcer>,
    timeout: Duration,
    cancel: CancellationToken,
) {
    info!("Event delivery started");
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            received = events.recv() => match received {
                Ok(event) => event,
                Err(RecvError::Lagged(missed)) => {
                    warn!("Event delivery lagging, {} events dropped", missed);
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };

        let name = event.name().clone();
        let (action, call) = match &event {
            EngineEvent::Announce { device } => {
                ("announce", announcer.announce(&name, device))
            }
            EngineEvent::SensorUpdate { device, update } => {
                ("publish", publisher.publish(&name, update, device))
            }
        };

        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout(timeout)),
        };
        match result {
            Ok(()) => debug!(device = %name.channel(), "{} delivered", action),
            Err(e) => warn!(device = %name.channel(), "Failed to {}: {}", action, e),
        }
    }
    info!("Event delivery stopped");
}
