//! User-visible notifications.
//!
//! Every recovered failure and lifecycle transition is published here as a
//! [`DashboardEvent`]. Nothing on this channel is fatal; the UI layer is
//! expected to render them as transient notices.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::characteristics::DataType;
use crate::types::DeviceId;

/// Why a device went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The user asked for the disconnect
    UserRequested,
    /// The platform reported the link dropped
    ConnectionLost,
}

/// Notifications emitted by the connection manager and scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardEvent {
    /// A compatible device was added by a scan
    DeviceFound {
        /// Device id
        device: DeviceId,
        /// Display name at discovery
        name: String,
    },
    /// The scan did not produce a device
    ScanFailed {
        /// Human-readable reason
        reason: String,
    },
    /// Session open and discovery finished
    Connected {
        /// Device id
        device: DeviceId,
        /// Display name
        name: String,
        /// Recognized characteristics
        characteristics: Vec<DataType>,
    },
    /// Session open failed
    ConnectionFailed {
        /// Device id
        device: DeviceId,
        /// Display name
        name: String,
        /// Human-readable reason
        reason: String,
    },
    /// Device disconnected
    Disconnected {
        /// Device id
        device: DeviceId,
        /// Display name
        name: String,
        /// User intent or unexpected loss
        reason: DisconnectReason,
    },
    /// A characteristic read failed and the previous value was kept
    ReadFailed {
        /// Device id
        device: DeviceId,
        /// Characteristic
        data_type: DataType,
        /// Human-readable reason
        reason: String,
    },
    /// New values were merged for a device
    ValuesUpdated {
        /// Device id
        device: DeviceId,
        /// Characteristics that changed
        data_types: Vec<DataType>,
    },
    /// Device was relabeled
    Renamed {
        /// Device id
        device: DeviceId,
        /// New display name
        name: String,
    },
}

impl DashboardEvent {
    /// Short notice title
    #[must_use]
    pub const fn title(&self) -> &'static str {
        match self {
            Self::DeviceFound { .. } => "Device Found",
            Self::ScanFailed { .. } => "Scan Error",
            Self::Connected { .. } => "Connected",
            Self::ConnectionFailed { .. } => "Connection Failed",
            Self::Disconnected { .. } => "Disconnected",
            Self::ReadFailed { .. } => "Read Failed",
            Self::ValuesUpdated { .. } => "Values Updated",
            Self::Renamed { .. } => "Renamed",
        }
    }

    /// Notice body
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::DeviceFound { name, .. } => format!("Found \"{name}\""),
            Self::ScanFailed { reason } => reason.clone(),
            Self::Connected { name, .. } => format!("Successfully connected to {name}"),
            Self::ConnectionFailed { name, .. } => format!("Could not connect to {name}"),
            Self::Disconnected {
                name,
                reason: DisconnectReason::UserRequested,
                ..
            } => format!("Disconnected from {name}"),
            Self::Disconnected {
                name,
                reason: DisconnectReason::ConnectionLost,
                ..
            } => format!("Lost connection to {name}"),
            Self::ReadFailed {
                data_type, reason, ..
            } => format!("Could not read {data_type}: {reason}"),
            Self::ValuesUpdated { data_types, .. } => {
                format!("{} value(s) updated", data_types.len())
            }
            Self::Renamed { name, .. } => format!("Renamed to {name}"),
        }
    }

    /// Whether the notice reports a failure
    #[must_use]
    pub const fn is_destructive(&self) -> bool {
        matches!(
            self,
            Self::ScanFailed { .. }
                | Self::ConnectionFailed { .. }
                | Self::ReadFailed { .. }
                | Self::Disconnected {
                    reason: DisconnectReason::ConnectionLost,
                    ..
                }
        )
    }

    /// Device the event concerns, if any
    #[must_use]
    pub const fn device(&self) -> Option<&DeviceId> {
        match self {
            Self::ScanFailed { .. } => None,
            Self::DeviceFound { device, .. }
            | Self::Connected { device, .. }
            | Self::ConnectionFailed { device, .. }
            | Self::Disconnected { device, .. }
            | Self::ReadFailed { device, .. }
            | Self::ValuesUpdated { device, .. }
            | Self::Renamed { device, .. } => Some(device),
        }
    }
}

/// Receiver for dashboard events
pub type EventReceiver = broadcast::Receiver<DashboardEvent>;

/// Fan-out of [`DashboardEvent`]s to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: broadcast::Sender<DashboardEvent>,
}

impl EventDispatcher {
    /// Create a dispatcher buffering `capacity` events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Publish an event
    pub fn send(&self, event: DashboardEvent) {
        // No receivers is fine.
        let _ = self.sender.send(event);
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(64)
    }
}
