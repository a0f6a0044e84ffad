use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, time::Duration};
use uuid::Uuid;

use crate::characteristics::DataType;
use crate::compat::COMPATIBLE_MANUFACTURER_ID;

/// Stable platform-assigned device identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap a platform identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Connection lifecycle of one device.
///
/// Only `Connected` is stored on the [`Device`] record; `Connecting` lives
/// inside the connection manager while a session is being opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Known but never connected
    Discovered,
    /// Session open in progress
    Connecting,
    /// Session open, characteristics discovered
    Connected,
    /// Session closed
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discovered => write!(f, "Discovered"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Opaque handle to a discovered characteristic.
///
/// The handle is tied to the connection epoch it was discovered in and
/// becomes stale once the device disconnects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicHandle {
    /// Decoded meaning of the characteristic
    pub data_type: DataType,
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Owning service UUID
    pub service_uuid: Uuid,
    /// Characteristic can push notifications or indications
    pub supports_notify: bool,
    /// Push updates are actually flowing for this connection
    pub subscribed: bool,
    /// Connection epoch the handle was discovered in
    pub epoch: u64,
}

/// Most recent decoded reading for one characteristic
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CachedValue {
    /// Value in engineering units
    pub value: f64,
    /// Registry-wide merge sequence, increasing with every accepted write
    pub seq: u64,
}

/// One known peripheral
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Platform identifier
    pub id: DeviceId,
    /// Advertised name
    pub name: Option<String>,
    /// User-assigned display name
    pub custom_name: Option<String>,
    /// Last seen signal strength in dBm
    pub rssi: i16,
    /// Connected in the current epoch
    pub connected: bool,
    /// Incremented on every successful connect
    pub epoch: u64,
    /// Discovered characteristics, empty while disconnected
    pub characteristics: HashMap<DataType, CharacteristicHandle>,
    /// Latest decoded readings, empty while disconnected
    pub latest_values: HashMap<DataType, CachedValue>,
}

impl Device {
    /// Create a freshly discovered device
    #[must_use]
    pub fn new(id: DeviceId, name: Option<String>, rssi: i16) -> Self {
        Self {
            id,
            name,
            custom_name: None,
            rssi,
            connected: false,
            epoch: 0,
            characteristics: HashMap::new(),
            latest_values: HashMap::new(),
        }
    }

    /// Name shown to the user
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.custom_name
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or("Unknown Device")
    }

    /// Externally visible lifecycle state
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        match (self.connected, self.epoch) {
            (true, _) => ConnectionState::Connected,
            (false, 0) => ConnectionState::Discovered,
            (false, _) => ConnectionState::Disconnected,
        }
    }

    /// Latest value for a characteristic
    #[must_use]
    pub fn value(&self, data_type: DataType) -> Option<f64> {
        self.latest_values.get(&data_type).map(|cached| cached.value)
    }
}

/// Tunable timings and limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// How long discovery may run before reporting no match
    pub scan_timeout_ms: u64,
    /// How long to wait for an advertisement sample to confirm compatibility
    pub compatibility_timeout_ms: u64,
    /// GATT session open timeout
    pub connect_timeout_ms: u64,
    /// Refresh interval for widgets that do not set one
    pub default_refresh_ms: u64,
    /// Lowest accepted widget refresh interval
    pub min_refresh_ms: u64,
    /// Buffered user notifications per subscriber
    pub event_capacity: usize,
    /// Manufacturer id whose payload carries the compatibility signature
    pub manufacturer_id: u16,
}

impl DashboardConfig {
    /// Compatibility confirmation timeout
    #[must_use]
    pub const fn compatibility_timeout(&self) -> Duration {
        Duration::from_millis(self.compatibility_timeout_ms)
    }

    /// Connection timeout
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Scan timeout
    #[must_use]
    pub const fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    /// Clamp a requested refresh interval to the configured floor
    #[must_use]
    pub fn refresh_interval(&self, requested_ms: u64) -> Duration {
        Duration::from_millis(requested_ms.max(self.min_refresh_ms))
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            compatibility_timeout_ms: 1_000,
            connect_timeout_ms: 30_000,
            default_refresh_ms: 2_000,
            min_refresh_ms: 100,
            event_capacity: 64,
            manufacturer_id: COMPATIBLE_MANUFACTURER_ID,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_fallbacks() {
        let mut device = Device::new(DeviceId::new("d1"), None, -60);
        assert_eq!(device.display_name(), "Unknown Device");

        device.name = Some("Living Room Sensor".to_string());
        assert_eq!(device.display_name(), "Living Room Sensor");

        device.custom_name = Some("Lounge".to_string());
        assert_eq!(device.display_name(), "Lounge");
    }

    #[test]
    fn test_state_from_flags() {
        let mut device = Device::new(DeviceId::new("d1"), None, 0);
        assert_eq!(device.state(), ConnectionState::Discovered);

        device.connected = true;
        device.epoch = 1;
        assert_eq!(device.state(), ConnectionState::Connected);

        device.connected = false;
        assert_eq!(device.state(), ConnectionState::Disconnected);
        assert_eq!(device.state().to_string(), "Disconnected");
    }

    #[test]
    fn test_config_defaults() {
        let config = DashboardConfig::default();

        assert_eq!(config.scan_timeout_ms, 10_000);
        assert_eq!(config.compatibility_timeout_ms, 1_000);
        assert_eq!(config.connect_timeout_ms, 30_000);
        assert_eq!(config.default_refresh_ms, 2_000);
        assert_eq!(config.min_refresh_ms, 100);
        assert_eq!(config.manufacturer_id, 0xFFFF);
    }

    #[test]
    fn test_refresh_floor() {
        let config = DashboardConfig::default();
        assert_eq!(config.refresh_interval(10), Duration::from_millis(100));
        assert_eq!(config.refresh_interval(2_500), Duration::from_millis(2_500));
    }

    #[test]
    fn test_config_partial_json() {
        let config: DashboardConfig =
            serde_json::from_str(r#"{"compatibility_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.compatibility_timeout_ms, 250);
        assert_eq!(config.min_refresh_ms, 100);
    }
}
