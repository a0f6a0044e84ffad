use thiserror::Error;

/// Errors that can occur while discovering, connecting to and reading BLE devices
#[derive(Error, Debug)]
pub enum DashboardError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// The platform has no usable Bluetooth capability
    #[error("Bluetooth is not available on this platform")]
    ApiUnavailable,

    /// The discovery prompt was dismissed
    #[error("Device selection was cancelled")]
    UserCancelled,

    /// Discovery finished without a matching device
    #[error("No matching device found")]
    NoMatch,

    /// Advertisement signature check failed or timed out
    #[error("Device does not advertise a compatible signature")]
    IncompatibleDevice,

    /// Device id is not known to the registry
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Opening the GATT session failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// A single service or characteristic enumeration failed
    #[error("Service discovery partially failed: {0}")]
    DiscoveryPartialFailure(String),

    /// A single characteristic read failed
    #[error("Failed to read characteristic: {0}")]
    ReadFailed(String),

    /// The platform tore the connection down
    #[error("Device disconnected unexpectedly")]
    UnexpectedDisconnect,

    /// A characteristic handle from a previous connection was used
    #[error("Characteristic handle belongs to a previous connection")]
    StaleHandle,

    /// Operation timeout
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Invalid parameters (widget settings, config values)
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Key-value store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for dashboard operations
pub type Result<T> = std::result::Result<T, DashboardError>;

impl DashboardError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::UnexpectedDisconnect
                | Self::DeviceNotFound(_)
                | Self::Timeout { .. }
        )
    }

    /// Check if this error is a failed characteristic read.
    ///
    /// Stale handles are reported the same way as failed reads.
    #[must_use]
    pub const fn is_read_failure(&self) -> bool {
        matches!(self, Self::ReadFailed(_) | Self::StaleHandle)
    }

    /// Check if this error came out of the discovery prompt
    #[must_use]
    pub const fn is_scan_error(&self) -> bool {
        matches!(
            self,
            Self::ApiUnavailable | Self::UserCancelled | Self::NoMatch | Self::IncompatibleDevice
        )
    }
}
