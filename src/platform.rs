//! Boundary traits for the platform Bluetooth capability.
//!
//! The connection manager only talks to these traits. [`crate::ble`]
//! implements them on top of `btleplug`; [`crate::mock`] implements them
//! in memory for tests.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::{collections::HashMap, sync::Arc, time::Duration};
use uuid::Uuid;

use crate::error::Result;
use crate::types::DeviceId;

/// Restricts which devices discovery may return
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFilter {
    /// Manufacturer id whose payload is checked
    pub manufacturer_id: u16,
    /// Required payload prefix under `manufacturer_id`
    pub manufacturer_data_prefix: Vec<u8>,
    /// Services the session may enumerate; empty allows all
    pub optional_services: Vec<Uuid>,
    /// Upper bound on discovery
    pub timeout: Duration,
}

/// One advertisement sample
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    /// Manufacturer data keyed by company id
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Signal strength, when the platform reports it
    pub rssi: Option<i16>,
}

/// A characteristic as enumerated from a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Owning service UUID
    pub service_uuid: Uuid,
    /// Supports notify or indicate
    pub supports_notify: bool,
}

/// A pushed characteristic value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueNotification {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Raw payload
    pub value: Vec<u8>,
}

/// Entry point to the platform Bluetooth stack
#[async_trait]
pub trait BluetoothAdapter: Send + Sync + 'static {
    /// Run the platform discovery flow and return the chosen device.
    ///
    /// Fails with `ApiUnavailable`, `UserCancelled` or `NoMatch`.
    async fn request_device(&self, filter: &DeviceFilter) -> Result<Arc<dyn BlePeripheral>>;
}

/// One remote device and its GATT session
#[async_trait]
pub trait BlePeripheral: Send + Sync + 'static {
    /// Platform identifier
    fn id(&self) -> DeviceId;

    /// Advertised name
    fn name(&self) -> Option<String>;

    /// Wait for the next advertisement sample
    async fn advertisement(&self) -> Result<Advertisement>;

    /// Stream of advertisement samples; best-effort, may end immediately
    async fn advertisements(&self) -> Result<BoxStream<'static, Advertisement>>;

    /// Open the GATT session
    async fn connect(&self) -> Result<()>;

    /// Close the GATT session
    async fn disconnect(&self) -> Result<()>;

    /// Primary services of the open session
    async fn services(&self) -> Result<Vec<Uuid>>;

    /// Characteristics of one service
    async fn characteristics(&self, service: Uuid) -> Result<Vec<GattCharacteristic>>;

    /// Read a characteristic value
    async fn read(&self, characteristic: &GattCharacteristic) -> Result<Vec<u8>>;

    /// Enable notifications for a characteristic
    async fn subscribe(&self, characteristic: &GattCharacteristic) -> Result<()>;

    /// Stream of pushed values for all subscribed characteristics
    async fn notifications(&self) -> Result<BoxStream<'static, ValueNotification>>;

    /// Resolves once when the platform reports the link dropped
    async fn disconnected(&self) -> Result<()>;
}
