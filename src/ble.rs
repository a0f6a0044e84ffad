use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
        ScanFilter,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    compat::has_manufacturer_prefix,
    error::{DashboardError, Result},
    platform::{
        Advertisement, BlePeripheral, BluetoothAdapter, DeviceFilter, GattCharacteristic,
        ValueNotification,
    },
    types::DeviceId,
};

/// Bluetooth adapter backed by the host's BLE stack
pub struct BtleplugAdapter {
    adapter: Adapter,
}

impl BtleplugAdapter {
    /// Open the first Bluetooth adapter on the host
    ///
    /// # Errors
    ///
    /// Returns [`DashboardError::ApiUnavailable`] if the host has no adapter,
    /// or [`DashboardError::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(DashboardError::ApiUnavailable)?;

        Ok(Self { adapter })
    }
}

#[async_trait]
impl BluetoothAdapter for BtleplugAdapter {
    async fn request_device(&self, filter: &DeviceFilter) -> Result<Arc<dyn BlePeripheral>> {
        info!("Scanning for compatible devices...");

        // Manufacturer data cannot be pre-filtered by the host stack, so the
        // scan is unfiltered and candidates are checked afterwards.
        self.adapter
            .start_scan(ScanFilter {
                services: Vec::new(),
            })
            .await?;
        tokio::time::sleep(filter.timeout).await;
        self.adapter.stop_scan().await?;

        let mut candidates = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            if has_manufacturer_prefix(
                &properties.manufacturer_data,
                filter.manufacturer_id,
                &filter.manufacturer_data_prefix,
            ) {
                debug!(
                    "Candidate {:?} ({:?}), rssi {:?}",
                    properties.local_name, properties.address, properties.rssi
                );
                let rssi = properties.rssi.unwrap_or(i16::MIN);
                candidates.push((rssi, properties.local_name, peripheral));
            }
        }

        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        let (_, name, peripheral) = candidates.into_iter().next().ok_or(DashboardError::NoMatch)?;

        info!("Selected device {:?}", name);
        Ok(Arc::new(BtleplugPeripheral::new(
            self.adapter.clone(),
            peripheral,
            name,
            filter.optional_services.clone(),
        )))
    }
}

/// A peripheral seen by [`BtleplugAdapter`]
pub struct BtleplugPeripheral {
    adapter: Adapter,
    peripheral: Peripheral,
    id: DeviceId,
    name: Option<String>,
    allowed_services: Vec<Uuid>,
}

impl BtleplugPeripheral {
    fn new(
        adapter: Adapter,
        peripheral: Peripheral,
        name: Option<String>,
        allowed_services: Vec<Uuid>,
    ) -> Self {
        let id = DeviceId::new(format_peripheral_id(&peripheral.id()));
        Self {
            adapter,
            peripheral,
            id,
            name,
            allowed_services,
        }
    }

    fn find_characteristic(&self, characteristic: &GattCharacteristic) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| {
                c.uuid == characteristic.uuid && c.service_uuid == characteristic.service_uuid
            })
            .ok_or(DashboardError::StaleHandle)
    }
}

#[async_trait]
impl BlePeripheral for BtleplugPeripheral {
    fn id(&self) -> DeviceId {
        self.id.clone()
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    async fn advertisement(&self) -> Result<Advertisement> {
        if let Some(properties) = self.peripheral.properties().await? {
            if !properties.manufacturer_data.is_empty() {
                return Ok(Advertisement {
                    manufacturer_data: properties.manufacturer_data,
                    rssi: properties.rssi,
                });
            }
        }

        let mut samples = self.advertisements().await?;
        samples.next().await.ok_or(DashboardError::IncompatibleDevice)
    }

    async fn advertisements(&self) -> Result<BoxStream<'static, Advertisement>> {
        let events = self.adapter.events().await?;
        let target = self.peripheral.id();
        let peripheral = self.peripheral.clone();

        Ok(events
            .filter_map(move |event| {
                let target = target.clone();
                let peripheral = peripheral.clone();
                async move {
                    match event {
                        CentralEvent::ManufacturerDataAdvertisement {
                            id,
                            manufacturer_data,
                        } if id == target => Some(Advertisement {
                            manufacturer_data,
                            rssi: None,
                        }),
                        CentralEvent::DeviceUpdated(id) if id == target => {
                            let properties = peripheral.properties().await.ok().flatten()?;
                            Some(Advertisement {
                                manufacturer_data: properties.manufacturer_data,
                                rssi: properties.rssi,
                            })
                        }
                        _ => None,
                    }
                }
            })
            .boxed())
    }

    async fn connect(&self) -> Result<()> {
        self.peripheral
            .connect()
            .await
            .map_err(|e| DashboardError::ConnectionFailed(e.to_string()))
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }

    async fn services(&self) -> Result<Vec<Uuid>> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| DashboardError::DiscoveryPartialFailure(e.to_string()))?;
        let services = self.peripheral.services().iter().map(|s| s.uuid).collect();
        Ok(allowed(services, &self.allowed_services))
    }

    async fn characteristics(&self, service: Uuid) -> Result<Vec<GattCharacteristic>> {
        let services = self.peripheral.services();
        let service = services.iter().find(|s| s.uuid == service).ok_or_else(|| {
            DashboardError::DiscoveryPartialFailure(format!("Service {service} not found"))
        })?;

        Ok(service
            .characteristics
            .iter()
            .map(|c| GattCharacteristic {
                uuid: c.uuid,
                service_uuid: c.service_uuid,
                supports_notify: supports_notify(c.properties),
            })
            .collect())
    }

    async fn read(&self, characteristic: &GattCharacteristic) -> Result<Vec<u8>> {
        let target = self.find_characteristic(characteristic)?;
        self.peripheral
            .read(&target)
            .await
            .map_err(|e| DashboardError::ReadFailed(e.to_string()))
    }

    async fn subscribe(&self, characteristic: &GattCharacteristic) -> Result<()> {
        let target = self.find_characteristic(characteristic)?;
        self.peripheral.subscribe(&target).await?;
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, ValueNotification>> {
        let stream = self.peripheral.notifications().await?;
        Ok(stream
            .map(|n| ValueNotification {
                uuid: n.uuid,
                value: n.value,
            })
            .boxed())
    }

    async fn disconnected(&self) -> Result<()> {
        let mut events = self.adapter.events().await?;
        let target = self.peripheral.id();

        while let Some(event) = events.next().await {
            if let CentralEvent::DeviceDisconnected(id) = event {
                if id == target {
                    return Ok(());
                }
            }
        }

        Err(DashboardError::ConnectionFailed(
            "Adapter event stream ended".to_string(),
        ))
    }
}

/// Keep the services the session may access; an empty list allows all
fn allowed(services: Vec<Uuid>, allowed_services: &[Uuid]) -> Vec<Uuid> {
    if allowed_services.is_empty() {
        return services;
    }
    services
        .into_iter()
        .filter(|service| allowed_services.contains(service))
        .collect()
}

/// Notify or indicate both count as push-capable
fn supports_notify(properties: CharPropFlags) -> bool {
    properties.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
}

/// Stable string form of a platform peripheral id
fn format_peripheral_id(id: &PeripheralId) -> String {
    trim_peripheral_id(&format!("{id:?}"))
}

fn trim_peripheral_id(debug: &str) -> String {
    debug
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peripheral_id_trimming() {
        assert_eq!(trim_peripheral_id("PeripheralId(AA:BB:CC:DD:EE:FF)"), "AA:BB:CC:DD:EE:FF");
        assert_eq!(trim_peripheral_id("hci0/dev_AA"), "hci0/dev_AA");
    }

    #[test]
    fn test_service_allow_list() {
        use crate::characteristics::{short_uuid, BATTERY_SERVICE, ENVIRONMENTAL_SENSING_SERVICE};

        let vendor = short_uuid(0xFE59);
        let services = vec![ENVIRONMENTAL_SENSING_SERVICE, vendor, BATTERY_SERVICE];
        assert_eq!(allowed(services.clone(), &[]), services);
        assert_eq!(
            allowed(services, &[BATTERY_SERVICE, ENVIRONMENTAL_SENSING_SERVICE]),
            vec![ENVIRONMENTAL_SENSING_SERVICE, BATTERY_SERVICE]
        );
    }

    #[test]
    fn test_notify_capability_flags() {
        assert!(supports_notify(CharPropFlags::NOTIFY));
        assert!(supports_notify(CharPropFlags::INDICATE | CharPropFlags::READ));
        assert!(!supports_notify(CharPropFlags::READ | CharPropFlags::WRITE));
    }
}
