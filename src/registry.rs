//! In-memory set of known devices.
//!
//! The registry is the only shared mutable state in the crate. Records are
//! held as `Arc<Device>` and every mutation clones the record, edits the
//! clone and swaps it in, so snapshots handed to readers never change under
//! them. Operations against unknown ids are no-ops.

use std::{collections::HashMap, sync::Arc};
use tracing::debug;

use crate::characteristics::DataType;
use crate::types::{CachedValue, CharacteristicHandle, Device, DeviceId};

/// Devices keyed by id, kept in discovery order
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, Arc<Device>>,
    order: Vec<DeviceId>,
    seq: u64,
}

impl DeviceRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a newly discovered device.
    ///
    /// Returns false, leaving the stored record untouched, when the id is
    /// already known.
    pub fn upsert_discovered(&mut self, device: Device) -> bool {
        if self.devices.contains_key(&device.id) {
            debug!("Device {} already known, keeping existing state", device.id);
            return false;
        }
        self.order.push(device.id.clone());
        self.devices.insert(device.id.clone(), Arc::new(device));
        true
    }

    /// Flip the connected flag and replace the characteristic map.
    ///
    /// Connecting starts a new epoch: handles are stamped with it and the
    /// value cache starts empty. Disconnecting clears both maps. Returns the
    /// device's epoch after the update.
    pub fn set_connection_state(
        &mut self,
        id: &DeviceId,
        connected: bool,
        characteristics: Option<HashMap<DataType, CharacteristicHandle>>,
    ) -> Option<u64> {
        let mut epoch = None;
        self.update(id, |device| {
            if connected {
                device.epoch += 1;
                let mut handles = characteristics.unwrap_or_default();
                for handle in handles.values_mut() {
                    handle.epoch = device.epoch;
                }
                device.characteristics = handles;
            } else {
                device.characteristics.clear();
            }
            device.connected = connected;
            device.latest_values.clear();
            epoch = Some(device.epoch);
            true
        });
        epoch
    }

    /// Apply a signal strength sample from an advertisement
    pub fn update_signal(&mut self, id: &DeviceId, rssi: i16) -> bool {
        self.update(id, |device| {
            if device.rssi == rssi {
                return false;
            }
            device.rssi = rssi;
            true
        })
    }

    /// Set the user display name; blank names clear it
    pub fn rename(&mut self, id: &DeviceId, name: &str) -> bool {
        let name = name.trim();
        self.update(id, |device| {
            device.custom_name = (!name.is_empty()).then(|| name.to_string());
            true
        })
    }

    /// Merge one reading into the current connection's cache.
    ///
    /// Dropped when the device is unknown or not connected.
    pub fn record_value(&mut self, id: &DeviceId, data_type: DataType, value: f64) -> bool {
        let Some(epoch) = self.get(id).filter(|d| d.connected).map(|d| d.epoch) else {
            return false;
        };
        !self.record_values(id, epoch, &[(data_type, value)]).is_empty()
    }

    /// Merge readings taken during `epoch`.
    ///
    /// Readings from an older epoch, or arriving after a disconnect, are
    /// discarded. Returns the characteristics that were written.
    pub fn record_values(
        &mut self,
        id: &DeviceId,
        epoch: u64,
        values: &[(DataType, f64)],
    ) -> Vec<DataType> {
        let mut written = Vec::new();
        let mut seq = self.seq;
        self.update(id, |device| {
            if !device.connected || device.epoch != epoch {
                debug!("Dropping {} stale reading(s) for {}", values.len(), device.id);
                return false;
            }
            for &(data_type, value) in values {
                seq += 1;
                device.latest_values.insert(data_type, CachedValue { value, seq });
                written.push(data_type);
            }
            !written.is_empty()
        });
        self.seq = seq;
        written
    }

    /// Snapshot of one device
    #[must_use]
    pub fn get(&self, id: &DeviceId) -> Option<Arc<Device>> {
        self.devices.get(id).cloned()
    }

    /// Snapshot of all devices in discovery order
    #[must_use]
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.order
            .iter()
            .filter_map(|id| self.devices.get(id).cloned())
            .collect()
    }

    /// Snapshot of connected devices in discovery order
    #[must_use]
    pub fn connected_devices(&self) -> Vec<Arc<Device>> {
        self.devices().into_iter().filter(|d| d.connected).collect()
    }

    /// Latest value for a device characteristic
    #[must_use]
    pub fn value(&self, id: &DeviceId, data_type: DataType) -> Option<f64> {
        self.devices.get(id)?.value(data_type)
    }

    /// Whether `epoch` is still the live connection of the device
    #[must_use]
    pub fn is_current(&self, id: &DeviceId, epoch: u64) -> bool {
        self.devices
            .get(id)
            .is_some_and(|device| device.connected && device.epoch == epoch)
    }

    /// Whether the id is known
    #[must_use]
    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    /// Number of known devices
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no devices are known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Copy-on-write update; the record is only replaced when `apply` returns true
    fn update(&mut self, id: &DeviceId, apply: impl FnOnce(&mut Device) -> bool) -> bool {
        let Some(current) = self.devices.get(id) else {
            debug!("Ignoring update for unknown device {id}");
            return false;
        };
        let mut next = Device::clone(current);
        if !apply(&mut next) {
            return false;
        }
        self.devices.insert(id.clone(), Arc::new(next));
        true
    }
}
