use futures::stream::{BoxStream, StreamExt};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, warn};

use crate::{
    characteristics::{DataType, KNOWN_SERVICE_UUIDS},
    compat::{is_compatible_advertisement, COMPATIBLE_MANUFACTURER_DATA_PREFIX},
    error::{DashboardError, Result},
    events::{DashboardEvent, DisconnectReason, EventDispatcher, EventReceiver},
    platform::{
        Advertisement, BlePeripheral, BluetoothAdapter, DeviceFilter, GattCharacteristic,
        ValueNotification,
    },
    registry::DeviceRegistry,
    types::{CharacteristicHandle, ConnectionState, DashboardConfig, Device, DeviceId},
};

/// Platform callbacks, delivered into the single event loop
#[derive(Debug)]
enum PlatformEvent {
    Disconnected {
        device: DeviceId,
        epoch: u64,
    },
    Notification {
        device: DeviceId,
        epoch: u64,
        notification: ValueNotification,
    },
    Advertisement {
        device: DeviceId,
        advertisement: Advertisement,
    },
}

/// Forwarding tasks attached to one device.
///
/// Each slot holds at most one task; installing a new one aborts the old.
#[derive(Default)]
struct DeviceSubscriptions {
    link: Option<JoinHandle<()>>,
    notifications: Option<JoinHandle<()>>,
    advertisements: Option<JoinHandle<()>>,
}

impl DeviceSubscriptions {
    fn install(slot: &mut Option<JoinHandle<()>>, task: JoinHandle<()>) {
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    fn revoke_session(&mut self) {
        for task in [self.link.take(), self.notifications.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

type Subscriptions = Arc<Mutex<HashMap<DeviceId, DeviceSubscriptions>>>;

/// Connection lifecycle manager.
///
/// Owns the device registry and is the only writer to it. Scans, connects,
/// disconnects and reads are exposed as async methods; platform callbacks
/// are forwarded into an internal event loop so that every registry
/// mutation goes through the same path.
///
/// The manager is cheap to clone; clones share all state.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use bledash::{BtleplugAdapter, ConnectionManager, DashboardConfig, DataType};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let adapter = Arc::new(BtleplugAdapter::new().await?);
///     let manager = ConnectionManager::new(adapter, DashboardConfig::default());
///
///     let id = manager.scan().await?;
///     manager.connect(&id).await?;
///
///     if let Some(celsius) = manager.read_value(&id, DataType::Temperature).await {
///         println!("{celsius:.1} °C");
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    adapter: Arc<dyn BluetoothAdapter>,
    registry: Arc<RwLock<DeviceRegistry>>,
    peripherals: Arc<Mutex<HashMap<DeviceId, Arc<dyn BlePeripheral>>>>,
    connecting: Arc<Mutex<HashSet<DeviceId>>>,
    subscriptions: Subscriptions,
    platform_tx: mpsc::UnboundedSender<PlatformEvent>,
    events: EventDispatcher,
    config: Arc<DashboardConfig>,
}

impl ConnectionManager {
    /// Create a manager and start its event loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(adapter: Arc<dyn BluetoothAdapter>, config: DashboardConfig) -> Self {
        let (platform_tx, platform_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(RwLock::new(DeviceRegistry::new()));
        let subscriptions: Subscriptions = Arc::new(Mutex::new(HashMap::new()));
        let events = EventDispatcher::new(config.event_capacity);

        tokio::spawn(run_event_loop(
            platform_rx,
            registry.clone(),
            subscriptions.clone(),
            events.clone(),
        ));

        Self {
            adapter,
            registry,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            connecting: Arc::new(Mutex::new(HashSet::new())),
            subscriptions,
            platform_tx,
            events,
            config: Arc::new(config),
        }
    }

    /// Subscribe to user-visible notifications
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &DashboardConfig {
        &self.config
    }

    /// Snapshot of all known devices in discovery order
    pub async fn devices(&self) -> Vec<Arc<Device>> {
        self.registry.read().await.devices()
    }

    /// Snapshot of one device
    pub async fn device(&self, id: &DeviceId) -> Option<Arc<Device>> {
        self.registry.read().await.get(id)
    }

    /// Cached value for a device characteristic
    pub async fn value(&self, id: &DeviceId, data_type: DataType) -> Option<f64> {
        self.registry.read().await.value(id, data_type)
    }

    /// Lifecycle state including the transient `Connecting` state
    pub async fn connection_state(&self, id: &DeviceId) -> Option<ConnectionState> {
        if self.connecting.lock().await.contains(id) {
            return Some(ConnectionState::Connecting);
        }
        self.registry.read().await.get(id).map(|device| device.state())
    }

    /// Whether `epoch` is still the live connection of the device
    pub async fn is_current(&self, id: &DeviceId, epoch: u64) -> bool {
        self.registry.read().await.is_current(id, epoch)
    }

    /// Discovery filter derived from the configuration
    #[must_use]
    pub fn device_filter(&self) -> DeviceFilter {
        DeviceFilter {
            manufacturer_id: self.config.manufacturer_id,
            manufacturer_data_prefix: COMPATIBLE_MANUFACTURER_DATA_PREFIX.to_vec(),
            optional_services: KNOWN_SERVICE_UUIDS.to_vec(),
            timeout: self.config.scan_timeout(),
        }
    }

    /// Run discovery and register the chosen device.
    ///
    /// The device is only registered after an advertisement sample confirms
    /// the compatibility signature. Scanning a device that is already known
    /// leaves its record untouched.
    ///
    /// # Errors
    ///
    /// Returns [`DashboardError::ApiUnavailable`], [`DashboardError::UserCancelled`]
    /// or [`DashboardError::NoMatch`] from the platform prompt, and
    /// [`DashboardError::IncompatibleDevice`] if the signature check fails or
    /// times out. The registry is unchanged on every error.
    pub async fn scan(&self) -> Result<DeviceId> {
        info!("Requesting Bluetooth device...");

        let peripheral = match self.adapter.request_device(&self.device_filter()).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                warn!("Bluetooth device request failed: {e}");
                self.events.send(DashboardEvent::ScanFailed {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let id = peripheral.id();
        let advertisement = match timeout(
            self.config.compatibility_timeout(),
            peripheral.advertisement(),
        )
        .await
        {
            Ok(Ok(advertisement)) => Some(advertisement),
            Ok(Err(e)) => {
                debug!("No advertisement from {id}: {e}");
                None
            }
            Err(_) => {
                debug!(
                    "No advertisement from {id} within {}ms",
                    self.config.compatibility_timeout_ms
                );
                None
            }
        };

        let compatible = advertisement.as_ref().is_some_and(|advertisement| {
            is_compatible_advertisement(
                &advertisement.manufacturer_data,
                self.config.manufacturer_id,
            )
        });
        if !compatible {
            let error = DashboardError::IncompatibleDevice;
            warn!("Rejecting {id}: {error}");
            self.events.send(DashboardEvent::ScanFailed {
                reason: error.to_string(),
            });
            return Err(error);
        }

        let rssi = advertisement.and_then(|a| a.rssi).unwrap_or(0);
        let device = Device::new(id.clone(), peripheral.name(), rssi);
        let name = device.display_name().to_string();

        if !self.registry.write().await.upsert_discovered(device) {
            debug!("Scan returned known device {id}");
            return Ok(id);
        }

        self.peripherals
            .lock()
            .await
            .insert(id.clone(), peripheral.clone());
        self.watch_advertisements(&id, peripheral).await;

        info!("Device found: {name} ({id})");
        self.events.send(DashboardEvent::DeviceFound {
            device: id.clone(),
            name,
        });
        Ok(id)
    }

    /// Open a session and discover characteristics.
    ///
    /// Already connected or connecting devices are left alone. Failures in
    /// individual service or characteristic enumeration are logged and
    /// skipped; only failure to open the session aborts.
    ///
    /// # Errors
    ///
    /// Returns [`DashboardError::DeviceNotFound`] for unknown ids and
    /// [`DashboardError::ConnectionFailed`] if the session cannot be opened.
    pub async fn connect(&self, id: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(id).await?;

        if self.registry.read().await.get(id).is_some_and(|d| d.connected) {
            debug!("{id} is already connected");
            return Ok(());
        }
        if !self.connecting.lock().await.insert(id.clone()) {
            debug!("{id} is already connecting");
            return Ok(());
        }

        let result = self.open_session(id, &peripheral).await;
        self.connecting.lock().await.remove(id);
        result
    }

    async fn open_session(&self, id: &DeviceId, peripheral: &Arc<dyn BlePeripheral>) -> Result<()> {
        let name = self.display_name(id).await;
        info!("Connecting to {name}...");

        let opened = match timeout(self.config.connect_timeout(), peripheral.connect()).await {
            Ok(result) => result,
            Err(_) => Err(DashboardError::Timeout {
                timeout_ms: self.config.connect_timeout_ms,
            }),
        };
        if let Err(e) = opened {
            error!("Failed to connect to {name}: {e}");
            self.events.send(DashboardEvent::ConnectionFailed {
                device: id.clone(),
                name,
                reason: e.to_string(),
            });
            return Err(match e {
                DashboardError::ConnectionFailed(_) => e,
                other => DashboardError::ConnectionFailed(other.to_string()),
            });
        }

        let notifications = match peripheral.notifications().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!("Notifications unavailable for {name}: {e}");
                None
            }
        };
        let characteristics = discover_characteristics(peripheral.as_ref()).await;
        let found: Vec<DataType> = {
            let mut found: Vec<DataType> = characteristics.keys().copied().collect();
            found.sort();
            found
        };

        let epoch = self
            .registry
            .write()
            .await
            .set_connection_state(id, true, Some(characteristics));
        let Some(epoch) = epoch else {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Failed to close session for unregistered {name}: {e}");
            }
            return Err(DashboardError::DeviceNotFound(id.to_string()));
        };

        self.watch_session(id, epoch, peripheral.clone(), notifications)
            .await;

        info!("Connected to {name} with {} known characteristic(s)", found.len());
        self.events.send(DashboardEvent::Connected {
            device: id.clone(),
            name,
            characteristics: found,
        });
        Ok(())
    }

    /// User-driven teardown; a no-op when not connected
    ///
    /// # Errors
    ///
    /// Never fails for unknown or disconnected devices; platform errors while
    /// closing the session are logged and the registry is updated regardless.
    pub async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        let Some(device) = self.registry.read().await.get(id) else {
            return Ok(());
        };
        if !device.connected {
            return Ok(());
        }

        // Revoke the link watcher first so the platform's own disconnect
        // event is not reported as a lost connection.
        if let Some(subscriptions) = self.subscriptions.lock().await.get_mut(id) {
            subscriptions.revoke_session();
        }

        info!("Disconnecting from {}...", device.display_name());
        let peripheral = self.peripherals.lock().await.get(id).cloned();
        if let Some(peripheral) = peripheral {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Failed to disconnect from {}: {e}", device.display_name());
            }
        }

        // A link loss handled while the session was closing already
        // reported this connection.
        {
            let mut registry = self.registry.write().await;
            if !registry.is_current(id, device.epoch) {
                debug!("{} was already disconnected", device.display_name());
                return Ok(());
            }
            registry.set_connection_state(id, false, None);
        }
        self.events.send(DashboardEvent::Disconnected {
            device: id.clone(),
            name: device.display_name().to_string(),
            reason: DisconnectReason::UserRequested,
        });
        Ok(())
    }

    /// Set the user display name; returns false for unknown ids
    pub async fn rename(&self, id: &DeviceId, name: &str) -> bool {
        let mut registry = self.registry.write().await;
        if !registry.rename(id, name) {
            return false;
        }
        let display = registry
            .get(id)
            .map(|d| d.display_name().to_string())
            .unwrap_or_default();
        drop(registry);

        self.events.send(DashboardEvent::Renamed {
            device: id.clone(),
            name: display,
        });
        true
    }

    /// Read and cache one characteristic, `None` on any failure.
    ///
    /// Failures are logged and published as [`DashboardEvent::ReadFailed`];
    /// the previously cached value is kept.
    pub async fn read_value(&self, id: &DeviceId, data_type: DataType) -> Option<f64> {
        match self.try_read_value(id, data_type).await {
            Ok(value) => Some(value),
            Err(e) => {
                self.report_read_failure(id, data_type, &e);
                None
            }
        }
    }

    /// Read and cache one characteristic
    ///
    /// # Errors
    ///
    /// Returns [`DashboardError::ReadFailed`] if the device is not connected,
    /// lacks the characteristic or the read fails, and
    /// [`DashboardError::StaleHandle`] if the device disconnected while the
    /// read was in flight.
    pub async fn try_read_value(&self, id: &DeviceId, data_type: DataType) -> Result<f64> {
        let device = self
            .device(id)
            .await
            .ok_or_else(|| DashboardError::DeviceNotFound(id.to_string()))?;
        if !device.connected {
            return Err(DashboardError::ReadFailed(format!(
                "{} is not connected",
                device.display_name()
            )));
        }
        let handle = device
            .characteristics
            .get(&data_type)
            .cloned()
            .ok_or_else(|| DashboardError::ReadFailed(format!("{data_type} not available")))?;

        let value = self.read_handle(id, &handle).await?;
        if self.merge_values(id, handle.epoch, &[(data_type, value)]).await.is_empty() {
            return Err(DashboardError::StaleHandle);
        }
        Ok(value)
    }

    /// Read through a handle without caching the result.
    ///
    /// # Errors
    ///
    /// Returns [`DashboardError::StaleHandle`] when the handle's epoch is no
    /// longer live, otherwise [`DashboardError::ReadFailed`].
    pub async fn read_handle(&self, id: &DeviceId, handle: &CharacteristicHandle) -> Result<f64> {
        if !self.is_current(id, handle.epoch).await {
            return Err(DashboardError::StaleHandle);
        }
        let peripheral = self.peripheral(id).await?;
        let characteristic = GattCharacteristic {
            uuid: handle.uuid,
            service_uuid: handle.service_uuid,
            supports_notify: handle.supports_notify,
        };

        let data = peripheral.read(&characteristic).await.map_err(|e| match e {
            DashboardError::ReadFailed(_) | DashboardError::StaleHandle => e,
            other => DashboardError::ReadFailed(other.to_string()),
        })?;
        let value = handle.data_type.decode(&data);
        debug!("{id} {} = {value} ({:02X?})", handle.data_type, data);
        Ok(value)
    }

    /// Merge readings taken during `epoch` in one registry write.
    ///
    /// Returns the characteristics written; stale readings are dropped.
    pub async fn merge_values(
        &self,
        id: &DeviceId,
        epoch: u64,
        values: &[(DataType, f64)],
    ) -> Vec<DataType> {
        let written = self.registry.write().await.record_values(id, epoch, values);
        if written.is_empty() {
            debug!("Discarded {} reading(s) for {id} from epoch {epoch}", values.len());
        } else {
            self.events.send(DashboardEvent::ValuesUpdated {
                device: id.clone(),
                data_types: written.clone(),
            });
        }
        written
    }

    /// Log and publish a failed read
    pub fn report_read_failure(&self, id: &DeviceId, data_type: DataType, error: &DashboardError) {
        warn!("Failed to read {data_type} from {id}: {error}");
        self.events.send(DashboardEvent::ReadFailed {
            device: id.clone(),
            data_type,
            reason: error.to_string(),
        });
    }

    async fn peripheral(&self, id: &DeviceId) -> Result<Arc<dyn BlePeripheral>> {
        self.peripherals
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| DashboardError::DeviceNotFound(id.to_string()))
    }

    async fn display_name(&self, id: &DeviceId) -> String {
        self.device(id)
            .await
            .map_or_else(|| id.to_string(), |d| d.display_name().to_string())
    }

    async fn watch_advertisements(&self, id: &DeviceId, peripheral: Arc<dyn BlePeripheral>) {
        let tx = self.platform_tx.clone();
        let device = id.clone();
        let task = tokio::spawn(async move {
            let mut samples = match peripheral.advertisements().await {
                Ok(samples) => samples,
                Err(e) => {
                    debug!("Advertisement watch unavailable for {device}: {e}");
                    return;
                }
            };
            while let Some(advertisement) = samples.next().await {
                let event = PlatformEvent::Advertisement {
                    device: device.clone(),
                    advertisement,
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        });

        let mut subscriptions = self.subscriptions.lock().await;
        let entry = subscriptions.entry(id.clone()).or_default();
        DeviceSubscriptions::install(&mut entry.advertisements, task);
    }

    async fn watch_session(
        &self,
        id: &DeviceId,
        epoch: u64,
        peripheral: Arc<dyn BlePeripheral>,
        notifications: Option<BoxStream<'static, ValueNotification>>,
    ) {
        let link_task = {
            let tx = self.platform_tx.clone();
            let device = id.clone();
            tokio::spawn(async move {
                match peripheral.disconnected().await {
                    Ok(()) => {
                        let _ = tx.send(PlatformEvent::Disconnected { device, epoch });
                    }
                    Err(e) => warn!("Disconnect watch for {device} ended: {e}"),
                }
            })
        };

        let notification_task = notifications.map(|mut stream| {
            let tx = self.platform_tx.clone();
            let device = id.clone();
            tokio::spawn(async move {
                while let Some(notification) = stream.next().await {
                    let event = PlatformEvent::Notification {
                        device: device.clone(),
                        epoch,
                        notification,
                    };
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            })
        });

        let mut subscriptions = self.subscriptions.lock().await;
        let entry = subscriptions.entry(id.clone()).or_default();
        DeviceSubscriptions::install(&mut entry.link, link_task);
        match notification_task {
            Some(task) => DeviceSubscriptions::install(&mut entry.notifications, task),
            None => {
                if let Some(previous) = entry.notifications.take() {
                    previous.abort();
                }
            }
        }
    }
}

/// Enumerate services and characteristics, keeping the known ones.
///
/// Push-capable characteristics are subscribed on the way; any single
/// failure is logged and skipped.
async fn discover_characteristics(
    peripheral: &dyn BlePeripheral,
) -> HashMap<DataType, CharacteristicHandle> {
    let id = peripheral.id();
    let mut found = HashMap::new();

    let services = match peripheral.services().await {
        Ok(services) => services,
        Err(e) => {
            warn!("{}", DashboardError::DiscoveryPartialFailure(format!("{id}: {e}")));
            Vec::new()
        }
    };

    for service in services {
        let characteristics = match peripheral.characteristics(service).await {
            Ok(characteristics) => characteristics,
            Err(e) => {
                warn!(
                    "{}",
                    DashboardError::DiscoveryPartialFailure(format!("{id} service {service}: {e}"))
                );
                continue;
            }
        };

        for characteristic in characteristics {
            let Some(data_type) = DataType::from_uuid(&characteristic.uuid) else {
                debug!("Skipping unrecognized characteristic {}", characteristic.uuid);
                continue;
            };
            if found.contains_key(&data_type) {
                continue;
            }

            let subscribed = characteristic.supports_notify
                && match peripheral.subscribe(&characteristic).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Could not subscribe to {data_type} on {id}: {e}");
                        false
                    }
                };

            found.insert(
                data_type,
                CharacteristicHandle {
                    data_type,
                    uuid: characteristic.uuid,
                    service_uuid: characteristic.service_uuid,
                    supports_notify: characteristic.supports_notify,
                    subscribed,
                    epoch: 0,
                },
            );
        }
    }

    found
}

/// Apply platform callbacks to the registry, one at a time
async fn run_event_loop(
    mut rx: mpsc::UnboundedReceiver<PlatformEvent>,
    registry: Arc<RwLock<DeviceRegistry>>,
    subscriptions: Subscriptions,
    events: EventDispatcher,
) {
    while let Some(event) = rx.recv().await {
        match event {
            PlatformEvent::Disconnected { device, epoch } => {
                let mut guard = registry.write().await;
                if !guard.is_current(&device, epoch) {
                    debug!("Ignoring disconnect of {device} from epoch {epoch}");
                    continue;
                }
                guard.set_connection_state(&device, false, None);
                let name = guard
                    .get(&device)
                    .map(|d| d.display_name().to_string())
                    .unwrap_or_default();
                drop(guard);

                if let Some(entry) = subscriptions.lock().await.get_mut(&device) {
                    entry.revoke_session();
                }

                warn!("{name} disconnected unexpectedly");
                events.send(DashboardEvent::Disconnected {
                    device,
                    name,
                    reason: DisconnectReason::ConnectionLost,
                });
            }
            PlatformEvent::Notification {
                device,
                epoch,
                notification,
            } => {
                let Some(data_type) = DataType::from_uuid(&notification.uuid) else {
                    continue;
                };
                let value = data_type.decode(&notification.value);
                let written = registry
                    .write()
                    .await
                    .record_values(&device, epoch, &[(data_type, value)]);
                if written.is_empty() {
                    continue;
                }
                debug!("{device} {data_type} pushed {value}");
                events.send(DashboardEvent::ValuesUpdated {
                    device,
                    data_types: written,
                });
            }
            PlatformEvent::Advertisement {
                device,
                advertisement,
            } => {
                if let Some(rssi) = advertisement.rssi {
                    registry.write().await.update_signal(&device, rssi);
                }
            }
        }
    }
    debug!("Platform event loop stopped");
}
