//! In-memory platform for testing without BLE hardware.
//!
//! [`MockAdapter`] and [`MockPeripheral`] implement the platform traits so
//! the connection manager and scheduler can be driven end to end.
//!
//! # Features
//!
//! - **Failure injection**: connect failure, per-service enumeration failure,
//!   per-characteristic read failure, queued scan errors
//! - **Push injection**: deliver notifications for subscribed characteristics
//! - **Link loss**: simulate a platform-originated disconnect
//! - **Latency simulation**: delay reads and disconnects to exercise
//!   late-arriving results

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use uuid::Uuid;

use crate::{
    characteristics::DataType,
    compat::{COMPATIBLE_MANUFACTURER_DATA_PREFIX, COMPATIBLE_MANUFACTURER_ID},
    error::{DashboardError, Result},
    platform::{
        Advertisement, BlePeripheral, BluetoothAdapter, DeviceFilter, GattCharacteristic,
        ValueNotification,
    },
    types::DeviceId,
};

/// A mock adapter handing out queued scan results
#[derive(Default)]
pub struct MockAdapter {
    queue: Mutex<VecDeque<Result<Arc<MockPeripheral>>>>,
    requests: AtomicUsize,
}

impl MockAdapter {
    /// Create an adapter with an empty queue; scans report `NoMatch`
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a device for the next scan
    pub async fn queue_device(&self, peripheral: Arc<MockPeripheral>) {
        self.queue.lock().await.push_back(Ok(peripheral));
    }

    /// Queue a failure for the next scan
    pub async fn queue_error(&self, error: DashboardError) {
        self.queue.lock().await.push_back(Err(error));
    }

    /// Number of discovery requests made
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BluetoothAdapter for MockAdapter {
    async fn request_device(&self, _filter: &DeviceFilter) -> Result<Arc<dyn BlePeripheral>> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        match self.queue.lock().await.pop_front() {
            Some(Ok(peripheral)) => Ok(peripheral),
            Some(Err(error)) => Err(error),
            None => Err(DashboardError::NoMatch),
        }
    }
}

#[derive(Debug, Clone)]
struct MockService {
    uuid: Uuid,
    characteristics: Vec<GattCharacteristic>,
}

/// A mock peripheral with scripted GATT contents
pub struct MockPeripheral {
    id: DeviceId,
    name: Option<String>,
    advertisement: RwLock<Option<Advertisement>>,
    advertisements: broadcast::Sender<Advertisement>,
    services: RwLock<Vec<MockService>>,
    values: RwLock<HashMap<Uuid, Vec<u8>>>,
    failing_services: RwLock<HashSet<Uuid>>,
    failing_reads: RwLock<HashSet<Uuid>>,
    subscriptions: RwLock<HashSet<Uuid>>,
    notifications: broadcast::Sender<ValueNotification>,
    link: watch::Sender<bool>,
    fail_connect: AtomicBool,
    read_latency_ms: AtomicU64,
    disconnect_latency_ms: AtomicU64,
    read_count: AtomicUsize,
    subscribe_count: AtomicUsize,
    connect_count: AtomicUsize,
}

impl std::fmt::Debug for MockPeripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPeripheral")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("connected", &*self.link.borrow())
            .finish()
    }
}

impl MockPeripheral {
    /// Start building a mock peripheral
    pub fn builder(id: &str) -> MockPeripheralBuilder {
        MockPeripheralBuilder::new(id)
    }

    /// Replace the value returned by reads
    pub async fn set_value(&self, uuid: Uuid, value: Vec<u8>) {
        self.values.write().await.insert(uuid, value);
    }

    /// Make reads of a characteristic fail or succeed again
    pub async fn set_read_failure(&self, uuid: Uuid, fail: bool) {
        let mut failing = self.failing_reads.write().await;
        if fail {
            failing.insert(uuid);
        } else {
            failing.remove(&uuid);
        }
    }

    /// Make connection attempts fail
    pub fn set_connect_failure(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::Relaxed);
    }

    /// Delay every read by `latency`
    pub fn set_read_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.read_latency_ms.store(ms, Ordering::Relaxed);
    }

    /// Delay closing the session by `latency`
    pub fn set_disconnect_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.disconnect_latency_ms.store(ms, Ordering::Relaxed);
    }

    /// Replace the advertisement sample; `None` means nothing is advertised
    pub async fn set_advertisement(&self, advertisement: Option<Advertisement>) {
        *self.advertisement.write().await = advertisement;
    }

    /// Emit an advertisement on the watch stream
    pub fn advertise(&self, advertisement: Advertisement) {
        let _ = self.advertisements.send(advertisement);
    }

    /// Push a value; delivered only if the characteristic is subscribed
    pub async fn push(&self, uuid: Uuid, value: Vec<u8>) -> bool {
        if !self.subscriptions.read().await.contains(&uuid) || !*self.link.borrow() {
            return false;
        }
        self.values.write().await.insert(uuid, value.clone());
        self.notifications.send(ValueNotification { uuid, value }).is_ok()
    }

    /// Drop the link as if the device went out of range
    pub async fn simulate_link_loss(&self) {
        self.subscriptions.write().await.clear();
        self.link.send_replace(false);
    }

    /// Whether the simulated link is up
    pub fn is_connected(&self) -> bool {
        *self.link.borrow()
    }

    /// Total successful and failed reads
    pub fn read_count(&self) -> usize {
        self.read_count.load(Ordering::Relaxed)
    }

    /// Number of subscribe calls across all connections
    pub fn subscribe_count(&self) -> usize {
        self.subscribe_count.load(Ordering::Relaxed)
    }

    /// Number of successful connects
    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::Relaxed)
    }

    async fn find(&self, characteristic: &GattCharacteristic) -> bool {
        self.services.read().await.iter().any(|service| {
            service.uuid == characteristic.service_uuid
                && service
                    .characteristics
                    .iter()
                    .any(|c| c.uuid == characteristic.uuid)
        })
    }
}

#[async_trait]
impl BlePeripheral for MockPeripheral {
    fn id(&self) -> DeviceId {
        self.id.clone()
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    async fn advertisement(&self) -> Result<Advertisement> {
        if let Some(advertisement) = self.advertisement.read().await.clone() {
            return Ok(advertisement);
        }
        // Nothing advertised: never resolves, the caller bounds the wait.
        futures::future::pending().await
    }

    async fn advertisements(&self) -> Result<BoxStream<'static, Advertisement>> {
        Ok(broadcast_stream(self.advertisements.subscribe()))
    }

    async fn connect(&self) -> Result<()> {
        if self.fail_connect.load(Ordering::Relaxed) {
            return Err(DashboardError::ConnectionFailed(
                "Mock connection failure".to_string(),
            ));
        }
        self.connect_count.fetch_add(1, Ordering::Relaxed);
        self.link.send_replace(true);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let latency = self.disconnect_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.subscriptions.write().await.clear();
        self.link.send_replace(false);
        Ok(())
    }

    async fn services(&self) -> Result<Vec<Uuid>> {
        Ok(self.services.read().await.iter().map(|s| s.uuid).collect())
    }

    async fn characteristics(&self, service: Uuid) -> Result<Vec<GattCharacteristic>> {
        if self.failing_services.read().await.contains(&service) {
            return Err(DashboardError::DiscoveryPartialFailure(format!(
                "Mock enumeration failure for {service}"
            )));
        }
        self.services
            .read()
            .await
            .iter()
            .find(|s| s.uuid == service)
            .map(|s| s.characteristics.clone())
            .ok_or_else(|| {
                DashboardError::DiscoveryPartialFailure(format!("Unknown service {service}"))
            })
    }

    async fn read(&self, characteristic: &GattCharacteristic) -> Result<Vec<u8>> {
        self.read_count.fetch_add(1, Ordering::Relaxed);

        let latency = self.read_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if !*self.link.borrow() {
            return Err(DashboardError::ReadFailed("Not connected".to_string()));
        }
        if !self.find(characteristic).await {
            return Err(DashboardError::StaleHandle);
        }
        if self.failing_reads.read().await.contains(&characteristic.uuid) {
            return Err(DashboardError::ReadFailed("Mock read failure".to_string()));
        }
        self.values
            .read()
            .await
            .get(&characteristic.uuid)
            .cloned()
            .ok_or_else(|| DashboardError::ReadFailed("No value".to_string()))
    }

    async fn subscribe(&self, characteristic: &GattCharacteristic) -> Result<()> {
        if !characteristic.supports_notify {
            return Err(DashboardError::InvalidParameters(
                "Characteristic does not support notifications".to_string(),
            ));
        }
        self.subscribe_count.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.write().await.insert(characteristic.uuid);
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, ValueNotification>> {
        Ok(broadcast_stream(self.notifications.subscribe()))
    }

    async fn disconnected(&self) -> Result<()> {
        let mut link = self.link.subscribe();
        link.wait_for(|up| !*up)
            .await
            .map_err(|_| DashboardError::UnexpectedDisconnect)?;
        Ok(())
    }
}

fn broadcast_stream<T: Clone + Send + 'static>(
    rx: broadcast::Receiver<T>,
) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

/// Builder for [`MockPeripheral`]
#[derive(Debug)]
pub struct MockPeripheralBuilder {
    id: String,
    name: Option<String>,
    advertisement: Option<Advertisement>,
    services: Vec<MockService>,
    values: HashMap<Uuid, Vec<u8>>,
    failing_services: HashSet<Uuid>,
}

impl MockPeripheralBuilder {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            advertisement: None,
            services: Vec::new(),
            values: HashMap::new(),
            failing_services: HashSet::new(),
        }
    }

    /// Set the advertised name
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Advertise the compatible signature with the given signal strength
    #[must_use]
    pub fn compatible(self, rssi: i16) -> Self {
        let mut payload = COMPATIBLE_MANUFACTURER_DATA_PREFIX.to_vec();
        payload.push(0x01);
        self.manufacturer_data(COMPATIBLE_MANUFACTURER_ID, payload, rssi)
    }

    /// Advertise arbitrary manufacturer data
    #[must_use]
    pub fn manufacturer_data(mut self, company: u16, payload: Vec<u8>, rssi: i16) -> Self {
        self.advertisement = Some(Advertisement {
            manufacturer_data: HashMap::from([(company, payload)]),
            rssi: Some(rssi),
        });
        self
    }

    /// Add a known characteristic with an initial raw value
    #[must_use]
    pub fn characteristic(
        self,
        service: Uuid,
        data_type: DataType,
        notify: bool,
        value: Vec<u8>,
    ) -> Self {
        self.raw_characteristic(service, data_type.uuid(), notify, value)
    }

    /// Add any characteristic with an initial raw value
    #[must_use]
    pub fn raw_characteristic(
        mut self,
        service: Uuid,
        uuid: Uuid,
        notify: bool,
        value: Vec<u8>,
    ) -> Self {
        let characteristic = GattCharacteristic {
            uuid,
            service_uuid: service,
            supports_notify: notify,
        };
        match self.services.iter_mut().find(|s| s.uuid == service) {
            Some(existing) => existing.characteristics.push(characteristic),
            None => self.services.push(MockService {
                uuid: service,
                characteristics: vec![characteristic],
            }),
        }
        self.values.insert(uuid, value);
        self
    }

    /// Make enumeration of one service fail
    #[must_use]
    pub fn failing_service(mut self, service: Uuid) -> Self {
        self.failing_services.insert(service);
        self
    }

    /// Build the peripheral
    #[must_use]
    pub fn build(self) -> Arc<MockPeripheral> {
        let (advertisements, _) = broadcast::channel(16);
        let (notifications, _) = broadcast::channel(64);
        let (link, _) = watch::channel(false);

        Arc::new(MockPeripheral {
            id: DeviceId::new(self.id),
            name: self.name,
            advertisement: RwLock::new(self.advertisement),
            advertisements,
            services: RwLock::new(self.services),
            values: RwLock::new(self.values),
            failing_services: RwLock::new(self.failing_services),
            failing_reads: RwLock::new(HashSet::new()),
            subscriptions: RwLock::new(HashSet::new()),
            notifications,
            link,
            fail_connect: AtomicBool::new(false),
            read_latency_ms: AtomicU64::new(0),
            disconnect_latency_ms: AtomicU64::new(0),
            read_count: AtomicUsize::new(0),
            subscribe_count: AtomicUsize::new(0),
            connect_count: AtomicUsize::new(0),
        })
    }
}
