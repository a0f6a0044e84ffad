//! Value acquisition for bound widgets.
//!
//! Push-capable characteristics get one confirmatory read per connection and
//! are then updated by notifications alone. Everything else is polled.
//! Polling is grouped by device, connection epoch and interval: each group
//! owns one timer, issues all of its reads concurrently per tick and merges
//! the results in a single registry write.
//!
//! Groups are keyed by connection epoch, so a reconnect always starts fresh
//! timers and a group never outlives the connection it was created for.

use futures::future::join_all;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{broadcast::error::RecvError, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info};

use crate::{
    characteristics::DataType,
    error::DashboardError,
    events::{DashboardEvent, EventReceiver},
    manager::ConnectionManager,
    types::{CharacteristicHandle, DeviceId},
    widget::{Widget, WidgetId},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PollKey {
    device: DeviceId,
    epoch: u64,
    interval: Duration,
}

/// One timer and the characteristics it reads
struct PollGroup {
    data_types: Vec<DataType>,
    task: JoinHandle<()>,
}

impl Drop for PollGroup {
    fn drop(&mut self) {
        self.task.abort();
    }
}

type PushKey = (DeviceId, u64, DataType);

#[derive(Default)]
struct SchedulerState {
    widgets: Vec<Widget>,
    groups: HashMap<PollKey, PollGroup>,
    confirmed: HashSet<PushKey>,
}

/// Keeps cached values fresh for the current widget list.
///
/// Re-binds automatically when devices connect or disconnect. Dropping the
/// scheduler stops all of its timers.
pub struct ValueScheduler {
    manager: ConnectionManager,
    state: Arc<Mutex<SchedulerState>>,
    listener: JoinHandle<()>,
}

impl ValueScheduler {
    /// Start a scheduler with no widgets
    pub fn new(manager: ConnectionManager) -> Self {
        let state = Arc::new(Mutex::new(SchedulerState::default()));
        // Subscribe before spawning so no lifecycle event can slip past.
        let events = manager.subscribe();
        let listener = tokio::spawn(listen(manager.clone(), events, state.clone()));
        Self {
            manager,
            state,
            listener,
        }
    }

    /// Replace the widget list and reconcile bindings.
    ///
    /// Returns once confirmatory reads for newly bound push characteristics
    /// have completed.
    pub async fn sync(&self, widgets: &[Widget]) {
        let mut state = self.state.lock().await;
        state.widgets = widgets.to_vec();
        reconcile(&self.manager, &mut state).await;
    }

    /// Number of running poll timers
    pub async fn active_polls(&self) -> usize {
        self.state.lock().await.groups.len()
    }

    /// Current value of every widget, `None` while unavailable
    pub async fn widget_values(&self) -> HashMap<WidgetId, Option<f64>> {
        let widgets = self.state.lock().await.widgets.clone();
        let mut values = HashMap::with_capacity(widgets.len());
        for widget in widgets {
            let value = self.manager.value(&widget.device_id, widget.data_type).await;
            values.insert(widget.id, value);
        }
        values
    }
}

impl Drop for ValueScheduler {
    fn drop(&mut self) {
        self.listener.abort();
        if let Ok(mut state) = self.state.try_lock() {
            state.groups.clear();
        }
    }
}

async fn listen(
    manager: ConnectionManager,
    mut events: EventReceiver,
    state: Arc<Mutex<SchedulerState>>,
) {
    loop {
        match events.recv().await {
            Ok(DashboardEvent::Connected { .. } | DashboardEvent::Disconnected { .. }) => {}
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                debug!("Scheduler missed {skipped} event(s), reconciling");
            }
            Err(RecvError::Closed) => break,
        }
        let mut state = state.lock().await;
        reconcile(&manager, &mut state).await;
    }
}

/// Bring running timers in line with widgets and connected devices
async fn reconcile(manager: &ConnectionManager, state: &mut SchedulerState) {
    let mut wanted: HashMap<PollKey, BTreeMap<DataType, CharacteristicHandle>> = HashMap::new();
    let mut live_push = HashSet::new();
    let mut confirm = Vec::new();

    for widget in &state.widgets {
        let Some(device) = manager.device(&widget.device_id).await else {
            continue;
        };
        if !device.connected {
            continue;
        }
        let Some(handle) = device.characteristics.get(&widget.data_type) else {
            debug!(
                "{} has no {} for \"{}\"",
                device.display_name(),
                widget.data_type,
                widget.title
            );
            continue;
        };

        if handle.subscribed {
            let key = (device.id.clone(), handle.epoch, handle.data_type);
            if live_push.insert(key.clone()) && !state.confirmed.contains(&key) {
                confirm.push((device.id.clone(), handle.clone()));
            }
        } else {
            let key = PollKey {
                device: device.id.clone(),
                epoch: handle.epoch,
                interval: manager.config().refresh_interval(widget.refresh_rate_ms),
            };
            wanted
                .entry(key)
                .or_default()
                .insert(handle.data_type, handle.clone());
        }
    }

    state.groups.retain(|key, group| {
        let keep = wanted
            .get(key)
            .is_some_and(|handles| handles.keys().eq(group.data_types.iter()));
        if !keep {
            debug!("Stopping {:?} poll for {}", key.interval, key.device);
        }
        keep
    });

    for (key, handles) in wanted {
        if state.groups.contains_key(&key) {
            continue;
        }
        let data_types: Vec<DataType> = handles.keys().copied().collect();
        info!(
            "Polling {} characteristic(s) on {} every {:?}",
            data_types.len(),
            key.device,
            key.interval
        );
        let task = tokio::spawn(poll_group(
            manager.clone(),
            key.clone(),
            handles.into_values().collect(),
        ));
        state.groups.insert(key, PollGroup { data_types, task });
    }

    state.confirmed.retain(|key| live_push.contains(key));
    let reads = confirm.iter().map(|(device, handle)| async move {
        match manager.read_handle(device, handle).await {
            Ok(value) => {
                manager
                    .merge_values(device, handle.epoch, &[(handle.data_type, value)])
                    .await;
            }
            Err(DashboardError::StaleHandle) => {}
            Err(e) => manager.report_read_failure(device, handle.data_type, &e),
        }
    });
    join_all(reads).await;
    state.confirmed.extend(
        confirm
            .into_iter()
            .map(|(device, handle)| (device, handle.epoch, handle.data_type)),
    );
}

/// Timer loop of one poll group; ends when its connection epoch does
async fn poll_group(
    manager: ConnectionManager,
    key: PollKey,
    handles: Vec<CharacteristicHandle>,
) {
    let mut ticker = tokio::time::interval(key.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !manager.is_current(&key.device, key.epoch).await {
            break;
        }

        let results = join_all(
            handles
                .iter()
                .map(|handle| manager.read_handle(&key.device, handle)),
        )
        .await;

        if !manager.is_current(&key.device, key.epoch).await {
            break;
        }

        let mut values = Vec::with_capacity(handles.len());
        for (handle, result) in handles.iter().zip(results) {
            match result {
                Ok(value) => values.push((handle.data_type, value)),
                Err(e) => manager.report_read_failure(&key.device, handle.data_type, &e),
            }
        }
        if !values.is_empty() {
            manager.merge_values(&key.device, key.epoch, &values).await;
        }
    }

    debug!("Poll group for {} epoch {} ended", key.device, key.epoch);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characteristics::{BATTERY_SERVICE, ENVIRONMENTAL_SENSING_SERVICE};
    use crate::mock::{MockAdapter, MockPeripheral};
    use crate::types::DashboardConfig;
    use crate::widget::Presentation;
    use tokio::time::{sleep, timeout};

    fn sensor() -> Arc<MockPeripheral> {
        MockPeripheral::builder("d1")
            .name("Greenhouse")
            .compatible(-50)
            .characteristic(
                ENVIRONMENTAL_SENSING_SERVICE,
                DataType::Temperature,
                false,
                2130i16.to_le_bytes().to_vec(),
            )
            .characteristic(
                ENVIRONMENTAL_SENSING_SERVICE,
                DataType::Humidity,
                true,
                4500u16.to_le_bytes().to_vec(),
            )
            .characteristic(BATTERY_SERVICE, DataType::Battery, false, vec![64])
            .build()
    }

    async fn setup(peripheral: &Arc<MockPeripheral>) -> (ConnectionManager, DeviceId) {
        let adapter = Arc::new(MockAdapter::new());
        adapter.queue_device(peripheral.clone()).await;
        let manager = ConnectionManager::new(adapter, DashboardConfig::default());
        let id = manager.scan().await.unwrap();
        manager.connect(&id).await.unwrap();
        (manager, id)
    }

    fn widget(title: &str, id: &DeviceId, data_type: DataType, refresh_ms: u64) -> Widget {
        Widget::new(
            title,
            id.clone(),
            data_type,
            Presentation::Value {},
            &DashboardConfig::default(),
        )
        .unwrap()
        .with_refresh_rate(refresh_ms)
    }

    fn count_updates(events: &mut EventReceiver) -> usize {
        let mut updates = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, DashboardEvent::ValuesUpdated { .. }) {
                updates += 1;
            }
        }
        updates
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_widget_polls_until_disconnect() {
        let peripheral = sensor();
        let (manager, id) = setup(&peripheral).await;
        let scheduler = ValueScheduler::new(manager.clone());
        let mut events = manager.subscribe();

        scheduler
            .sync(&[widget("Air", &id, DataType::Temperature, 100)])
            .await;
        sleep(Duration::from_millis(1050)).await;

        assert!(count_updates(&mut events) >= 10);
        assert_eq!(manager.value(&id, DataType::Temperature).await, Some(21.3));
        assert_eq!(scheduler.active_polls().await, 1);

        manager.disconnect(&id).await.unwrap();
        sleep(Duration::from_millis(10)).await;
        let reads = peripheral.read_count();
        count_updates(&mut events);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(peripheral.read_count(), reads);
        assert_eq!(count_updates(&mut events), 0);
        assert_eq!(scheduler.active_polls().await, 0);
    }

    #[tokio::test]
    async fn test_push_bindings_share_subscription() {
        let peripheral = sensor();
        let (manager, id) = setup(&peripheral).await;
        let scheduler = ValueScheduler::new(manager.clone());
        let first = widget("Humidity", &id, DataType::Humidity, 2000);
        let second = Widget {
            presentation: Presentation::Gauge { range: None },
            ..widget("Humidity gauge", &id, DataType::Humidity, 500)
        };

        scheduler.sync(&[first.clone(), second.clone()]).await;
        assert_eq!(peripheral.read_count(), 1);
        assert_eq!(peripheral.subscribe_count(), 1);
        assert_eq!(scheduler.active_polls().await, 0);
        assert_eq!(manager.value(&id, DataType::Humidity).await, Some(45.0));

        let mut events = manager.subscribe();
        assert!(peripheral.push(DataType::Humidity.uuid(), 6010u16.to_le_bytes().to_vec()).await);
        timeout(Duration::from_secs(2), async {
            while !matches!(events.recv().await, Ok(DashboardEvent::ValuesUpdated { .. })) {}
        })
        .await
        .unwrap();

        let values = scheduler.widget_values().await;
        assert_eq!(values[&first.id], Some(60.1));
        assert_eq!(values[&second.id], Some(60.1));

        scheduler.sync(&[first, second]).await;
        assert_eq!(peripheral.read_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_read_keeps_previous_value() {
        let peripheral = sensor();
        let (manager, id) = setup(&peripheral).await;
        let scheduler = ValueScheduler::new(manager.clone());

        scheduler
            .sync(&[widget("Air", &id, DataType::Temperature, 200)])
            .await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.value(&id, DataType::Temperature).await, Some(21.3));

        let mut events = manager.subscribe();
        peripheral.set_read_failure(DataType::Temperature.uuid(), true).await;
        sleep(Duration::from_millis(450)).await;

        assert_eq!(manager.value(&id, DataType::Temperature).await, Some(21.3));
        let failures = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| e.title() == "Read Failed")
            .count();
        assert!(failures >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_interval_reads_are_grouped() {
        let peripheral = sensor();
        let (manager, id) = setup(&peripheral).await;
        let scheduler = ValueScheduler::new(manager.clone());
        let mut events = manager.subscribe();

        scheduler
            .sync(&[
                widget("Air", &id, DataType::Temperature, 1000),
                widget("Cell", &id, DataType::Battery, 1000),
            ])
            .await;
        sleep(Duration::from_millis(50)).await;

        assert_eq!(scheduler.active_polls().await, 1);
        assert_eq!(peripheral.read_count(), 2);
        let merged = events.try_recv().unwrap();
        assert_eq!(
            merged,
            DashboardEvent::ValuesUpdated {
                device: id.clone(),
                data_types: vec![DataType::Temperature, DataType::Battery],
            }
        );
        assert_eq!(manager.value(&id, DataType::Battery).await, Some(64.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_removing_widget_stops_polling() {
        let peripheral = sensor();
        let (manager, id) = setup(&peripheral).await;
        let scheduler = ValueScheduler::new(manager.clone());

        scheduler
            .sync(&[widget("Air", &id, DataType::Temperature, 100)])
            .await;
        sleep(Duration::from_millis(250)).await;
        scheduler.sync(&[]).await;
        let reads = peripheral.read_count();

        sleep(Duration::from_secs(1)).await;
        assert_eq!(scheduler.active_polls().await, 0);
        assert_eq!(peripheral.read_count(), reads);
        assert!(scheduler.widget_values().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebinds_on_reconnect() {
        let peripheral = sensor();
        let (manager, id) = setup(&peripheral).await;
        manager.disconnect(&id).await.unwrap();
        let scheduler = ValueScheduler::new(manager.clone());

        scheduler
            .sync(&[widget("Air", &id, DataType::Temperature, 500)])
            .await;
        assert_eq!(scheduler.active_polls().await, 0);
        assert_eq!(scheduler.widget_values().await.into_values().next(), Some(None));

        manager.connect(&id).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.active_polls().await, 1);
        assert_eq!(manager.value(&id, DataType::Temperature).await, Some(21.3));

        peripheral.simulate_link_loss().await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.active_polls().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_binds_device_connected_right_after_start() {
        let peripheral = sensor();
        let (manager, id) = setup(&peripheral).await;
        manager.disconnect(&id).await.unwrap();

        let scheduler = ValueScheduler::new(manager.clone());
        scheduler
            .sync(&[
                widget("Air", &id, DataType::Temperature, 500),
                widget("Humidity", &id, DataType::Humidity, 500),
            ])
            .await;
        manager.connect(&id).await.unwrap();
        sleep(Duration::from_millis(500)).await;

        assert_eq!(scheduler.active_polls().await, 1);
        assert_eq!(manager.value(&id, DataType::Temperature).await, Some(21.3));
        assert_eq!(manager.value(&id, DataType::Humidity).await, Some(45.0));
    }

    #[tokio::test]
    async fn test_unknown_binding_is_skipped() {
        let peripheral = sensor();
        let (manager, id) = setup(&peripheral).await;
        let scheduler = ValueScheduler::new(manager.clone());

        scheduler
            .sync(&[
                widget("Pulse", &id, DataType::HeartRate, 1000),
                widget("Elsewhere", &DeviceId::new("ghost"), DataType::Battery, 1000),
            ])
            .await;

        assert_eq!(scheduler.active_polls().await, 0);
        assert_eq!(peripheral.read_count(), 0);
        assert!(scheduler.widget_values().await.values().all(Option::is_none));
    }
}
