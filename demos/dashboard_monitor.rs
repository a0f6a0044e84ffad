use bledash::{
    BtleplugAdapter, ConnectionManager, DashboardConfig, DashboardEvent, DataType, FileStore,
    Presentation, Result, ValueScheduler, Widget, WidgetStore,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::time::interval;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    info!("📡 bledash Dashboard Monitor");

    let config = DashboardConfig::default();
    let adapter = Arc::new(BtleplugAdapter::new().await?);
    let manager = ConnectionManager::new(adapter, config.clone());

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if matches!(event, DashboardEvent::ValuesUpdated { .. }) {
                continue;
            }
            if event.is_destructive() {
                warn!("{}: {}", event.title(), event.description());
            } else {
                info!("{}: {}", event.title(), event.description());
            }
        }
    });

    let id = match manager.scan().await {
        Ok(id) => id,
        Err(e) => {
            error!("❌ No compatible device: {e}");
            return Err(e);
        }
    };
    manager.connect(&id).await?;

    // Bind every discovered characteristic unless widgets were saved earlier.
    let path = std::env::var_os("BLEDASH_STORE")
        .map_or_else(|| PathBuf::from("bledash.json"), PathBuf::from);
    let mut store = WidgetStore::load(FileStore::new(path), config.clone());
    if store.widgets().is_empty() {
        let device = manager.device(&id).await;
        let available = device
            .map(|d| d.characteristics.keys().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        for data_type in DataType::ALL.into_iter().filter(|t| available.contains(t)) {
            let widget = Widget::new(
                &data_type.name().replace('_', " "),
                id.clone(),
                data_type,
                Presentation::Gauge { range: None },
                &config,
            )?;
            store.add(widget)?;
        }
    }

    let scheduler = ValueScheduler::new(manager.clone());
    scheduler.sync(store.widgets()).await;

    info!("Press Ctrl+C to stop monitoring");
    let mut ticker = interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        let values = scheduler.widget_values().await;
        println!("\n📊 Dashboard");
        for widget in store.widgets() {
            let value = values.get(&widget.id).copied().flatten();
            let level = value.map_or(0.0, |v| widget.normalize(v));
            println!(
                "  {:<20} {:>10}  {:>5.1}%",
                widget.title,
                widget.format_value(value),
                level
            );
        }
    }

    info!("🔌 Disconnecting...");
    manager.disconnect(&id).await?;
    Ok(())
}
