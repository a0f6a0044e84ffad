//! Local persistence for the widget list.
//!
//! Widgets are stored as one JSON array under [`WIDGETS_KEY`] in a
//! string key-value store. Missing or unreadable content loads as an empty
//! list.

use serde_json::{Map, Value};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

use crate::error::{DashboardError, Result};
use crate::types::DashboardConfig;
use crate::widget::{Widget, WidgetId};

/// Storage key of the widget list
pub const WIDGETS_KEY: &str = "bledash.widgets";

/// String blob storage
pub trait KeyValueStore: Send + Sync {
    /// Read a value
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be written.
    fn set(&mut self, key: &str, value: &str) -> Result<()>;

    /// Delete a value
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be written.
    fn remove(&mut self, key: &str) -> Result<()>;
}

/// Volatile store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, String>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Store backed by a JSON object file
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Use the file at `path`; it is created on first write
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_entries(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn write_entries(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_entries()?.remove(key))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        // An unreadable file is replaced rather than blocking every write.
        let mut entries = self.read_entries().unwrap_or_else(|e| {
            warn!("Replacing unreadable store {}: {e}", self.path.display());
            BTreeMap::new()
        });
        entries.insert(key.to_string(), value.to_string());
        self.write_entries(&entries)
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        let mut entries = self.read_entries()?;
        if entries.remove(key).is_some() {
            self.write_entries(&entries)?;
        }
        Ok(())
    }
}

/// Ordered, persisted widget list
#[derive(Debug)]
pub struct WidgetStore<S> {
    store: S,
    widgets: Vec<Widget>,
    config: DashboardConfig,
}

impl<S: KeyValueStore> WidgetStore<S> {
    /// Load the widget list from `store`.
    ///
    /// Missing or malformed content yields an empty list. Entries are
    /// parsed one by one; any entry that does not parse or fails
    /// [`Widget::validate`] is skipped.
    pub fn load(store: S, config: DashboardConfig) -> Self {
        let entries = match store.get(WIDGETS_KEY) {
            Ok(Some(json)) => match serde_json::from_str::<Vec<Value>>(&json) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Ignoring malformed widget list: {e}");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Could not read widget list: {e}");
                Vec::new()
            }
        };

        let mut widgets: Vec<Widget> = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            match parse_widget(entry, &config) {
                Ok(widget) if widgets.iter().any(|w| w.id == widget.id) => {
                    warn!("Skipping duplicate widget {}", widget.id);
                }
                Ok(widget) => widgets.push(widget),
                Err(e) => warn!("Skipping stored widget #{index}: {e}"),
            }
        }
        debug!("Loaded {} widget(s)", widgets.len());

        Self {
            store,
            widgets,
            config,
        }
    }

    /// Widgets in display order
    #[must_use]
    pub fn widgets(&self) -> &[Widget] {
        &self.widgets
    }

    /// Look up a widget
    #[must_use]
    pub fn get(&self, id: &WidgetId) -> Option<&Widget> {
        self.widgets.iter().find(|w| &w.id == id)
    }

    /// Append a widget and persist
    ///
    /// # Errors
    ///
    /// Returns [`DashboardError::InvalidParameters`] for invalid widgets or
    /// duplicate ids, or a storage error if persisting fails.
    pub fn add(&mut self, widget: Widget) -> Result<()> {
        widget.validate(&self.config)?;
        if self.get(&widget.id).is_some() {
            return Err(DashboardError::InvalidParameters(format!(
                "Widget {} already exists",
                widget.id
            )));
        }
        info!("Adding widget \"{}\"", widget.title);
        self.widgets.push(widget);
        self.save()
    }

    /// Replace a widget in place and persist
    ///
    /// # Errors
    ///
    /// Returns [`DashboardError::InvalidParameters`] for invalid or unknown
    /// widgets, or a storage error if persisting fails.
    pub fn update(&mut self, widget: Widget) -> Result<()> {
        widget.validate(&self.config)?;
        let slot = self
            .widgets
            .iter_mut()
            .find(|w| w.id == widget.id)
            .ok_or_else(|| {
                DashboardError::InvalidParameters(format!("Unknown widget {}", widget.id))
            })?;
        *slot = widget;
        self.save()
    }

    /// Remove a widget and persist; `None` if it was not present
    ///
    /// # Errors
    ///
    /// Returns a storage error if persisting fails.
    pub fn remove(&mut self, id: &WidgetId) -> Result<Option<Widget>> {
        let Some(index) = self.widgets.iter().position(|w| &w.id == id) else {
            return Ok(None);
        };
        let removed = self.widgets.remove(index);
        info!("Removed widget \"{}\"", removed.title);
        self.save()?;
        Ok(Some(removed))
    }

    /// Write the current list to the store
    ///
    /// # Errors
    ///
    /// Returns a serialization or storage error.
    pub fn save(&mut self) -> Result<()> {
        let json = serde_json::to_string(&self.widgets)?;
        self.store
            .set(WIDGETS_KEY, &json)
            .map_err(|e| DashboardError::Storage(e.to_string()))
    }

    /// Release the underlying store
    pub fn into_inner(self) -> S {
        self.store
    }
}

/// Parse and validate one stored widget.
///
/// Records without `settings` load as their kind's defaults where the kind
/// has no required settings, and records without `refreshRate` get the
/// configured default.
fn parse_widget(mut entry: Value, config: &DashboardConfig) -> Result<Widget> {
    if let Some(fields) = entry.as_object_mut() {
        let optional_settings = fields
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|kind| kind != "graph");
        if optional_settings && matches!(fields.get("settings"), None | Some(Value::Null)) {
            fields.insert("settings".to_string(), Value::Object(Map::new()));
        }
        fields
            .entry("refreshRate")
            .or_insert_with(|| Value::from(config.default_refresh_ms));
    }
    let widget: Widget = serde_json::from_value(entry)?;
    widget.validate(config)?;
    Ok(widget)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characteristics::DataType;
    use crate::types::DeviceId;
    use crate::widget::{LineStyle, Presentation, ValueRange};

    fn widgets(config: &DashboardConfig) -> Vec<Widget> {
        vec![
            Widget::new(
                "Kitchen",
                DeviceId::new("d1"),
                DataType::Temperature,
                Presentation::Gauge {
                    range: Some(ValueRange::new(0.0, 30.0)),
                },
                config,
            )
            .unwrap(),
            Widget::new(
                "Pulse",
                DeviceId::new("d2"),
                DataType::HeartRate,
                Presentation::Graph {
                    history: 60,
                    line: LineStyle::default(),
                },
                config,
            )
            .unwrap()
            .with_refresh_rate(500),
            Widget::new(
                "Battery",
                DeviceId::new("d1"),
                DataType::Battery,
                Presentation::Value {},
                config,
            )
            .unwrap(),
        ]
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");
        let config = DashboardConfig::default();
        let expected = widgets(&config);

        let mut store = WidgetStore::load(FileStore::new(&path), config.clone());
        for widget in expected.clone() {
            store.add(widget).unwrap();
        }

        let reloaded = WidgetStore::load(FileStore::new(&path), config);
        assert_eq!(reloaded.widgets(), expected.as_slice());
    }

    #[test]
    fn test_malformed_content_loads_empty() {
        let mut memory = MemoryStore::new();
        memory.set(WIDGETS_KEY, "{not json").unwrap();
        let store = WidgetStore::load(memory, DashboardConfig::default());
        assert!(store.widgets().is_empty());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();
        let store = WidgetStore::load(FileStore::new(&path), DashboardConfig::default());
        assert!(store.widgets().is_empty());

        let missing = WidgetStore::load(MemoryStore::new(), DashboardConfig::default());
        assert!(missing.widgets().is_empty());
    }

    #[test]
    fn test_invalid_entries_are_dropped_on_load() {
        let mut memory = MemoryStore::new();
        let blob = serde_json::json!([
            {
                "id": "widget-short", "title": "x", "deviceId": "d1",
                "dataType": "temperature", "type": "value", "settings": {},
                "refreshRate": 2000
            },
            {
                "id": "widget-fast", "title": "Too fast", "deviceId": "d1",
                "dataType": "temperature", "type": "value", "settings": {},
                "refreshRate": 10
            },
            {
                "id": "widget-graph", "title": "Empty graph", "deviceId": "d1",
                "dataType": "heart_rate", "type": "graph", "settings": { "history": 0 },
                "refreshRate": 500
            },
            {
                "id": "widget-range", "title": "Inverted", "deviceId": "d1",
                "dataType": "humidity", "type": "gauge",
                "settings": { "range": { "min": 80.0, "max": 20.0 } },
                "refreshRate": 2000
            },
            {
                "id": "widget-ok", "title": "Kitchen", "deviceId": "d1",
                "dataType": "temperature", "type": "value", "settings": {},
                "refreshRate": 2000
            },
            {
                "id": "widget-ok", "title": "Kitchen again", "deviceId": "d1",
                "dataType": "temperature", "type": "value", "settings": {},
                "refreshRate": 2000
            }
        ]);
        memory.set(WIDGETS_KEY, &blob.to_string()).unwrap();

        let store = WidgetStore::load(memory, DashboardConfig::default());
        let titles: Vec<_> = store.widgets().iter().map(|w| w.title.as_str()).collect();
        assert_eq!(titles, vec!["Kitchen"]);
    }

    #[test]
    fn test_unknown_entry_keeps_the_rest() {
        let mut memory = MemoryStore::new();
        let blob = serde_json::json!([
            {
                "id": "widget-1", "title": "Sugar", "deviceId": "d1",
                "dataType": "glucose", "type": "value", "settings": {},
                "refreshRate": 2000
            },
            {
                "id": "widget-2", "title": "Battery", "deviceId": "d1",
                "dataType": "battery", "type": "gauge", "settings": {},
                "refreshRate": 5000
            },
            "not a widget"
        ]);
        memory.set(WIDGETS_KEY, &blob.to_string()).unwrap();

        let store = WidgetStore::load(memory, DashboardConfig::default());
        assert_eq!(store.widgets().len(), 1);
        assert_eq!(store.widgets()[0].id, WidgetId::from("widget-2"));
        assert_eq!(store.widgets()[0].refresh_rate_ms, 5000);
    }

    #[test]
    fn test_records_without_settings_or_refresh_rate_load() {
        let mut memory = MemoryStore::new();
        let blob = serde_json::json!([
            {
                "id": "widget-1", "title": "Living room", "deviceId": "d1",
                "dataType": "temperature", "type": "gauge"
            },
            {
                "id": "widget-2", "title": "Humidity", "deviceId": "d1",
                "dataType": "humidity", "type": "value", "settings": null
            },
            {
                "id": "widget-3", "title": "Pulse", "deviceId": "d2",
                "dataType": "heart_rate", "type": "graph"
            }
        ]);
        memory.set(WIDGETS_KEY, &blob.to_string()).unwrap();
        let config = DashboardConfig {
            default_refresh_ms: 3_000,
            ..DashboardConfig::default()
        };

        let store = WidgetStore::load(memory, config);
        let loaded = store.widgets();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].presentation, Presentation::Gauge { range: None });
        assert_eq!(loaded[0].refresh_rate_ms, 3_000);
        assert_eq!(loaded[1].presentation, Presentation::Value {});
        assert_eq!(loaded[1].refresh_rate_ms, 3_000);
    }

    #[test]
    fn test_add_update_remove() {
        let config = DashboardConfig::default();
        let mut store = WidgetStore::load(MemoryStore::new(), config.clone());
        let [first, second, _] = <[Widget; 3]>::try_from(widgets(&config)).unwrap();

        store.add(first.clone()).unwrap();
        store.add(second.clone()).unwrap();
        assert!(store.add(first.clone()).is_err());
        assert!(store.add(first.clone().with_refresh_rate(10)).is_err());

        let renamed = Widget {
            title: "Kitchen temp".to_string(),
            ..first.clone()
        };
        store.update(renamed).unwrap();
        assert_eq!(store.get(&first.id).unwrap().title, "Kitchen temp");

        assert_eq!(store.remove(&first.id).unwrap().unwrap().id, first.id);
        assert!(store.remove(&first.id).unwrap().is_none());

        let ids: Vec<_> = store.widgets().iter().map(|w| w.id.clone()).collect();
        assert_eq!(ids, vec![second.id]);

        let memory = store.into_inner();
        let saved: Vec<Widget> =
            serde_json::from_str(&memory.get(WIDGETS_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(saved.len(), 1);
    }

    #[test]
    fn test_file_store_keys_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(dir.path().join("kv.json"));

        store.set("a", "1").unwrap();
        store.set("b", "2").unwrap();
        store.remove("a").unwrap();

        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.get("b").unwrap().as_deref(), Some("2"));
    }
}
