//! Dashboard widgets.
//!
//! A widget binds one characteristic of one device to a presentation. The
//! presentation kind is a tagged enum so each kind only carries the
//! settings it uses; the JSON form is
//!
//! ```json
//! {
//!   "id": "widget-…",
//!   "title": "Living room",
//!   "deviceId": "AA:BB:CC:DD:EE:FF",
//!   "dataType": "temperature",
//!   "type": "gauge",
//!   "settings": { "range": { "min": -10.0, "max": 50.0 } },
//!   "refreshRate": 2000
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::characteristics::DataType;
use crate::error::{DashboardError, Result};
use crate::types::{DashboardConfig, DeviceId};

/// Minimum trimmed title length
pub const MIN_TITLE_LEN: usize = 2;

/// Unique widget identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WidgetId(String);

impl WidgetId {
    /// Generate a fresh id
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("widget-{}", Uuid::new_v4()))
    }

    /// Borrow the id string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WidgetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WidgetId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Closed interval used for gauge normalization
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    /// Lower bound
    pub min: f64,
    /// Upper bound
    pub max: f64,
}

impl ValueRange {
    /// Create a range
    #[must_use]
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Default gauge range for a characteristic
    #[must_use]
    pub const fn default_for(data_type: DataType) -> Self {
        match data_type {
            DataType::Temperature => Self::new(-10.0, 50.0),
            DataType::Humidity
            | DataType::Battery
            | DataType::HealthTemperature
            | DataType::HeartRate => Self::new(0.0, 100.0),
        }
    }

    /// Clamp into the range and scale to 0–100
    #[must_use]
    pub fn normalize(&self, value: f64) -> f64 {
        let span = self.max - self.min;
        if span <= 0.0 || value.is_nan() {
            return 0.0;
        }
        (value.clamp(self.min, self.max) - self.min) / span * 100.0
    }

    fn validate(&self) -> Result<()> {
        if self.min.is_finite() && self.max.is_finite() && self.min < self.max {
            Ok(())
        } else {
            Err(DashboardError::InvalidParameters(format!(
                "Range minimum {} must be below maximum {}",
                self.min, self.max
            )))
        }
    }
}

/// Graph line styling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineStyle {
    /// CSS color string
    pub color: String,
    /// Stroke width in pixels
    pub width: f64,
    /// Draw a smoothed curve rather than straight segments
    pub smooth: bool,
}

impl Default for LineStyle {
    fn default() -> Self {
        Self {
            color: "#3b82f6".to_string(),
            width: 2.0,
            smooth: true,
        }
    }
}

/// How a widget is drawn, with the settings that kind uses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "settings", rename_all = "snake_case")]
pub enum Presentation {
    /// Plain number with unit
    Value {},
    /// Needle or arc over a range
    Gauge {
        /// Explicit range; the characteristic's default when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        range: Option<ValueRange>,
    },
    /// Line chart of recent values
    Graph {
        /// Number of samples kept
        history: u32,
        /// Line styling
        #[serde(default)]
        line: LineStyle,
    },
}

impl Presentation {
    /// Kind name as stored
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Value {} => "value",
            Self::Gauge { .. } => "gauge",
            Self::Graph { .. } => "graph",
        }
    }
}

/// A user-defined binding of a device characteristic to a presentation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Widget {
    /// Unique id
    pub id: WidgetId,
    /// User title
    pub title: String,
    /// Bound device
    pub device_id: DeviceId,
    /// Bound characteristic
    pub data_type: DataType,
    /// Presentation kind and settings
    #[serde(flatten)]
    pub presentation: Presentation,
    /// Polling interval for characteristics without push support
    #[serde(rename = "refreshRate", default = "default_refresh_rate")]
    pub refresh_rate_ms: u64,
}

fn default_refresh_rate() -> u64 {
    DashboardConfig::default().default_refresh_ms
}

impl Widget {
    /// Create a widget with a fresh id and the default refresh interval.
    ///
    /// # Errors
    ///
    /// Returns [`DashboardError::InvalidParameters`] if the widget fails
    /// [`Widget::validate`].
    pub fn new(
        title: &str,
        device_id: DeviceId,
        data_type: DataType,
        presentation: Presentation,
        config: &DashboardConfig,
    ) -> Result<Self> {
        let widget = Self {
            id: WidgetId::generate(),
            title: title.trim().to_string(),
            device_id,
            data_type,
            presentation,
            refresh_rate_ms: config.default_refresh_ms,
        };
        widget.validate(config)?;
        Ok(widget)
    }

    /// Builder-style refresh interval override
    #[must_use]
    pub fn with_refresh_rate(mut self, refresh_rate_ms: u64) -> Self {
        self.refresh_rate_ms = refresh_rate_ms;
        self
    }

    /// Check title, refresh interval and presentation settings
    ///
    /// # Errors
    ///
    /// Returns [`DashboardError::InvalidParameters`] naming the first
    /// violated constraint.
    pub fn validate(&self, config: &DashboardConfig) -> Result<()> {
        if self.title.trim().chars().count() < MIN_TITLE_LEN {
            return Err(DashboardError::InvalidParameters(format!(
                "Title must be at least {MIN_TITLE_LEN} characters"
            )));
        }
        if self.refresh_rate_ms < config.min_refresh_ms {
            return Err(DashboardError::InvalidParameters(format!(
                "Refresh rate {}ms is below the {}ms minimum",
                self.refresh_rate_ms, config.min_refresh_ms
            )));
        }
        match &self.presentation {
            Presentation::Value {} => Ok(()),
            Presentation::Gauge { range } => range.as_ref().map_or(Ok(()), ValueRange::validate),
            Presentation::Graph { history, .. } => {
                if *history == 0 {
                    Err(DashboardError::InvalidParameters(
                        "Graph history must be at least 1".to_string(),
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Gauge range in effect for this widget
    #[must_use]
    pub fn range(&self) -> ValueRange {
        match &self.presentation {
            Presentation::Gauge { range: Some(range) } => *range,
            _ => ValueRange::default_for(self.data_type),
        }
    }

    /// Value scaled to 0–100 within [`Widget::range`]
    #[must_use]
    pub fn normalize(&self, value: f64) -> f64 {
        self.range().normalize(value)
    }

    /// One decimal plus unit, or `--` without a value
    #[must_use]
    pub fn format_value(&self, value: Option<f64>) -> String {
        match value {
            Some(value) if !value.is_nan() => format!("{value:.1}{}", self.data_type.unit()),
            _ => "--".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn widget(presentation: Presentation) -> Widget {
        Widget::new(
            "Living room",
            DeviceId::new("d1"),
            DataType::Temperature,
            presentation,
            &DashboardConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_json_shape() {
        let mut gauge = widget(Presentation::Gauge {
            range: Some(ValueRange::new(0.0, 40.0)),
        });
        gauge.id = WidgetId::from("widget-1");

        let value = serde_json::to_value(&gauge).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "widget-1",
                "title": "Living room",
                "deviceId": "d1",
                "dataType": "temperature",
                "type": "gauge",
                "settings": { "range": { "min": 0.0, "max": 40.0 } },
                "refreshRate": 2000
            })
        );
        let parsed: Widget = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, gauge);
    }

    #[test]
    fn test_graph_settings_default_line() {
        let parsed: Widget = serde_json::from_value(json!({
            "id": "widget-2",
            "title": "Pulse",
            "deviceId": "d2",
            "dataType": "heart_rate",
            "type": "graph",
            "settings": { "history": 30 },
            "refreshRate": 500
        }))
        .unwrap();

        assert_eq!(
            parsed.presentation,
            Presentation::Graph {
                history: 30,
                line: LineStyle::default()
            }
        );
        assert_eq!(parsed.presentation.kind(), "graph");
    }

    #[test]
    fn test_validation() {
        let config = DashboardConfig::default();
        let base = widget(Presentation::Value {});
        assert!(base.validate(&config).is_ok());
        assert!(base.id.as_str().starts_with("widget-"));

        let short = Widget {
            title: " a ".to_string(),
            ..base.clone()
        };
        assert!(short.validate(&config).is_err());

        assert!(base.clone().with_refresh_rate(50).validate(&config).is_err());
        assert!(base.clone().with_refresh_rate(100).validate(&config).is_ok());

        let empty_graph = Widget {
            presentation: Presentation::Graph {
                history: 0,
                line: LineStyle::default(),
            },
            ..base.clone()
        };
        assert!(empty_graph.validate(&config).is_err());

        let inverted = Widget {
            presentation: Presentation::Gauge {
                range: Some(ValueRange::new(10.0, 10.0)),
            },
            ..base
        };
        assert!(inverted.validate(&config).is_err());
    }

    #[test]
    fn test_gauge_normalization() {
        let gauge = widget(Presentation::Gauge { range: None });
        assert_eq!(gauge.range(), ValueRange::new(-10.0, 50.0));
        assert!((gauge.normalize(20.0) - 50.0).abs() < f64::EPSILON);
        assert!((gauge.normalize(-40.0)).abs() < f64::EPSILON);
        assert!((gauge.normalize(80.0) - 100.0).abs() < f64::EPSILON);
        assert!((gauge.normalize(f64::NAN)).abs() < f64::EPSILON);

        let battery = ValueRange::default_for(DataType::Battery);
        assert!((battery.normalize(87.0) - 87.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_format_value() {
        let value = widget(Presentation::Value {});
        assert_eq!(value.format_value(Some(21.34)), "21.3°C");
        assert_eq!(value.format_value(None), "--");
        assert_eq!(value.format_value(Some(f64::NAN)), "--");
    }
}
