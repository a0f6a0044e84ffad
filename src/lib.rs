#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # bledash 📡
//!
//! Discover, connect to and read BLE sensor peripherals for a live dashboard.
//!
//! The crate scans for devices carrying a manufacturer-data signature,
//! connects to them, discovers the standard GATT characteristics it knows
//! how to decode and keeps a cache of the latest readings. Widgets bind a
//! device characteristic to a presentation; the scheduler keeps their values
//! fresh by subscribing to notifications where the device supports them and
//! polling otherwise.
//!
//! ## Supported Characteristics
//!
//! | Characteristic            | UUID   | Decoding                          |
//! |---------------------------|--------|-----------------------------------|
//! | Temperature               | 0x2A6E | `i16` LE ÷ 100, °C                |
//! | Humidity                  | 0x2A6F | `u16` LE ÷ 100, %                 |
//! | Battery Level             | 0x2A19 | `u8`, %                           |
//! | Temperature Measurement   | 0x2A1C | IEEE-11073 FLOAT, °F converted    |
//! | Heart Rate Measurement    | 0x2A37 | `u8` or `u16` by flag bit 0, bpm  |
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use bledash::{
//!     BtleplugAdapter, ConnectionManager, DashboardConfig, DataType, Presentation,
//!     ValueScheduler, Widget,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DashboardConfig::default();
//!     let adapter = Arc::new(BtleplugAdapter::new().await?);
//!     let manager = ConnectionManager::new(adapter, config.clone());
//!
//!     let id = manager.scan().await?;
//!     manager.connect(&id).await?;
//!
//!     let widget = Widget::new(
//!         "Office",
//!         id,
//!         DataType::Temperature,
//!         Presentation::Value {},
//!         &config,
//!     )?;
//!     let scheduler = ValueScheduler::new(manager.clone());
//!     scheduler.sync(&[widget]).await;
//!     Ok(())
//! }
//! ```

/// `btleplug` implementation of the platform traits
pub mod ble;
/// GATT characteristic identifiers and payload decoding
pub mod characteristics;
/// Manufacturer-data compatibility check
pub mod compat;
/// Error types and handling
pub mod error;
/// User-visible notifications
pub mod events;
/// Connection lifecycle
pub mod manager;
/// In-memory platform for tests and demos
pub mod mock;
/// Platform Bluetooth boundary
pub mod platform;
/// Device registry
pub mod registry;
/// Value polling and push bindings for widgets
pub mod scheduler;
/// Widget list persistence
pub mod store;
/// Type definitions and data structures
pub mod types;
/// Widget model
pub mod widget;

// Re-export the main types for convenient usage
pub use ble::BtleplugAdapter;
pub use characteristics::DataType;
pub use compat::is_compatible;
pub use error::{DashboardError, Result};
pub use events::{DashboardEvent, DisconnectReason, EventReceiver};
pub use manager::ConnectionManager;
pub use registry::DeviceRegistry;
pub use scheduler::ValueScheduler;
pub use store::{FileStore, KeyValueStore, MemoryStore, WidgetStore};
pub use types::{ConnectionState, DashboardConfig, Device, DeviceId};
pub use widget::{LineStyle, Presentation, ValueRange, Widget, WidgetId};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
