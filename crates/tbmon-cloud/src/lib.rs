//! tbmon Cloud - Delivery to the IoT server
//!
//! This crate moves readings from sensors to the server:
//!
//! - **Publisher**: HTTP client for the device telemetry/attribute API
//! - **Cache**: SQLite-backed per-device queue for readings that could not be sent
//! - **Coordinator**: the send-now / cache / replay decision for each device tick

pub mod cache;
pub mod client;
pub mod coordinator;
pub mod error;

pub use cache::{CacheEntry, CacheStore, DeviceQueueStats, EntryId, SqliteCacheStore};
pub use client::{HttpPublisher, Payload, Publisher};
pub use coordinator::{DeliveryCoordinator, DeliveryStats};
pub use error::{CloudError, CloudResult};
