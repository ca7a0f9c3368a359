//! tbmon Core - Configuration, device model, and sensor traits
//!
//! This crate provides the foundational types shared by every tbmon crate:
//!
//! - **Config**: TOML configuration discovery, parsing, and validation
//! - **Device**: Per-device descriptors (settings, attributes, telemetry source)
//! - **Reading**: Timestamped telemetry values produced by sensors
//! - **Outcome**: The result of one delivery attempt for a device
//! - **Source**: The `SensorReader` trait implemented by every sensor kind

pub mod config;
pub mod device;
pub mod outcome;
pub mod reading;
pub mod source;

// Re-export commonly used types
pub use config::{
    AgentConfig, ConfigError, ConfigLoader, ConfigResult, LoadedConfig, RejectedDevice,
    TemperatureUnit,
};
pub use device::{AttributeSet, DeviceConfig, DeviceSettings, TelemetrySource};
pub use outcome::{DeliveryOutcome, FailureReason, SkipReason, TickReport};
pub use reading::Reading;
pub use source::{SensorReader, SourceError, SourceResult};

/// Agent version
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
