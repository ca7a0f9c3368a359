//! tbmon Sources - Sensor readers
//!
//! One `SensorReader` per sensor kind, collected in a `SourceRegistry` that the
//! runner queries by the device's `telemetry.kind` tag.

pub mod ds18b20;
pub mod host;
pub mod weather;

pub use ds18b20::Ds18b20Reader;
pub use host::HostMetricsReader;
pub use weather::OwmReader;

use std::collections::HashMap;
use std::sync::Arc;
use tbmon_core::config::AgentConfig;
use tbmon_core::{DeviceConfig, SensorReader, SourceError, SourceResult};
use tracing::debug;

/// Kind tag of the host metrics reader
pub const HOST_KIND: &str = "host";

/// Lookup table from kind tag to reader
#[derive(Default, Clone)]
pub struct SourceRegistry {
    readers: HashMap<&'static str, Arc<dyn SensorReader>>,
}

impl SourceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in reader, configured from `config`
    pub fn with_defaults(config: &AgentConfig) -> SourceResult<Self> {
        let unit = config.sources.temperature_unit;

        let mut registry = Self::new();
        registry.register(Arc::new(Ds18b20Reader::new(unit)));
        registry.register(Arc::new(OwmReader::new(
            &config.sources.owm,
            unit,
            config.agent.read_timeout(),
        )?));
        registry.register(Arc::new(HostMetricsReader::new()));
        Ok(registry)
    }

    /// Register a reader under its kind tag, replacing any previous one
    pub fn register(&mut self, reader: Arc<dyn SensorReader>) {
        let kind = reader.kind();
        if self.readers.insert(kind, reader).is_some() {
            debug!("Replaced sensor reader for kind {}", kind);
        }
    }

    /// Look up the reader for a kind
    pub fn get(&self, kind: &str) -> Option<Arc<dyn SensorReader>> {
        self.readers.get(kind).cloned()
    }

    /// Reader for a device's telemetry source
    pub fn reader_for(&self, device: &DeviceConfig) -> SourceResult<Arc<dyn SensorReader>> {
        self.get(&device.telemetry.kind)
            .ok_or_else(|| SourceError::UnknownKind(device.telemetry.kind.clone()))
    }

    /// Host metrics reader, if registered
    pub fn host(&self) -> Option<Arc<dyn SensorReader>> {
        self.get(HOST_KIND)
    }

    /// Check that a device's kind is known and its fields suit that reader
    pub fn validate(&self, device: &DeviceConfig) -> SourceResult<()> {
        self.reader_for(device)?.validate(device)
    }

    /// Registered kind tags, sorted
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.readers.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tbmon_core::device::{DeviceSettings, TelemetrySource};

    fn device(kind: &str, target: &str) -> DeviceConfig {
        DeviceConfig {
            authkey: "KEY".to_string(),
            notes: Default::default(),
            settings: DeviceSettings::default(),
            attributes: Default::default(),
            telemetry: TelemetrySource {
                kind: kind.to_string(),
                target: target.to_string(),
                label: String::new(),
            },
        }
    }

    #[test]
    fn test_default_kinds() {
        let registry = SourceRegistry::with_defaults(&AgentConfig::default()).unwrap();
        assert_eq!(registry.kinds(), vec!["ds18b20", "host", "owm"]);
        assert!(registry.host().is_some());
    }

    #[test]
    fn test_unknown_kind() {
        let registry = SourceRegistry::with_defaults(&AgentConfig::default()).unwrap();
        assert!(matches!(
            registry.validate(&device("bme280", "/dev/i2c-1")),
            Err(SourceError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_validate_delegates_to_reader() {
        let registry = SourceRegistry::with_defaults(&AgentConfig::default()).unwrap();
        assert!(registry.validate(&device("ds18b20", "")).is_err());
        assert!(registry.validate(&device("ds18b20", "/sys/x/w1_slave")).is_ok());
        assert!(registry.validate(&device("host", "")).is_ok());
        // No API key configured by default
        assert!(registry.validate(&device("owm", "10118")).is_err());
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(HostMetricsReader::with_root("/a")));
        registry.register(Arc::new(HostMetricsReader::with_root("/b")));
        assert_eq!(registry.kinds(), vec!["host"]);
    }
}
