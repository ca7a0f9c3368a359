//! Sensor reader trait
//!
//! Every sensor kind (sensor file, weather API, host metrics, ...) implements
//! `SensorReader`. Readers are looked up by their kind tag, so adding a kind
//! never touches the delivery logic.

use crate::device::DeviceConfig;
use crate::reading::Reading;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Sensor read errors
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed source data: {0}")]
    Malformed(String),

    #[error("Source read timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unknown sensor kind: {0}")]
    UnknownKind(String),

    #[error("Invalid source configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SourceResult<T> = Result<T, SourceError>;

/// A pluggable producer of readings for one sensor kind
#[async_trait]
pub trait SensorReader: Send + Sync {
    /// Kind tag this reader is registered under
    fn kind(&self) -> &'static str;

    /// Check kind-specific device fields at config load time
    fn validate(&self, device: &DeviceConfig) -> SourceResult<()> {
        let _ = device;
        Ok(())
    }

    /// Produce one reading for the device
    async fn read(&self, device: &DeviceConfig) -> SourceResult<Reading>;
}

/// Run a read bounded by `limit`
pub async fn read_with_timeout(
    reader: &dyn SensorReader,
    device: &DeviceConfig,
    limit: Duration,
) -> SourceResult<Reading> {
    match tokio::time::timeout(limit, reader.read(device)).await {
        Ok(result) => result,
        Err(_) => Err(SourceError::Timeout(limit)),
    }
}
