//! Per-device configuration
//!
//! A device is one logical telemetry destination on the server, identified by
//! its access key. Every device carries its own delivery policy flags, a set of
//! static attributes, and exactly one telemetry source.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Static device metadata published as server-side attributes
pub type AttributeSet = BTreeMap<String, Value>;

/// Number of hex characters kept from the key digest
const IDENTITY_LEN: usize = 12;

/// Immutable descriptor for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device access key (also the auth credential)
    pub authkey: String,

    /// Free-form notes, never read by processing logic
    #[serde(default)]
    pub notes: BTreeMap<String, Value>,

    /// Delivery policy
    #[serde(default)]
    pub settings: DeviceSettings,

    /// Attributes published as-is
    #[serde(default, alias = "attr")]
    pub attributes: AttributeSet,

    /// Telemetry source
    #[serde(alias = "tele")]
    pub telemetry: TelemetrySource,
}

impl DeviceConfig {
    /// Stable, non-secret fingerprint of the access key.
    ///
    /// Used as the cache key and in log lines so the key itself never lands
    /// on disk outside the config file.
    pub fn identity(&self) -> String {
        let digest = Sha256::digest(self.authkey.as_bytes());
        let mut id = hex::encode(digest);
        id.truncate(IDENTITY_LEN);
        id
    }

    /// Check the fields every device needs regardless of sensor kind
    pub fn validate(&self) -> Result<(), String> {
        if self.authkey.trim().is_empty() {
            return Err("authkey is empty".to_string());
        }
        if self.authkey.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err("authkey contains whitespace or '/'".to_string());
        }
        if self.telemetry.kind.trim().is_empty() {
            return Err("telemetry kind is empty".to_string());
        }
        Ok(())
    }
}

/// Delivery policy flags for a device.
///
/// Each flag accepts `true`/`false` or `0`/`1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Process this device at all
    #[serde(deserialize_with = "flag")]
    pub active: bool,

    /// Also collect and publish host metrics under this device
    #[serde(alias = "collect_host_metrics", deserialize_with = "flag")]
    pub sys_info: bool,

    /// Cache readings when a publish fails with a retryable error
    #[serde(alias = "cache_on_err", deserialize_with = "flag")]
    pub cache_on_error: bool,

    /// Flush every pending cache entry on each tick, even when local-only
    #[serde(alias = "force_cache_flush", deserialize_with = "flag")]
    pub clearcache: bool,

    /// Never publish fresh readings, only cache them
    #[serde(alias = "localonly", deserialize_with = "flag")]
    pub local_only: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            active: true,
            sys_info: false,
            cache_on_error: false,
            clearcache: false,
            local_only: false,
        }
    }
}

/// Where the telemetry for a device comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySource {
    /// Sensor kind tag (e.g. `ds18b20`, `owm`, `host`)
    #[serde(alias = "type")]
    pub kind: String,

    /// Kind-specific target: a sensor file, a ZIP code, ...
    #[serde(default, alias = "device")]
    pub target: String,

    /// Suffix used to name the produced telemetry keys
    #[serde(default)]
    pub label: String,
}

fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => Ok(value),
        Flag::Int(0) => Ok(false),
        Flag::Int(1) => Ok(true),
        Flag::Int(other) => Err(de::Error::custom(format!(
            "expected a boolean or 0/1, got {}",
            other
        ))),
    }
}
