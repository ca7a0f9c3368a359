//! Configuration system for tbmon
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Global validation that aborts startup
//! - Per-device validation that only rejects the offending device

use crate::device::DeviceConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Device #{index} rejected: {reason}")]
    DeviceError { index: usize, reason: String },
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Agent-wide configuration, frozen after load
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Scheduling and logging
    pub agent: AgentSettings,

    /// Server connection
    pub connection: ConnectionSettings,

    /// Cache and log locations
    pub storage: StorageSettings,

    /// Sensor-kind specific settings
    pub sources: SourceSettings,
}

/// Scheduling and logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,

    /// Seconds between ticks; 0 runs a single tick and exits
    pub interval_secs: u64,

    /// Upper bound for a single sensor read in milliseconds
    pub read_timeout_ms: u64,

    /// Maximum cached entries replayed per device per tick
    pub max_replay_per_tick: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            interval_secs: 0,
            read_timeout_ms: 10_000,
            max_replay_per_tick: 100,
        }
    }
}

impl AgentSettings {
    /// Get tick interval as Duration, `None` for single-shot runs
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }

    /// Get sensor read timeout as Duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Transport used to reach the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMethod {
    #[default]
    Http,
    Mqtt,
}

/// Server connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Server base URL (scheme optional, `http://` assumed)
    pub server: String,

    /// Transport method
    pub method: TransportMethod,

    /// Request timeout in milliseconds
    pub timeout_ms: u64,

    /// Outbound proxy
    pub proxy: ProxySettings,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            server: "http://localhost:8080".to_string(),
            method: TransportMethod::Http,
            timeout_ms: 10_000,
            proxy: ProxySettings::default(),
        }
    }
}

impl ConnectionSettings {
    /// Get request timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Outbound proxy settings. The URLs are ignored unless `enabled` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub enabled: bool,

    /// Proxy for plain HTTP requests
    pub http: Option<String>,

    /// Proxy for HTTPS requests
    pub https: Option<String>,
}

/// Cache and log locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory holding the cache database
    pub cache_dir: PathBuf,

    /// Directory holding date-stamped log files
    pub log_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("cache"),
            log_dir: PathBuf::from("logs"),
        }
    }
}

/// Temperature unit for sensor and weather readings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureUnit {
    #[default]
    #[serde(alias = "f")]
    Fahrenheit,
    #[serde(alias = "c")]
    Celsius,
}

impl TemperatureUnit {
    /// Convert a Celsius value into this unit
    pub fn from_celsius(self, celsius: f64) -> f64 {
        match self {
            TemperatureUnit::Fahrenheit => celsius * 9.0 / 5.0 + 32.0,
            TemperatureUnit::Celsius => celsius,
        }
    }
}

/// Sensor-kind specific settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// Unit for temperature values
    pub temperature_unit: TemperatureUnit,

    /// OpenWeatherMap settings
    pub owm: OwmSettings,
}

/// OpenWeatherMap settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OwmSettings {
    /// API key
    pub api_key: Option<String>,

    /// Current-weather endpoint
    pub url: String,
}

impl Default for OwmSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            url: "http://api.openweathermap.org/data/2.5/weather".to_string(),
        }
    }
}

/// On-disk layout: agent sections plus a raw device list, so one bad device
/// cannot fail the whole file
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(flatten)]
    agent: AgentConfig,

    #[serde(default)]
    devices: Vec<toml::Value>,
}

/// A loaded configuration: the frozen agent config, the devices that passed
/// validation, and the ones that did not
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub agent: AgentConfig,
    pub devices: Vec<DeviceConfig>,
    pub rejected: Vec<RejectedDevice>,

    /// Position of each accepted device in the `[[devices]]` list
    positions: Vec<usize>,
}

/// A device entry that failed validation
#[derive(Debug, Clone)]
pub struct RejectedDevice {
    /// Position in the `[[devices]]` list
    pub index: usize,
    pub reason: String,
}

impl RejectedDevice {
    pub fn to_error(&self) -> ConfigError {
        ConfigError::DeviceError {
            index: self.index,
            reason: self.reason.clone(),
        }
    }
}

impl LoadedConfig {
    /// Reject a device after load, e.g. for an unknown sensor kind
    pub fn reject_where<F>(&mut self, mut check: F)
    where
        F: FnMut(&DeviceConfig) -> Result<(), String>,
    {
        let devices = std::mem::take(&mut self.devices);
        let positions = std::mem::take(&mut self.positions);

        for (device, index) in devices.into_iter().zip(positions) {
            match check(&device) {
                Ok(()) => {
                    self.devices.push(device);
                    self.positions.push(index);
                }
                Err(reason) => {
                    warn!("Device #{} ({}) rejected: {}", index, device.identity(), reason);
                    self.rejected.push(RejectedDevice { index, reason });
                }
            }
        }
        self.rejected.sort_by_key(|r| r.index);
    }

    pub fn has_rejections(&self) -> bool {
        !self.rejected.is_empty()
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. TBMON_CONFIG environment variable
    /// 3. ~/.config/tbmon/config.toml
    /// 4. /etc/tbmon/config.toml
    pub fn load(&self) -> ConfigResult<LoadedConfig> {
        let path = self.find_config_file()?;
        info!("Loading configuration from: {}", path.display());

        let content = std::fs::read_to_string(&path)?;
        Self::parse_with_env(&content, |key| std::env::var(key).ok())
    }

    /// Parse configuration text without environment overrides
    pub fn parse(content: &str) -> ConfigResult<LoadedConfig> {
        Self::parse_with_env(content, |_| None)
    }

    /// Parse configuration text, reading overrides through `env`
    pub fn parse_with_env<F>(content: &str, env: F) -> ConfigResult<LoadedConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file: ConfigFile = toml::from_str(content)?;

        let mut agent = file.agent;
        Self::apply_env_overrides(&mut agent, env);
        Self::validate(&agent)?;

        let (accepted, rejected) = Self::parse_devices(file.devices);
        let (positions, devices): (Vec<_>, Vec<_>) = accepted.into_iter().unzip();
        debug!(
            "Parsed {} device(s), {} rejected",
            devices.len(),
            rejected.len()
        );

        Ok(LoadedConfig {
            agent,
            devices,
            rejected,
            positions,
        })
    }

    /// Find the config file to use
    fn find_config_file(&self) -> ConfigResult<PathBuf> {
        // 1. CLI --config flag
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(ConfigError::NotFound(path.clone()));
        }

        // 2. TBMON_CONFIG environment variable
        if let Ok(env_path) = std::env::var("TBMON_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Ok(path);
            }
            warn!("TBMON_CONFIG path does not exist: {}", env_path);
        }

        // 3. ~/.config/tbmon/config.toml
        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Ok(path);
            }
        }

        // 4. /etc/tbmon/config.toml (Unix only)
        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/tbmon/config.toml");
            if path.exists() {
                return Ok(path);
            }
        }

        Err(ConfigError::NotFound(
            Self::default_config_path().unwrap_or_else(|| PathBuf::from("config.toml")),
        ))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides<F>(config: &mut AgentConfig, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = env("TBMON_LOG_LEVEL") {
            config.agent.log_level = val;
        }
        if let Some(val) = env("TBMON_SERVER") {
            config.connection.server = val;
        }
        if let Some(val) = env("TBMON_CACHE_DIR") {
            config.storage.cache_dir = PathBuf::from(val);
        }
        if let Some(val) = env("TBMON_LOG_DIR") {
            config.storage.log_dir = PathBuf::from(val);
        }
        if let Some(val) = env("TBMON_PROXY_ENABLED") {
            match parse_flag(&val) {
                Some(enabled) => config.connection.proxy.enabled = enabled,
                None => warn!("Ignoring TBMON_PROXY_ENABLED={}: expected 0/1 or true/false", val),
            }
        }
        if let Some(val) = env("TBMON_OWM_API_KEY") {
            config.sources.owm.api_key = Some(val);
        }
    }

    /// Validate agent-wide configuration
    fn validate(config: &AgentConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.agent.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.agent.log_level, valid_levels
            )));
        }

        if config.agent.read_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "agent.read_timeout_ms cannot be 0".to_string(),
            ));
        }

        if config.agent.max_replay_per_tick == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_replay_per_tick cannot be 0".to_string(),
            ));
        }

        if config.connection.method == TransportMethod::Mqtt {
            return Err(ConfigError::ValidationError(
                "MQTT transport is not supported, use method = \"http\"".to_string(),
            ));
        }

        if config.connection.server.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "connection.server cannot be empty".to_string(),
            ));
        }

        if config.connection.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connection.timeout_ms cannot be 0".to_string(),
            ));
        }

        let proxy = &config.connection.proxy;
        if proxy.enabled && proxy.http.is_none() && proxy.https.is_none() {
            return Err(ConfigError::ValidationError(
                "Proxy enabled but neither proxy.http nor proxy.https is set".to_string(),
            ));
        }

        Ok(())
    }

    /// Deserialize and validate each device on its own
    fn parse_devices(raw: Vec<toml::Value>) -> (Vec<(usize, DeviceConfig)>, Vec<RejectedDevice>) {
        let mut devices = Vec::with_capacity(raw.len());
        let mut rejected = Vec::new();
        let mut seen = HashSet::new();

        for (index, value) in raw.into_iter().enumerate() {
            let device: DeviceConfig = match value.try_into() {
                Ok(device) => device,
                Err(e) => {
                    warn!("Device #{} is malformed: {}", index, e);
                    rejected.push(RejectedDevice {
                        index,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if let Err(reason) = device.validate() {
                warn!("Device #{} is invalid: {}", index, reason);
                rejected.push(RejectedDevice { index, reason });
                continue;
            }

            if !seen.insert(device.authkey.clone()) {
                let reason = format!("duplicate authkey (identity {})", device.identity());
                warn!("Device #{} rejected: {}", index, reason);
                rejected.push(RejectedDevice { index, reason });
                continue;
            }

            devices.push((index, device));
        }

        (devices, rejected)
    }

    /// Get the default config file path: `$XDG_CONFIG_HOME/tbmon/config.toml`,
    /// falling back to `~/.config/tbmon/config.toml`
    pub fn default_config_path() -> Option<PathBuf> {
        Self::user_config_path(|key| std::env::var(key).ok())
    }

    fn user_config_path<F>(env: F) -> Option<PathBuf>
    where
        F: Fn(&str) -> Option<String>,
    {
        env("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| env("HOME").map(|home| PathBuf::from(home).join(".config")))
            .map(|dir| dir.join("tbmon").join("config.toml"))
    }

    /// Write a configuration skeleton (used by `tbmon init`)
    pub fn save(config: &AgentConfig, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Boolean environment value, accepting the same 0/1 form as device flags
fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Helper module for platform-specific directories
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
        [agent]
        log_level = "debug"
        interval_secs = 300

        [connection]
        server = "https://demo.thingsboard.io"
        timeout_ms = 5000

        [connection.proxy]
        enabled = false
        http = "http://proxy.local:3128"

        [storage]
        cache_dir = "/var/lib/tbmon/cache"
        log_dir = "/var/log/tbmon"

        [sources]
        temperature_unit = "c"

        [sources.owm]
        api_key = "owm-key"

        [[devices]]
        authkey = "DEVICE_ONE"
        [devices.settings]
        active = 1
        cache_on_err = 1
        [devices.tele]
        type = "ds18b20"
        device = "/sys/bus/w1/devices/28-01/w1_slave"
        label = "office"

        [[devices]]
        authkey = "DEVICE_TWO"
        [devices.telemetry]
        kind = "owm"
        target = "10118"
    "#;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.agent.log_level, "info");
        assert_eq!(config.agent.interval(), None);
        assert_eq!(config.connection.method, TransportMethod::Http);
        assert!(!config.connection.proxy.enabled);
        assert_eq!(config.storage.cache_dir, PathBuf::from("cache"));
        assert_eq!(config.sources.temperature_unit, TemperatureUnit::Fahrenheit);
    }

    #[test]
    fn test_parse_full_toml() {
        let loaded = ConfigLoader::parse(SAMPLE).unwrap();
        assert_eq!(loaded.agent.agent.log_level, "debug");
        assert_eq!(
            loaded.agent.agent.interval(),
            Some(Duration::from_secs(300))
        );
        assert_eq!(loaded.agent.connection.server, "https://demo.thingsboard.io");
        assert_eq!(loaded.agent.connection.timeout(), Duration::from_secs(5));
        assert_eq!(
            loaded.agent.sources.temperature_unit,
            TemperatureUnit::Celsius
        );
        assert_eq!(loaded.agent.sources.owm.api_key.as_deref(), Some("owm-key"));
        assert_eq!(loaded.devices.len(), 2);
        assert!(loaded.devices[0].settings.cache_on_error);
        assert_eq!(loaded.devices[1].telemetry.kind, "owm");
        assert!(!loaded.has_rejections());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let loaded = ConfigLoader::parse(
            r#"
            [agent]
            log_level = "warn"
            "#,
        )
        .unwrap();
        assert_eq!(loaded.agent.agent.log_level, "warn");
        assert!(loaded.devices.is_empty());
        assert_eq!(loaded.agent.connection.timeout_ms, 10_000);
    }

    #[test]
    fn test_malformed_device_only_rejects_that_device() {
        let loaded = ConfigLoader::parse(
            r#"
            [[devices]]
            authkey = "GOOD"
            [devices.telemetry]
            kind = "host"

            [[devices]]
            authkey = "NO_TELEMETRY"

            [[devices]]
            authkey = ""
            [devices.telemetry]
            kind = "host"
            "#,
        )
        .unwrap();

        assert_eq!(loaded.devices.len(), 1);
        assert_eq!(loaded.devices[0].authkey, "GOOD");
        assert_eq!(loaded.rejected.len(), 2);
        assert_eq!(loaded.rejected[0].index, 1);
        assert_eq!(loaded.rejected[1].index, 2);
        assert!(matches!(
            loaded.rejected[0].to_error(),
            ConfigError::DeviceError { index: 1, .. }
        ));
    }

    #[test]
    fn test_duplicate_authkey_rejected() {
        let loaded = ConfigLoader::parse(
            r#"
            [[devices]]
            authkey = "SAME"
            [devices.telemetry]
            kind = "host"

            [[devices]]
            authkey = "SAME"
            [devices.telemetry]
            kind = "owm"
            target = "10118"
            "#,
        )
        .unwrap();

        assert_eq!(loaded.devices.len(), 1);
        assert_eq!(loaded.rejected.len(), 1);
        assert_eq!(loaded.rejected[0].index, 1);
    }

    #[test]
    fn test_reject_where() {
        let mut loaded = ConfigLoader::parse(SAMPLE).unwrap();
        loaded.reject_where(|device| {
            if device.telemetry.kind == "owm" {
                Err("unsupported".to_string())
            } else {
                Ok(())
            }
        });
        assert_eq!(loaded.devices.len(), 1);
        assert_eq!(loaded.rejected.len(), 1);
        assert_eq!(loaded.rejected[0].index, 1);
        assert_eq!(loaded.rejected[0].reason, "unsupported");
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let result = ConfigLoader::parse(
            r#"
            [agent]
            log_level = "loud"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validation_rejects_mqtt() {
        let result = ConfigLoader::parse(
            r#"
            [connection]
            method = "mqtt"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validation_proxy_without_urls() {
        let result = ConfigLoader::parse(
            r#"
            [connection.proxy]
            enabled = true
            "#,
        );
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TBMON_LOG_LEVEL", "trace"),
            ("TBMON_SERVER", "http://tb.internal:8080"),
            ("TBMON_CACHE_DIR", "/tmp/tbmon-cache"),
            ("TBMON_PROXY_ENABLED", "true"),
        ]
        .into_iter()
        .collect();

        let loaded = ConfigLoader::parse_with_env(SAMPLE, |key| {
            env.get(key).map(|v| v.to_string())
        })
        .unwrap();

        assert_eq!(loaded.agent.agent.log_level, "trace");
        assert_eq!(loaded.agent.connection.server, "http://tb.internal:8080");
        assert_eq!(
            loaded.agent.storage.cache_dir,
            PathBuf::from("/tmp/tbmon-cache")
        );
        assert!(loaded.agent.connection.proxy.enabled);
    }

    #[test]
    fn test_env_proxy_flag_accepts_numeric() {
        let enabled = ConfigLoader::parse_with_env(SAMPLE, |key| {
            (key == "TBMON_PROXY_ENABLED").then(|| "1".to_string())
        })
        .unwrap();
        assert!(enabled.agent.connection.proxy.enabled);

        let unparsable = ConfigLoader::parse_with_env(SAMPLE, |key| {
            (key == "TBMON_PROXY_ENABLED").then(|| "maybe".to_string())
        })
        .unwrap();
        assert!(!unparsable.agent.connection.proxy.enabled);
    }

    #[test]
    fn test_user_config_path() {
        let xdg = ConfigLoader::user_config_path(|key| match key {
            "XDG_CONFIG_HOME" => Some("/srv/conf".to_string()),
            "HOME" => Some("/home/pi".to_string()),
            _ => None,
        });
        assert_eq!(xdg, Some(PathBuf::from("/srv/conf/tbmon/config.toml")));

        let home = ConfigLoader::user_config_path(|key| {
            (key == "HOME").then(|| "/home/pi".to_string())
        });
        assert_eq!(home, Some(PathBuf::from("/home/pi/.config/tbmon/config.toml")));

        assert_eq!(ConfigLoader::user_config_path(|_| None), None);
    }

    #[test]
    fn test_missing_cli_path() {
        let loader = ConfigLoader::new().with_cli_path(Some(PathBuf::from(
            "/nonexistent/tbmon/config.toml",
        )));
        assert!(matches!(loader.load(), Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AgentConfig::default();
        config.connection.server = "http://tb.example:9090".to_string();
        ConfigLoader::save(&config, &path).unwrap();

        let loaded = ConfigLoader::new()
            .with_cli_path(Some(path))
            .load()
            .unwrap();
        // Host env may override the server, so only assert on untouched fields
        assert_eq!(loaded.agent.agent.max_replay_per_tick, 100);
        assert!(loaded.devices.is_empty());
    }

    #[test]
    fn test_temperature_conversion() {
        assert_eq!(TemperatureUnit::Celsius.from_celsius(21.5), 21.5);
        assert!((TemperatureUnit::Fahrenheit.from_celsius(100.0) - 212.0).abs() < 1e-9);
    }
}
