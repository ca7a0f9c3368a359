//! Host metrics
//!
//! Load averages, CPU temperature, uptime, and memory, read straight from
//! procfs/sysfs. Individual metrics that are missing on this platform are
//! skipped; the read only fails when none of them produced a value.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tbmon_core::{DeviceConfig, Reading, SensorReader, SourceError, SourceResult};
use tracing::debug;

/// Host metrics reader
pub struct HostMetricsReader {
    root: PathBuf,
    hostname: String,
}

impl HostMetricsReader {
    pub fn new() -> Self {
        Self::with_root("/")
    }

    /// Read procfs/sysfs below `root` instead of `/`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let hostname = hostname::get()
            .map(|h: std::ffi::OsString| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            root: root.into(),
            hostname,
        }
    }

    async fn read_file(&self, relative: &str) -> Option<String> {
        let path: PathBuf = self.root.join(relative);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Some(content),
            Err(e) => {
                debug!("Host metric {} unavailable: {}", path.display(), e);
                None
            }
        }
    }

    async fn read_loadavg(&self, reading: &mut Reading) -> bool {
        let Some(content) = self.read_file("proc/loadavg").await else {
            return false;
        };
        let loads: Vec<f64> = content
            .split_whitespace()
            .take(3)
            .filter_map(|v| v.parse().ok())
            .collect();
        if loads.len() != 3 {
            return false;
        }
        reading.insert("cpu_load_1m", loads[0]);
        reading.insert("cpu_load_5m", loads[1]);
        reading.insert("cpu_load_15m", loads[2]);
        true
    }

    async fn read_cpu_temp(&self, reading: &mut Reading) -> bool {
        let Some(content) = self
            .read_file("sys/class/thermal/thermal_zone0/temp")
            .await
        else {
            return false;
        };
        match content.trim().parse::<i64>() {
            Ok(millidegrees) => {
                let celsius = (millidegrees as f64 / 100.0).round() / 10.0;
                reading.insert("cpu_temp", celsius);
                true
            }
            Err(_) => false,
        }
    }

    async fn read_uptime(&self, reading: &mut Reading) -> bool {
        let Some(content) = self.read_file("proc/uptime").await else {
            return false;
        };
        match content
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<f64>().ok())
        {
            Some(secs) => {
                reading.insert("uptime_secs", secs.trunc() as u64);
                true
            }
            None => false,
        }
    }

    async fn read_memory(&self, reading: &mut Reading) -> bool {
        let Some(content) = self.read_file("proc/meminfo").await else {
            return false;
        };
        let mut found = false;
        for (field, key) in [
            ("MemTotal:", "mem_total_kb"),
            ("MemAvailable:", "mem_available_kb"),
        ] {
            if let Some(kb) = meminfo_field(&content, field) {
                reading.insert(key, kb);
                found = true;
            }
        }
        found
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for HostMetricsReader {
    fn default() -> Self {
        Self::new()
    }
}

fn meminfo_field(content: &str, field: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.starts_with(field))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

#[async_trait]
impl SensorReader for HostMetricsReader {
    fn kind(&self) -> &'static str {
        "host"
    }

    async fn read(&self, _device: &DeviceConfig) -> SourceResult<Reading> {
        let mut reading = Reading::new();

        let found = [
            self.read_loadavg(&mut reading).await,
            self.read_cpu_temp(&mut reading).await,
            self.read_uptime(&mut reading).await,
            self.read_memory(&mut reading).await,
        ];

        if !found.iter().any(|ok| *ok) {
            return Err(SourceError::Unavailable(format!(
                "no host metrics available under {}",
                self.root.display()
            )));
        }

        reading.insert("hostname", self.hostname.clone());
        Ok(reading)
    }
}
