//! DS18B20 1-wire temperature sensor
//!
//! The kernel `w1_therm` driver exposes each sensor as a `w1_slave` file:
//!
//! ```text
//! 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
//! 72 01 4b 46 7f ff 0e 10 57 t=23125
//! ```
//!
//! The first line ends in `YES` when the CRC matched; the second carries the
//! temperature in millidegrees Celsius.

use async_trait::async_trait;
use tbmon_core::config::TemperatureUnit;
use tbmon_core::{DeviceConfig, Reading, SensorReader, SourceError, SourceResult};
use tracing::debug;

/// Reader for `w1_slave` sensor files
pub struct Ds18b20Reader {
    unit: TemperatureUnit,
}

impl Ds18b20Reader {
    pub fn new(unit: TemperatureUnit) -> Self {
        Self { unit }
    }

    /// Telemetry key for a device: `temp_<label>`, or `temp` without a label
    fn key(device: &DeviceConfig) -> String {
        let label = device.telemetry.label.trim();
        if label.is_empty() {
            "temp".to_string()
        } else {
            format!("temp_{}", label)
        }
    }
}

/// Extract the temperature in degrees Celsius from `w1_slave` contents
pub fn parse_w1_slave(content: &str) -> SourceResult<f64> {
    let mut lines = content.lines();

    let crc_line = lines
        .next()
        .ok_or_else(|| SourceError::Malformed("empty sensor output".to_string()))?;
    if !crc_line.trim_end().ends_with("YES") {
        return Err(SourceError::Malformed("sensor CRC check failed".to_string()));
    }

    let data_line = lines
        .next()
        .ok_or_else(|| SourceError::Malformed("missing temperature line".to_string()))?;
    let raw = data_line
        .split("t=")
        .nth(1)
        .ok_or_else(|| SourceError::Malformed("missing t= field".to_string()))?;

    let millidegrees: i64 = raw
        .trim()
        .parse()
        .map_err(|_| SourceError::Malformed(format!("invalid temperature value: {}", raw.trim())))?;

    Ok(millidegrees as f64 / 1000.0)
}

#[async_trait]
impl SensorReader for Ds18b20Reader {
    fn kind(&self) -> &'static str {
        "ds18b20"
    }

    fn validate(&self, device: &DeviceConfig) -> SourceResult<()> {
        if device.telemetry.target.trim().is_empty() {
            return Err(SourceError::Config(
                "ds18b20 requires the sensor file path as target".to_string(),
            ));
        }
        Ok(())
    }

    async fn read(&self, device: &DeviceConfig) -> SourceResult<Reading> {
        let path = &device.telemetry.target;
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SourceError::Unavailable(format!("{}: {}", path, e)))?;

        let celsius = parse_w1_slave(&content)?;
        let value = round(self.unit.from_celsius(celsius), 3);
        debug!("ds18b20 {} read {:.3}C", path, celsius);

        Ok(Reading::new().with_value(Self::key(device), value))
    }
}

fn round(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tbmon_core::device::{DeviceSettings, TelemetrySource};

    const GOOD: &str = "72 01 4b 46 7f ff 0e 10 57 : crc=57 YES\n\
                        72 01 4b 46 7f ff 0e 10 57 t=23125\n";

    fn device(target: &str, label: &str) -> DeviceConfig {
        DeviceConfig {
            authkey: "KEY".to_string(),
            notes: Default::default(),
            settings: DeviceSettings::default(),
            attributes: Default::default(),
            telemetry: TelemetrySource {
                kind: "ds18b20".to_string(),
                target: target.to_string(),
                label: label.to_string(),
            },
        }
    }

    #[test]
    fn test_parse_good_output() {
        assert_eq!(parse_w1_slave(GOOD).unwrap(), 23.125);
    }

    #[test]
    fn test_parse_negative_temperature() {
        let content = "ff ff : crc=aa YES\nff ff t=-1250\n";
        assert_eq!(parse_w1_slave(content).unwrap(), -1.25);
    }

    #[test]
    fn test_parse_crc_failure() {
        let content = "72 01 4b : crc=57 NO\n72 01 4b t=23125\n";
        assert!(matches!(
            parse_w1_slave(content),
            Err(SourceError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_w1_slave("").is_err());
        assert!(parse_w1_slave("crc=57 YES\n").is_err());
        assert!(parse_w1_slave("crc=57 YES\nno temperature here\n").is_err());
        assert!(parse_w1_slave("crc=57 YES\nt=abc\n").is_err());
    }

    #[tokio::test]
    async fn test_read_sensor_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(GOOD.as_bytes()).unwrap();
        let path = file.path().to_string_lossy().to_string();

        let reader = Ds18b20Reader::new(TemperatureUnit::Fahrenheit);
        let reading = reader.read(&device(&path, "office")).await.unwrap();
        assert_eq!(reading.get("temp_office").unwrap(), 73.625);

        let reader = Ds18b20Reader::new(TemperatureUnit::Celsius);
        let reading = reader.read(&device(&path, "")).await.unwrap();
        assert_eq!(reading.get("temp").unwrap(), 23.125);
    }

    #[tokio::test]
    async fn test_missing_sensor_is_unavailable() {
        let reader = Ds18b20Reader::new(TemperatureUnit::Celsius);
        let result = reader
            .read(&device("/nonexistent/w1_slave", "office"))
            .await;
        assert!(matches!(result, Err(SourceError::Unavailable(_))));
    }

    #[test]
    fn test_validate_requires_target() {
        let reader = Ds18b20Reader::new(TemperatureUnit::Celsius);
        assert!(reader.validate(&device("", "x")).is_err());
        assert!(reader.validate(&device("/sys/bus/w1/x", "x")).is_ok());
    }
}
