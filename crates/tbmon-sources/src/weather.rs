//! OpenWeatherMap current conditions
//!
//! The device target is a ZIP code (`10118`, or `10118,us` with an explicit
//! country). Telemetry keys are fixed; the device label is not used.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tbmon_core::config::{OwmSettings, TemperatureUnit};
use tbmon_core::{DeviceConfig, Reading, SensorReader, SourceError, SourceResult};
use tracing::debug;

/// Reader for the OpenWeatherMap current-weather API
pub struct OwmReader {
    client: Client,
    url: String,
    api_key: Option<String>,
    unit: TemperatureUnit,
    timeout: Duration,
}

impl OwmReader {
    /// Create a new reader. Fails only if the HTTP client cannot be built.
    pub fn new(settings: &OwmSettings, unit: TemperatureUnit, timeout: Duration) -> SourceResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("tbmon/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: settings.url.clone(),
            api_key: settings.api_key.clone(),
            unit,
            timeout,
        })
    }

    fn units_param(&self) -> &'static str {
        match self.unit {
            TemperatureUnit::Fahrenheit => "imperial",
            TemperatureUnit::Celsius => "metric",
        }
    }

    fn zip_param(target: &str) -> String {
        let target = target.trim();
        if target.contains(',') {
            target.to_string()
        } else {
            format!("{},us", target)
        }
    }
}

#[derive(Debug, Deserialize)]
struct OwmResponse {
    main: OwmMain,
    #[serde(default)]
    wind: Option<OwmWind>,
    #[serde(default)]
    weather: Vec<OwmCondition>,
    #[serde(default)]
    coord: Option<OwmCoord>,
}

#[derive(Debug, Deserialize)]
struct OwmMain {
    temp: f64,
    humidity: Option<f64>,
    pressure: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwmWind {
    speed: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwmCondition {
    description: String,
}

#[derive(Debug, Deserialize)]
struct OwmCoord {
    lat: f64,
    lon: f64,
}

impl OwmResponse {
    fn into_reading(self) -> Reading {
        let mut reading = Reading::new().with_value("temp", self.main.temp);

        if let Some(humidity) = self.main.humidity {
            reading.insert("humidity", humidity);
        }
        if let Some(pressure) = self.main.pressure {
            reading.insert("pressure", pressure);
        }
        if let Some(speed) = self.wind.and_then(|w| w.speed) {
            reading.insert("wind_speed", speed);
        }
        if let Some(condition) = self.weather.into_iter().next() {
            reading.insert("conditions", condition.description);
        }
        if let Some(coord) = self.coord {
            reading.insert("latitude", coord.lat);
            reading.insert("longitude", coord.lon);
        }

        reading
    }
}

#[async_trait]
impl SensorReader for OwmReader {
    fn kind(&self) -> &'static str {
        "owm"
    }

    fn validate(&self, device: &DeviceConfig) -> SourceResult<()> {
        if self.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            return Err(SourceError::Config(
                "owm requires sources.owm.api_key".to_string(),
            ));
        }
        if device.telemetry.target.trim().is_empty() {
            return Err(SourceError::Config(
                "owm requires a ZIP code as target".to_string(),
            ));
        }
        Ok(())
    }

    async fn read(&self, device: &DeviceConfig) -> SourceResult<Reading> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| SourceError::Config("missing OpenWeatherMap API key".to_string()))?;
        let zip = Self::zip_param(&device.telemetry.target);

        debug!("Fetching OpenWeatherMap conditions for {}", zip);

        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("zip", zip.as_str()),
                ("appid", api_key),
                ("units", self.units_param()),
                ("mode", "json"),
            ])
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Unavailable(format!(
                "OpenWeatherMap returned {}",
                status
            )));
        }

        let body: OwmResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Malformed(format!("OpenWeatherMap response: {}", e)))?;

        Ok(body.into_reading())
    }
}

impl OwmReader {
    fn map_error(&self, e: reqwest::Error) -> SourceError {
        if e.is_timeout() {
            SourceError::Timeout(self.timeout)
        } else {
            SourceError::Unavailable(format!("OpenWeatherMap request failed: {}", e))
        }
    }
}
