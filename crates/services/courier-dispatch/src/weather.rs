use crate::config::WeatherConfig;
use anyhow::{anyhow, Result};
use courier_types::{GeoPoint, WeatherCondition};
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Condition ids below this (and from 200 up) are thunderstorm, drizzle,
/// rain or snow in the OpenWeatherMap numbering.
const PRECIPITATION_IDS: std::ops::Range<u32> = 200..700;

/// Multiplier and condition label for a point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherReading {
    pub multiplier: f64,
    pub condition: WeatherCondition,
}

impl WeatherReading {
    /// The reading used whenever the lookup is missing or failing.
    pub fn neutral() -> Self {
        Self {
            multiplier: 1.0,
            condition: WeatherCondition::Unknown,
        }
    }
}

/// Maps an OpenWeatherMap condition id to a reading.
pub fn classify(condition_id: u32, rain_multiplier: f64) -> WeatherReading {
    if PRECIPITATION_IDS.contains(&condition_id) {
        WeatherReading {
            multiplier: rain_multiplier,
            condition: WeatherCondition::Rainy,
        }
    } else {
        WeatherReading {
            multiplier: 1.0,
            condition: WeatherCondition::Normal,
        }
    }
}

/// Weather multiplier capability consumed by the fare engine.
#[async_trait::async_trait]
pub trait WeatherLookup: Send + Sync {
    async fn multiplier(&self, point: GeoPoint) -> Result<WeatherReading>;
}

#[derive(Debug, Deserialize)]
struct CurrentWeather {
    #[serde(default)]
    weather: Vec<WeatherEntry>,
}

#[derive(Debug, Deserialize)]
struct WeatherEntry {
    id: u32,
}

/// Lookup backed by the OpenWeatherMap current-weather endpoint.
pub struct OpenWeatherLookup {
    client: Client,
    base_url: String,
    api_key: String,
    rain_multiplier: f64,
}

impl OpenWeatherLookup {
    pub fn new(config: &WeatherConfig, rain_multiplier: f64) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            rain_multiplier,
        })
    }
}

#[async_trait::async_trait]
impl WeatherLookup for OpenWeatherLookup {
    async fn multiplier(&self, point: GeoPoint) -> Result<WeatherReading> {
        if self.api_key.trim().is_empty() {
            return Ok(WeatherReading::neutral());
        }

        let url = format!("{}/data/2.5/weather", self.base_url.trim_end_matches('/'));
        tracing::debug!("Querying current weather for {} at URL: {}", point, url);

        let resp = self
            .client
            .get(&url)
            .query(&[
                ("lat", point.lat.to_string()),
                ("lon", point.lon.to_string()),
                ("appid", self.api_key.clone()),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_body = resp.text().await.unwrap_or_else(|_| "<failed to read response>".to_string());
            return Err(anyhow!(
                "Weather query for {} failed with HTTP {}: {}",
                point,
                status,
                error_body
            ));
        }

        let current: CurrentWeather = resp.json().await?;
        let id = current
            .weather
            .first()
            .map(|entry| entry.id)
            .ok_or_else(|| anyhow!("Weather response for {} has no condition entry", point))?;

        let reading = classify(id, self.rain_multiplier);
        tracing::debug!("Weather condition {} at {} maps to {:?}", id, point, reading);
        Ok(reading)
    }
}
