use crate::config::FareConfig;
use crate::metrics;
use crate::weather::{WeatherLookup, WeatherReading};
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use courier_types::{FareQuote, GeoPoint};
use std::sync::Arc;
use std::time::Duration;

const EARTH_RADIUS_KM: f64 = 6371.0;
/// The night window runs from the configured start hour up to (not including) this hour.
const NIGHT_END_HOUR: u32 = 6;

/// Great-circle distance in kilometres using the haversine formula.
pub fn haversine_km(from: GeoPoint, to: GeoPoint) -> f64 {
    let d_lat = (to.lat - from.lat).to_radians();
    let d_lon = (to.lon - from.lon).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + from.lat.to_radians().cos() * to.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Rounds half away from zero to 2 decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Hour of day on the configured local clock.
pub fn local_hour(config: &FareConfig, now: DateTime<Utc>) -> u32 {
    (now + ChronoDuration::minutes(i64::from(config.utc_offset_minutes))).hour()
}

/// Flat surcharge when `hour` falls in `[night_start_hour, 24) ∪ [0, 6)`.
pub fn night_surcharge(config: &FareConfig, hour: u32) -> f64 {
    if hour >= config.night_start_hour || hour < NIGHT_END_HOUR {
        config.night_surcharge
    } else {
        0.0
    }
}

/// Turns two points and an instant into a fare.
///
/// The engine holds no mutable state; a single instance is shared by every
/// concurrent quote. The weather lookup is optional and any failure or
/// timeout from it degrades to [`WeatherReading::neutral`].
pub struct FareEngine {
    config: FareConfig,
    weather: Option<Arc<dyn WeatherLookup>>,
    weather_timeout: Duration,
}

impl FareEngine {
    pub fn new(
        config: FareConfig,
        weather: Option<Arc<dyn WeatherLookup>>,
        weather_timeout: Duration,
    ) -> Self {
        Self {
            config,
            weather,
            weather_timeout,
        }
    }

    pub fn config(&self) -> &FareConfig {
        &self.config
    }

    pub async fn quote(&self, origin: GeoPoint, destination: GeoPoint, now: DateTime<Utc>) -> FareQuote {
        let reading = self.weather_reading(origin).await;
        let quote = self.price(haversine_km(origin, destination), reading, now);
        metrics::record_quote(quote.total_fare);
        tracing::debug!(
            "Quoted {} -> {}: distance={}km base={} weather={}x({}) night={} total={}",
            origin,
            destination,
            quote.distance_km,
            quote.base_fare,
            quote.weather_multiplier,
            quote.weather_condition,
            quote.night_surcharge,
            quote.total_fare
        );
        quote
    }

    /// The deterministic part of quoting, given a raw distance and a reading.
    pub fn price(&self, distance_km: f64, reading: WeatherReading, now: DateTime<Utc>) -> FareQuote {
        let distance_km = round2(distance_km);
        let base_fare = distance_km * self.config.per_km_rate;
        let night = night_surcharge(&self.config, local_hour(&self.config, now));

        let total = (base_fare * reading.multiplier + night).max(self.config.minimum_fare);

        FareQuote {
            distance_km,
            base_fare: round2(base_fare),
            weather_multiplier: reading.multiplier,
            weather_condition: reading.condition,
            night_surcharge: night,
            total_fare: round2(total),
            computed_at: now,
        }
    }

    async fn weather_reading(&self, origin: GeoPoint) -> WeatherReading {
        let Some(lookup) = self.weather.as_ref() else {
            metrics::record_weather_fallback("unconfigured");
            return WeatherReading::neutral();
        };

        match tokio::time::timeout(self.weather_timeout, lookup.multiplier(origin)).await {
            Ok(Ok(reading)) => reading,
            Ok(Err(e)) => {
                tracing::warn!("Weather lookup for {} failed: {}. Using neutral multiplier.", origin, e);
                metrics::record_weather_fallback("error");
                WeatherReading::neutral()
            }
            Err(_) => {
                tracing::warn!(
                    "Weather lookup for {} timed out after {:?}. Using neutral multiplier.",
                    origin,
                    self.weather_timeout
                );
                metrics::record_weather_fallback("timeout");
                WeatherReading::neutral()
            }
        }
    }
}
