use crate::error::DispatchError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Prefix of environment variables that override settings,
/// e.g. `DISPATCH__FARE__PER_KM_RATE=6.5`.
pub const ENV_PREFIX: &str = "DISPATCH";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub fare: FareConfig,
    pub chain: ChainConfig,
    pub weather: WeatherConfig,
    pub server: ServerConfig,
}

/// Pricing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FareConfig {
    pub per_km_rate: f64,
    pub rain_multiplier: f64,
    pub night_surcharge: f64,
    /// First hour (local clock) of the night window; the window ends at 06:00.
    pub night_start_hour: u32,
    pub minimum_fare: f64,
    /// Offset of the local clock from UTC, in minutes.
    pub utc_offset_minutes: i32,
}

impl Default for FareConfig {
    fn default() -> Self {
        Self {
            per_km_rate: 5.0,
            rain_multiplier: 1.3,
            night_surcharge: 15.0,
            night_start_hour: 22,
            minimum_fare: 20.0,
            utc_offset_minutes: 0,
        }
    }
}

/// Candidate ranking and offer chain parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub max_candidates: usize,
    pub max_radius_meters: f64,
    /// Seconds an offer may stay unanswered before the chain moves on.
    /// Unset means offers never expire.
    pub offer_ttl_secs: Option<u64>,
    /// How often the expiry sweep runs when `offer_ttl_secs` is set.
    pub expiry_sweep_secs: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_candidates: 10,
            max_radius_meters: 5000.0,
            offer_ttl_secs: None,
            expiry_sweep_secs: 5,
        }
    }
}

impl ChainConfig {
    pub fn offer_ttl(&self) -> Option<chrono::Duration> {
        self.offer_ttl_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .map(chrono::Duration::seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    /// OpenWeatherMap API key. Empty disables the lookup.
    pub api_key: String,
    pub base_url: String,
    pub timeout_secs: u64,
    pub cache_ttl_secs: u64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openweathermap.org".to_string(),
            timeout_secs: 5,
            cache_ttl_secs: 300,
        }
    }
}

impl WeatherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
        }
    }
}

impl DispatchConfig {
    /// Loads defaults, then `.env`, then `DISPATCH__*` environment overrides.
    pub fn load() -> Result<Self, DispatchError> {
        dotenv::dotenv().ok();
        let settings = ::config::Config::builder()
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| DispatchError::Validation(format!("failed to read configuration: {}", e)))?;
        let loaded: DispatchConfig = settings
            .try_deserialize()
            .map_err(|e| DispatchError::Validation(format!("invalid configuration: {}", e)))?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        let fare = &self.fare;
        if !is_positive(fare.per_km_rate) {
            return Err(DispatchError::Validation("fare.per_km_rate must be positive".into()));
        }
        if !is_non_negative(fare.minimum_fare) {
            return Err(DispatchError::Validation("fare.minimum_fare must not be negative".into()));
        }
        if !is_non_negative(fare.night_surcharge) {
            return Err(DispatchError::Validation("fare.night_surcharge must not be negative".into()));
        }
        if !fare.rain_multiplier.is_finite() || fare.rain_multiplier < 1.0 {
            return Err(DispatchError::Validation("fare.rain_multiplier must be at least 1.0".into()));
        }
        if fare.night_start_hour > 23 {
            return Err(DispatchError::Validation("fare.night_start_hour must be within 0..=23".into()));
        }
        if fare.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(DispatchError::Validation("fare.utc_offset_minutes must be under a day".into()));
        }
        if self.chain.max_candidates == 0 {
            return Err(DispatchError::Validation("chain.max_candidates must be at least 1".into()));
        }
        if !is_positive(self.chain.max_radius_meters) {
            return Err(DispatchError::Validation("chain.max_radius_meters must be positive".into()));
        }
        if self.chain.offer_ttl_secs == Some(0) {
            return Err(DispatchError::Validation("chain.offer_ttl_secs must be positive when set".into()));
        }
        Ok(())
    }
}

fn is_positive(v: f64) -> bool {
    v.is_finite() && v > 0.0
}

fn is_non_negative(v: f64) -> bool {
    v.is_finite() && v >= 0.0
}
