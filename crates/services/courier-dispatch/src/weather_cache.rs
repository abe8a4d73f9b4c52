use anyhow::Result;
use courier_types::GeoPoint;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use crate::metrics;
use crate::weather::{WeatherLookup, WeatherReading};

/// Readings are shared between points that fall in the same cell of
/// 0.01 degrees (about a kilometre).
const CELL_SCALE: f64 = 100.0;

type Cell = (i64, i64);

fn cell_of(point: GeoPoint) -> Cell {
    (
        (point.lat * CELL_SCALE).round() as i64,
        (point.lon * CELL_SCALE).round() as i64,
    )
}

/// Cache entry for a weather reading
struct CacheEntry {
    reading: WeatherReading,
    fetched_at: Instant,
}

/// Caching weather lookup that wraps another lookup
pub struct CachingWeatherLookup {
    /// The lookup to use on cache misses
    inner: Arc<dyn WeatherLookup>,
    cache: RwLock<HashMap<Cell, CacheEntry>>,
    ttl: Duration,
}

impl CachingWeatherLookup {
    pub fn new(inner: Arc<dyn WeatherLookup>, ttl: Duration) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Purge expired entries from the cache
    pub fn purge_expired(&self) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        cache.retain(|_, entry| now.duration_since(entry.fetched_at) < self.ttl);
        metrics::update_weather_cache_size(cache.len());
    }

    fn cached(&self, cell: Cell) -> Option<WeatherReading> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache
            .get(&cell)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.reading)
    }
}

#[async_trait::async_trait]
impl WeatherLookup for CachingWeatherLookup {
    async fn multiplier(&self, point: GeoPoint) -> Result<WeatherReading> {
        let cell = cell_of(point);
        if let Some(reading) = self.cached(cell) {
            tracing::debug!("Cache hit for weather at {}", point);
            return Ok(reading);
        }

        tracing::debug!("Cache miss for weather at {}", point);
        // Failures are not cached so the next quote retries.
        let reading = self.inner.multiplier(point).await?;

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(cell, CacheEntry { reading, fetched_at: Instant::now() });
        metrics::update_weather_cache_size(cache.len());

        Ok(reading)
    }
}

/// Periodically removes expired readings.
pub fn spawn_cache_cleanup_task(cache: Arc<CachingWeatherLookup>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            cache.purge_expired();
            tracing::debug!("Purged expired weather cache entries");
        }
    })
}
