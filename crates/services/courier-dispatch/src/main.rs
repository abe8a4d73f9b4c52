use anyhow::Context;
use courier_dispatch::{
    http::{self, AppState},
    service, weather_cache, BroadcastNotifier, CachingWeatherLookup, DispatchConfig, DispatchEngine,
    DispatchService, FareEngine, InMemoryFleet, OpenWeatherLookup, SessionRegistry, SystemClock, WeatherLookup,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DispatchConfig::load().context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "courier_dispatch=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let weather: Option<Arc<dyn WeatherLookup>> = if config.weather.is_configured() {
        let lookup = OpenWeatherLookup::new(&config.weather, config.fare.rain_multiplier)?;
        let ttl = Duration::from_secs(config.weather.cache_ttl_secs);
        let cache = Arc::new(CachingWeatherLookup::new(Arc::new(lookup), ttl));
        weather_cache::spawn_cache_cleanup_task(cache.clone(), ttl.max(Duration::from_secs(1)));
        tracing::info!("Using weather service at: {}", config.weather.base_url);
        Some(cache as Arc<dyn WeatherLookup>)
    } else {
        tracing::warn!("No weather API key configured; quotes use the neutral multiplier");
        None
    };

    let fleet = Arc::new(InMemoryFleet::new());
    let fare = Arc::new(FareEngine::new(config.fare.clone(), weather, config.weather.timeout()));
    let engine = DispatchEngine::new(
        fare,
        fleet.clone(),
        fleet.clone(),
        Arc::new(SystemClock),
        config.chain.clone(),
    );
    let notifier = BroadcastNotifier::new();
    let service = Arc::new(DispatchService::new(engine, Arc::new(notifier.clone())));

    if let Some(ttl) = config.chain.offer_ttl_secs {
        tracing::info!("Unanswered offers expire after {}s", ttl);
        service::spawn_expiry_task(service.clone(), Duration::from_secs(config.chain.expiry_sweep_secs.max(1)));
    }

    let app = http::router(AppState {
        service,
        notifier,
        sessions: SessionRegistry::new(fleet),
    });

    let addr = config.server.listen_addr;
    tracing::info!("Courier dispatch listening on {}", addr);
    tracing::info!("Live channel available at ws://{}/ws", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await?;
    Ok(())
}
