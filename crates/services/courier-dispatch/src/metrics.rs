use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use once_cell::sync::Lazy;
use std::sync::Mutex;

// Registry holds all our metrics
static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| {
    Mutex::new(Registry::new())
});

static QUOTES_COMPUTED: Lazy<IntCounter> = Lazy::new(|| {
    let quotes_computed = IntCounter::new(
        "dispatch_quotes_computed_total",
        "Number of fare quotes produced",
    ).expect("Failed to create quotes_computed metric");

    register_metric(&quotes_computed);
    quotes_computed
});

static FARE_TOTAL_HISTOGRAM: Lazy<Histogram> = Lazy::new(|| {
    let fare_total_histogram = Histogram::with_opts(
        HistogramOpts::new(
            "dispatch_fare_total",
            "Distribution of quoted total fares",
        )
        .buckets(vec![20.0, 30.0, 40.0, 50.0, 75.0, 100.0, 150.0, 250.0, 500.0])
    ).expect("Failed to create fare_total_histogram metric");

    register_metric(&fare_total_histogram);
    fare_total_histogram
});

static WEATHER_FALLBACKS: Lazy<IntCounterVec> = Lazy::new(|| {
    let weather_fallbacks = IntCounterVec::new(
        Opts::new(
            "dispatch_weather_fallback_total",
            "Quotes that fell back to the neutral weather multiplier, by cause",
        ),
        &["cause"], // "error", "timeout", "unconfigured"
    ).expect("Failed to create weather_fallbacks metric");

    register_metric(&weather_fallbacks);
    weather_fallbacks
});

static OFFER_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    let offer_outcomes = IntCounterVec::new(
        Opts::new(
            "dispatch_offers_total",
            "Offers created and closed, by outcome",
        ),
        &["outcome"], // "sent", "accepted", "rejected", "expired"
    ).expect("Failed to create offer_outcomes metric");

    register_metric(&offer_outcomes);
    offer_outcomes
});

static JOBS_CANCELED: Lazy<IntCounterVec> = Lazy::new(|| {
    let jobs_canceled = IntCounterVec::new(
        Opts::new(
            "dispatch_jobs_canceled_total",
            "Jobs canceled for lack of a courier",
        ),
        &["reason"], // "no_candidates", "exhausted"
    ).expect("Failed to create jobs_canceled metric");

    register_metric(&jobs_canceled);
    jobs_canceled
});

static JOBS_COMPLETED: Lazy<IntCounter> = Lazy::new(|| {
    let jobs_completed = IntCounter::new(
        "dispatch_jobs_completed_total",
        "Jobs delivered and paid",
    ).expect("Failed to create jobs_completed metric");

    register_metric(&jobs_completed);
    jobs_completed
});

static WEATHER_CACHE_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    let weather_cache_size = IntGauge::new(
        "dispatch_weather_cache_size",
        "Number of entries in the weather reading cache",
    ).expect("Failed to create weather_cache_size metric");

    register_metric(&weather_cache_size);
    weather_cache_size
});

static LIVE_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    let live_sessions = IntGauge::new(
        "dispatch_live_sessions",
        "Number of connected live sessions",
    ).expect("Failed to create live_sessions metric");

    register_metric(&live_sessions);
    live_sessions
});

static OPEN_JOBS: Lazy<IntGauge> = Lazy::new(|| {
    let open_jobs = IntGauge::new(
        "dispatch_open_jobs",
        "Number of jobs neither completed nor canceled",
    ).expect("Failed to create open_jobs metric");

    register_metric(&open_jobs);
    open_jobs
});

static NOTIFIER_CHANNELS: Lazy<IntGauge> = Lazy::new(|| {
    let notifier_channels = IntGauge::new(
        "dispatch_notifier_channels",
        "Number of broadcast channels held by the notifier",
    ).expect("Failed to create notifier_channels metric");

    register_metric(&notifier_channels);
    notifier_channels
});

/// Helper function to register a metric with the registry
fn register_metric<M: prometheus::core::Collector + Clone + 'static>(metric: &M) {
    let registry = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        tracing::warn!("Failed to register metric: {}", e);
    }
}

/// Record a produced quote and its total
pub fn record_quote(total_fare: f64) {
    QUOTES_COMPUTED.inc();
    FARE_TOTAL_HISTOGRAM.observe(total_fare);
}

/// Record a neutral weather fallback
pub fn record_weather_fallback(cause: &str) {
    WEATHER_FALLBACKS.with_label_values(&[cause]).inc();
}

pub fn record_offer(outcome: &str) {
    OFFER_OUTCOMES.with_label_values(&[outcome]).inc();
}

pub fn record_job_canceled(reason: &str) {
    JOBS_CANCELED.with_label_values(&[reason]).inc();
}

pub fn record_job_completed() {
    JOBS_COMPLETED.inc();
}

pub fn update_weather_cache_size(size: usize) {
    WEATHER_CACHE_SIZE.set(size as i64);
}

pub fn update_live_sessions(count: usize) {
    LIVE_SESSIONS.set(count as i64);
}

pub fn update_open_jobs(count: usize) {
    OPEN_JOBS.set(count as i64);
}

pub fn update_notifier_channels(count: usize) {
    NOTIFIER_CHANNELS.set(count as i64);
}

/// Get the registry of all metrics
pub fn get_registry() -> Registry {
    REGISTRY.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Render every registered metric in the Prometheus text format.
pub fn render() -> String {
    let families = get_registry().gather();
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
