// Expose modules
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod fare;
pub mod fleet;
pub mod http;
pub mod lifecycle;
pub mod metrics;
pub mod notifier;
pub mod offer_chain;
pub mod service;
pub mod session;
pub mod store;
pub mod weather;
pub mod weather_cache;

#[cfg(test)]
mod offer_chain_tests;

// Re-export the main entry points
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::DispatchConfig;
pub use engine::{DispatchEngine, NewJob, PendingOffer};
pub use error::DispatchError;
pub use fare::FareEngine;
pub use fleet::{CandidateRanker, FleetDirectory, InMemoryFleet};
pub use notifier::{BroadcastNotifier, EventNotifier};
pub use offer_chain::{ChainResult, Dispatch, JobResponse, OfferChain, ResponseOutcome};
pub use service::DispatchService;
pub use session::{SessionGuard, SessionRegistry};
pub use weather::{OpenWeatherLookup, WeatherLookup, WeatherReading};
pub use weather_cache::CachingWeatherLookup;
