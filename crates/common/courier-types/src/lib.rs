pub mod error;
pub mod events;
pub mod fleet;
pub mod geo;
pub mod identity;
pub mod jobs;

pub use error::ParseError;
pub use events::{DispatchEvent, OutboundEvent};
pub use fleet::{AgentAvailability, AgentStatus, CourierProfile, RankedCandidate, VehicleKind};
pub use geo::GeoPoint;
pub use identity::{ChannelId, CourierId, CustomerId, MerchantId, Participant};
pub use jobs::{
    FareQuote, Job, JobId, JobStatus, Offer, OfferStatus, PaymentMethod, PaymentRecord, Rating,
    WeatherCondition,
};
