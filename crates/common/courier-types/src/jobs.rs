use crate::geo::GeoPoint;
use crate::identity::{CourierId, CustomerId, MerchantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a delivery job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Authoritative lifecycle status of a job.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Created,
    Pending,
    Assigned,
    PickedUp,
    Completed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Canceled)
    }

    /// Statuses during which a courier is carrying out the job.
    pub fn is_active_delivery(&self) -> bool {
        matches!(self, JobStatus::Assigned | JobStatus::PickedUp)
    }
}

/// Weather condition reported alongside the multiplier that was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WeatherCondition {
    Normal,
    Rainy,
    Unknown,
}

/// Immutable priced breakdown of a delivery.
///
/// Every intermediate value is kept so a committed price can be audited
/// after the fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FareQuote {
    /// Great-circle distance, rounded to 2 decimals.
    pub distance_km: f64,
    pub base_fare: f64,
    pub weather_multiplier: f64,
    pub weather_condition: WeatherCondition,
    pub night_surcharge: f64,
    /// Final amount, floored at the minimum fare and rounded to 2 decimals.
    pub total_fare: f64,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OfferStatus {
    Sent,
    Accepted,
    Rejected,
    /// Closed without a response, either by the offer expiry or because the
    /// chain was advanced past it.
    Expired,
}

/// One notification of a job to one candidate courier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub job_id: JobId,
    pub courier_id: CourierId,
    pub sequence: usize,
    pub status: OfferStatus,
    pub sent_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl Offer {
    pub fn sent(job_id: JobId, courier_id: CourierId, sequence: usize, at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            courier_id,
            sequence,
            status: OfferStatus::Sent,
            sent_at: at,
            responded_at: None,
        }
    }

    pub fn is_outstanding(&self) -> bool {
        self.status == OfferStatus::Sent
    }

    pub fn close(&mut self, status: OfferStatus, at: DateTime<Utc>) {
        self.status = status;
        self.responded_at = Some(at);
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    CardTerminal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub job_id: JobId,
    pub amount: f64,
    pub method: PaymentMethod,
    pub verified_at: DateTime<Utc>,
}

/// A customer's rating of the courier that delivered a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    pub job_id: JobId,
    pub rater: CustomerId,
    pub courier_id: CourierId,
    pub score: u8,
    pub comment: Option<String>,
    pub rated_at: DateTime<Utc>,
}

/// A delivery request from origination to completion or cancellation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub merchant_id: MerchantId,
    pub customer_id: Option<CustomerId>,
    pub courier_id: Option<CourierId>,
    pub origin: GeoPoint,
    pub destination: GeoPoint,
    pub destination_label: String,
    pub note: Option<String>,
    pub fare: FareQuote,
    pub status: JobStatus,
    /// Index into the last ranked candidate list that received an offer.
    /// Never decreases.
    pub offer_cursor: usize,
    pub offers: Vec<Offer>,
    pub payment: Option<PaymentRecord>,
    pub rating: Option<Rating>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A freshly created job that has not been dispatched yet.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        merchant_id: MerchantId,
        customer_id: Option<CustomerId>,
        origin: GeoPoint,
        destination: GeoPoint,
        destination_label: impl Into<String>,
        note: Option<String>,
        fare: FareQuote,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            merchant_id,
            customer_id,
            courier_id: None,
            origin,
            destination,
            destination_label: destination_label.into(),
            note,
            fare,
            status: JobStatus::Created,
            offer_cursor: 0,
            offers: Vec::new(),
            payment: None,
            rating: None,
            created_at,
            assigned_at: None,
            picked_up_at: None,
            delivered_at: None,
            canceled_at: None,
        }
    }

    /// The offer at the current sequence position, if one was made.
    pub fn current_offer(&self) -> Option<&Offer> {
        self.offers.iter().rev().find(|o| o.sequence == self.offer_cursor)
    }

    pub fn current_offer_mut(&mut self) -> Option<&mut Offer> {
        let cursor = self.offer_cursor;
        self.offers.iter_mut().rev().find(|o| o.sequence == cursor)
    }
}
