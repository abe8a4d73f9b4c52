use crate::geo::GeoPoint;
use crate::identity::CourierId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

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
pub enum AgentStatus {
    Available,
    Busy,
    Offline,
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
pub enum VehicleKind {
    Motorcycle,
    Bicycle,
    Car,
    OnFoot,
}

/// Live availability record of one courier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAvailability {
    pub courier_id: CourierId,
    pub status: AgentStatus,
    pub active: bool,
    pub vehicle: VehicleKind,
    pub location: Option<GeoPoint>,
    pub location_updated_at: Option<DateTime<Utc>>,
    pub completed_deliveries: u64,
    pub rating_count: u64,
    pub rating_sum: u64,
}

impl AgentAvailability {
    /// A new active courier with no known location, initially offline.
    pub fn new(courier_id: CourierId, vehicle: VehicleKind) -> Self {
        Self {
            courier_id,
            status: AgentStatus::Offline,
            active: true,
            vehicle,
            location: None,
            location_updated_at: None,
            completed_deliveries: 0,
            rating_count: 0,
            rating_sum: 0,
        }
    }

    pub fn average_rating(&self) -> Option<f64> {
        if self.rating_count == 0 {
            None
        } else {
            Some(self.rating_sum as f64 / self.rating_count as f64)
        }
    }

    pub fn profile(&self) -> CourierProfile {
        CourierProfile {
            vehicle: self.vehicle,
            completed_deliveries: self.completed_deliveries,
            average_rating: self.average_rating(),
        }
    }
}

/// The public part of a courier record shown alongside a ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourierProfile {
    pub vehicle: VehicleKind,
    pub completed_deliveries: u64,
    pub average_rating: Option<f64>,
}

/// One entry of a proximity-ordered candidate list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub courier_id: CourierId,
    /// Distance from the courier to the job origin.
    pub distance_km: f64,
    pub profile: CourierProfile,
}
