use crate::error::{DispatchError, Result};
use crate::fare::haversine_km;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_types::{AgentAvailability, AgentStatus, CourierId, GeoPoint, RankedCandidate};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Produces the proximity-ordered list of couriers eligible for an offer.
#[async_trait]
pub trait CandidateRanker: Send + Sync {
    /// Available, active couriers within `max_radius_meters` of `origin`,
    /// nearest first, at most `max_results` of them.
    async fn rank(
        &self,
        origin: GeoPoint,
        max_results: usize,
        max_radius_meters: f64,
    ) -> anyhow::Result<Vec<RankedCandidate>>;
}

/// Availability records of the fleet.
#[async_trait]
pub trait FleetDirectory: Send + Sync {
    /// Insert a courier or update its vehicle, keeping its history.
    async fn register(&self, record: AgentAvailability) -> Result<AgentAvailability>;

    async fn get(&self, courier_id: CourierId) -> Option<AgentAvailability>;

    /// Atomically move a courier that is not busy to `busy`.
    async fn claim(&self, courier_id: CourierId) -> Result<()>;

    /// Return a busy courier to `available` after a delivery.
    async fn release(&self, courier_id: CourierId) -> Result<()>;

    /// Set `available` or `offline`. A busy courier keeps its status.
    async fn set_status(&self, courier_id: CourierId, status: AgentStatus) -> Result<AgentAvailability>;

    async fn update_location(&self, courier_id: CourierId, location: GeoPoint, at: DateTime<Utc>) -> Result<()>;

    async fn record_rating(&self, courier_id: CourierId, score: u8) -> Result<()>;
}

fn unknown_courier(courier_id: CourierId) -> DispatchError {
    DispatchError::NotFound(format!("courier {} is not registered", courier_id))
}

/// In-memory fleet acting as both the directory and the ranker.
#[derive(Default)]
pub struct InMemoryFleet {
    couriers: RwLock<HashMap<CourierId, AgentAvailability>>,
}

impl InMemoryFleet {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CandidateRanker for InMemoryFleet {
    async fn rank(
        &self,
        origin: GeoPoint,
        max_results: usize,
        max_radius_meters: f64,
    ) -> anyhow::Result<Vec<RankedCandidate>> {
        let couriers = self.couriers.read().await;
        let max_radius_km = max_radius_meters / 1000.0;

        let mut candidates: Vec<RankedCandidate> = couriers
            .values()
            .filter(|c| c.active && c.status == AgentStatus::Available)
            .filter_map(|c| {
                let location = c.location?;
                let distance_km = haversine_km(origin, location);
                (distance_km <= max_radius_km).then(|| RankedCandidate {
                    courier_id: c.courier_id,
                    distance_km,
                    profile: c.profile(),
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then_with(|| a.courier_id.cmp(&b.courier_id))
        });
        candidates.truncate(max_results);

        tracing::debug!(
            "Ranked {} candidate(s) within {}m of {}",
            candidates.len(),
            max_radius_meters,
            origin
        );
        Ok(candidates)
    }
}

#[async_trait]
impl FleetDirectory for InMemoryFleet {
    async fn register(&self, record: AgentAvailability) -> Result<AgentAvailability> {
        let mut couriers = self.couriers.write().await;
        let entry = couriers
            .entry(record.courier_id)
            .and_modify(|existing| {
                existing.vehicle = record.vehicle;
                existing.active = record.active;
            })
            .or_insert(record);
        tracing::info!("Courier {} registered ({}, {})", entry.courier_id, entry.vehicle, entry.status);
        Ok(entry.clone())
    }

    async fn get(&self, courier_id: CourierId) -> Option<AgentAvailability> {
        self.couriers.read().await.get(&courier_id).cloned()
    }

    async fn claim(&self, courier_id: CourierId) -> Result<()> {
        let mut couriers = self.couriers.write().await;
        let courier = couriers.get_mut(&courier_id).ok_or_else(|| unknown_courier(courier_id))?;
        if courier.status == AgentStatus::Busy {
            return Err(DispatchError::Conflict(format!(
                "courier {} is already on an active delivery",
                courier_id
            )));
        }
        courier.status = AgentStatus::Busy;
        Ok(())
    }

    async fn release(&self, courier_id: CourierId) -> Result<()> {
        let mut couriers = self.couriers.write().await;
        let courier = couriers.get_mut(&courier_id).ok_or_else(|| unknown_courier(courier_id))?;
        courier.status = AgentStatus::Available;
        courier.completed_deliveries += 1;
        Ok(())
    }

    async fn set_status(&self, courier_id: CourierId, status: AgentStatus) -> Result<AgentAvailability> {
        if status == AgentStatus::Busy {
            return Err(DispatchError::Validation(
                "busy is set by accepting an offer, not directly".to_string(),
            ));
        }
        let mut couriers = self.couriers.write().await;
        let courier = couriers.get_mut(&courier_id).ok_or_else(|| unknown_courier(courier_id))?;
        if courier.status == AgentStatus::Busy {
            return Err(DispatchError::Conflict(format!(
                "courier {} is on an active delivery",
                courier_id
            )));
        }
        courier.status = status;
        Ok(courier.clone())
    }

    async fn update_location(&self, courier_id: CourierId, location: GeoPoint, at: DateTime<Utc>) -> Result<()> {
        let mut couriers = self.couriers.write().await;
        let courier = couriers.get_mut(&courier_id).ok_or_else(|| unknown_courier(courier_id))?;
        courier.location = Some(location);
        courier.location_updated_at = Some(at);
        Ok(())
    }

    async fn record_rating(&self, courier_id: CourierId, score: u8) -> Result<()> {
        let mut couriers = self.couriers.write().await;
        let courier = couriers.get_mut(&courier_id).ok_or_else(|| unknown_courier(courier_id))?;
        courier.rating_count += 1;
        courier.rating_sum += u64::from(score);
        Ok(())
    }
}
