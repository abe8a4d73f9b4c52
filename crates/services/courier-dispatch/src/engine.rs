use crate::clock::Clock;
use crate::config::ChainConfig;
use crate::error::{DispatchError, Result};
use crate::fare::FareEngine;
use crate::fleet::{CandidateRanker, FleetDirectory};
use crate::lifecycle::Lifecycle;
use crate::offer_chain::{ChainResult, Dispatch, JobResponse, OfferChain, ResponseOutcome};
use crate::store::JobStore;
use chrono::{DateTime, Utc};
use courier_types::{
    AgentAvailability, AgentStatus, ChannelId, CourierId, CustomerId, DispatchEvent, FareQuote, GeoPoint, Job,
    JobId, JobStatus, MerchantId, OutboundEvent, PaymentMethod, PaymentRecord, Rating, VehicleKind,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const MAX_LABEL_CHARS: usize = 200;
const MAX_NOTE_CHARS: usize = 1000;
/// How many jobs a merchant's history shows.
pub const MERCHANT_HISTORY_LIMIT: usize = 50;

/// A merchant's request for a delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub merchant_id: MerchantId,
    #[serde(default)]
    pub customer_id: Option<CustomerId>,
    pub origin: GeoPoint,
    pub destination: GeoPoint,
    pub destination_label: String,
    #[serde(default)]
    pub note: Option<String>,
}

/// An offer waiting for a courier's answer, as shown to that courier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOffer {
    pub job_id: JobId,
    pub sequence: usize,
    pub origin: GeoPoint,
    pub destination: GeoPoint,
    pub destination_label: String,
    pub total_fare: f64,
    pub sent_at: DateTime<Utc>,
}

pub fn validate_point(name: &str, point: GeoPoint) -> Result<()> {
    if !point.is_valid() {
        return Err(DispatchError::Validation(format!(
            "{} must have latitude in [-90, 90] and longitude in [-180, 180], got {}",
            name, point
        )));
    }
    Ok(())
}

impl NewJob {
    pub fn validate(&self) -> Result<()> {
        validate_point("origin", self.origin)?;
        validate_point("destination", self.destination)?;
        let label = self.destination_label.trim();
        if label.is_empty() {
            return Err(DispatchError::Validation("destination_label must not be empty".into()));
        }
        if label.chars().count() > MAX_LABEL_CHARS {
            return Err(DispatchError::Validation(format!(
                "destination_label must be at most {} characters",
                MAX_LABEL_CHARS
            )));
        }
        if self.note.as_ref().is_some_and(|n| n.chars().count() > MAX_NOTE_CHARS) {
            return Err(DispatchError::Validation(format!(
                "note must be at most {} characters",
                MAX_NOTE_CHARS
            )));
        }
        Ok(())
    }
}

/// Owns the job records and runs every chain and lifecycle step under the
/// affected job's lock. Returns the events to publish; never publishes them.
pub struct DispatchEngine {
    store: Arc<JobStore>,
    fare: Arc<FareEngine>,
    fleet: Arc<dyn FleetDirectory>,
    chain: OfferChain,
    lifecycle: Lifecycle,
    clock: Arc<dyn Clock>,
    offer_ttl: Option<chrono::Duration>,
}

impl DispatchEngine {
    pub fn new(
        fare: Arc<FareEngine>,
        ranker: Arc<dyn CandidateRanker>,
        fleet: Arc<dyn FleetDirectory>,
        clock: Arc<dyn Clock>,
        config: ChainConfig,
    ) -> Self {
        let offer_ttl = config.offer_ttl();
        Self {
            store: Arc::new(JobStore::new()),
            fare,
            chain: OfferChain::new(ranker, fleet.clone(), config),
            lifecycle: Lifecycle::new(fleet.clone()),
            fleet,
            clock,
            offer_ttl,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub async fn quote(&self, origin: GeoPoint, destination: GeoPoint) -> Result<FareQuote> {
        validate_point("origin", origin)?;
        validate_point("destination", destination)?;
        Ok(self.fare.quote(origin, destination, self.clock.now()).await)
    }

    /// Prices the job, starts its offer chain and stores it.
    ///
    /// A job nobody can take is still stored (as canceled) and returned with
    /// its fare.
    pub async fn create_job(&self, request: NewJob) -> Result<Dispatch<Job>> {
        request.validate()?;
        let now = self.clock.now();
        let fare = self.fare.quote(request.origin, request.destination, now).await;

        let mut job = Job::new(
            request.merchant_id,
            request.customer_id,
            request.origin,
            request.destination,
            request.destination_label.trim(),
            request.note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
            fare,
            now,
        );
        tracing::info!("Creating job {} for merchant {}", job.id, job.merchant_id);

        let candidates = self.chain.rank(job.origin).await;
        let started = self.chain.start_chain(&mut job, &candidates, now)?;

        // Not shared before this point, so no other step can see it half-started
        self.store.insert(job.clone()).await;
        Ok(started.map(|_| job))
    }

    pub async fn job(&self, job_id: JobId) -> Result<Job> {
        self.store.snapshot(job_id).await
    }

    pub async fn respond(
        &self,
        job_id: JobId,
        courier_id: CourierId,
        response: JobResponse,
    ) -> Result<Dispatch<ResponseOutcome>> {
        let handle = self.store.handle(job_id).await?;
        let mut job = handle.lock().await;
        let result = self
            .chain
            .record_response(&mut job, courier_id, response, self.clock.now())
            .await;
        self.store.retire_if_settled(&job).await;
        result
    }

    pub async fn advance(&self, job_id: JobId, position: usize) -> Result<Dispatch<ChainResult>> {
        let handle = self.store.handle(job_id).await?;
        let mut job = handle.lock().await;
        let result = self.chain.advance(&mut job, position, self.clock.now()).await;
        self.store.retire_if_settled(&job).await;
        result
    }

    pub async fn confirm_pickup(&self, job_id: JobId, courier_id: CourierId) -> Result<Dispatch<()>> {
        let handle = self.store.handle(job_id).await?;
        let mut job = handle.lock().await;
        self.lifecycle.confirm_pickup(&mut job, courier_id, self.clock.now())
    }

    pub async fn confirm_delivery(
        &self,
        job_id: JobId,
        courier_id: CourierId,
        method: PaymentMethod,
    ) -> Result<Dispatch<PaymentRecord>> {
        let handle = self.store.handle(job_id).await?;
        let mut job = handle.lock().await;
        let result = self
            .lifecycle
            .confirm_delivery(&mut job, courier_id, method, self.clock.now())
            .await;
        self.store.retire_if_settled(&job).await;
        result
    }

    pub async fn rate(
        &self,
        job_id: JobId,
        customer_id: CustomerId,
        score: u8,
        comment: Option<String>,
    ) -> Result<Dispatch<Rating>> {
        let handle = self.store.handle(job_id).await?;
        let mut job = handle.lock().await;
        self.lifecycle
            .rate(&mut job, customer_id, score, comment, self.clock.now())
            .await
    }

    /// Outstanding offers addressed to `courier_id`, newest first.
    pub async fn pending_offers_for(&self, courier_id: CourierId) -> Vec<PendingOffer> {
        let mut offers = Vec::new();
        for handle in self.store.open_handles().await {
            let job = handle.lock().await;
            if job.status != JobStatus::Pending {
                continue;
            }
            if let Some(offer) = job
                .current_offer()
                .filter(|o| o.courier_id == courier_id && o.is_outstanding())
            {
                offers.push(PendingOffer {
                    job_id: job.id,
                    sequence: offer.sequence,
                    origin: job.origin,
                    destination: job.destination,
                    destination_label: job.destination_label.clone(),
                    total_fare: job.fare.total_fare,
                    sent_at: offer.sent_at,
                });
            }
        }
        offers.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));
        offers
    }

    /// The job the courier is currently carrying out, if any.
    pub async fn active_job_for(&self, courier_id: CourierId) -> Option<Job> {
        for handle in self.store.open_handles().await {
            let job = handle.lock().await;
            if job.status.is_active_delivery() && job.courier_id == Some(courier_id) {
                return Some(job.clone());
            }
        }
        None
    }

    /// The merchant's most recent jobs, newest first.
    pub async fn jobs_for_merchant(&self, merchant_id: MerchantId) -> Vec<Job> {
        self.store.merchant_jobs(merchant_id, MERCHANT_HISTORY_LIMIT).await
    }

    /// The customer's newest job that is still waiting for or out for delivery.
    pub async fn active_job_for_customer(&self, customer_id: CustomerId) -> Option<Job> {
        let mut newest: Option<Job> = None;
        for handle in self.store.open_handles().await {
            let job = handle.lock().await;
            if job.customer_id != Some(customer_id) || job.status.is_terminal() {
                continue;
            }
            if newest.as_ref().map_or(true, |n| job.created_at > n.created_at) {
                newest = Some(job.clone());
            }
        }
        newest
    }

    /// Moves every chain whose current offer outlived the configured TTL.
    pub async fn expire_stale_offers(&self) -> Vec<OutboundEvent> {
        let Some(ttl) = self.offer_ttl else {
            return Vec::new();
        };
        let now = self.clock.now();
        let mut events = Vec::new();
        for handle in self.store.open_handles().await {
            let mut job = handle.lock().await;
            match self.chain.expire_if_stale(&mut job, ttl, now).await {
                Ok(Some(dispatch)) => events.extend(dispatch.events),
                Ok(None) => {}
                Err(e) => tracing::error!("Failed to expire offer of job {}: {}", job.id, e),
            }
            self.store.retire_if_settled(&job).await;
        }
        events
    }

    pub async fn register_courier(&self, courier_id: CourierId, vehicle: VehicleKind) -> Result<AgentAvailability> {
        self.fleet
            .register(AgentAvailability::new(courier_id, vehicle))
            .await
    }

    pub async fn set_availability(&self, courier_id: CourierId, status: AgentStatus) -> Result<AgentAvailability> {
        let record = self.fleet.set_status(courier_id, status).await?;
        tracing::info!("Courier {} is now {}", courier_id, record.status);
        Ok(record)
    }

    /// Records the courier's position and, while it carries a job, tells the
    /// job's merchant and customer.
    pub async fn update_location(&self, courier_id: CourierId, location: GeoPoint) -> Result<Dispatch<()>> {
        validate_point("location", location)?;
        let now = self.clock.now();
        self.fleet.update_location(courier_id, location, now).await?;

        let mut events = Vec::new();
        if let Some(job) = self.active_job_for(courier_id).await {
            let event = DispatchEvent::CourierLocation {
                job_id: job.id,
                location,
                at: now,
            };
            events.push(OutboundEvent::new(ChannelId::merchant(job.merchant_id), event.clone()));
            if let Some(customer_id) = job.customer_id {
                events.push(OutboundEvent::new(ChannelId::customer(customer_id), event));
            }
        }
        Ok(Dispatch::new((), events))
    }
}
